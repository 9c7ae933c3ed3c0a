//! Butler management API.
//!
//! A [`ManagementClient`] talks to the Jenkins master once its pod reports
//! ready: it lists installed plugins and executes groovy payloads through the
//! script console. Clients are obtained from a [`ClientFactory`] so reconcile
//! code can be exercised against [`FakeManagementClient`].

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use butler_core::{labels, DesiredState, Error, Plugin, Result};
use butler_kubehub::Platform;
use k8s_openapi::api::core::v1::Secret;
use metrics::{counter, histogram};
use serde::Deserialize;
use tracing::{debug, info};

mod fake;

pub use fake::{FakeClientFactory, FakeManagementClient};

#[async_trait::async_trait]
pub trait ManagementClient: Send + Sync {
    /// Every installed plugin, including transitive dependencies.
    async fn fetch_all_plugins(&self) -> Result<Vec<Plugin>>;
    /// Execute one payload; `Err` when the instance rejected or failed it.
    async fn execute_payload(&self, content: &str) -> Result<()>;
}

/// Acquires a client bound to a ready instance. Acquisition fails the cycle.
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, desired: &DesiredState) -> Result<Arc<dyn ManagementClient>>;
}

/// Where the management API is reached.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub cluster_domain: String,
    /// Override for running outside the cluster (e.g. a port-forward).
    pub host: Option<String>,
    pub port: Option<u16>,
    pub timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self { Self { cluster_domain: "cluster.local".into(), host: None, port: None, timeout: Duration::from_secs(30) } }
}

impl ConnectionSettings {
    /// `http://<http service>.<namespace>.svc.<domain>:<port>` unless overridden.
    pub fn base_url(&self, desired: &DesiredState) -> String {
        let host = match &self.host {
            Some(h) => h.clone(),
            None => format!("{}.{}.svc.{}", desired.http_service.name, desired.namespace, self.cluster_domain),
        };
        let port = self.port.map(i32::from).unwrap_or(desired.http_service.port);
        format!("http://{}:{}", host, port)
    }
}

fn http_error(e: reqwest::Error) -> Error { Error::Management(e.to_string()) }

#[derive(Deserialize)]
struct PluginList {
    #[serde(default)]
    plugins: Vec<InstalledPlugin>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstalledPlugin {
    short_name: String,
    version: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Crumb {
    crumb_request_field: String,
    crumb: String,
}

/// Basic-auth client for the Jenkins HTTP API.
pub struct JenkinsHttpClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
}

impl JenkinsHttpClient {
    pub fn new(base_url: impl Into<String>, user: impl Into<String>, password: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build().map_err(http_error)?;
        Ok(Self { http, base_url: base_url.into(), user: user.into(), password: password.into() })
    }

    pub fn base_url(&self) -> &str { &self.base_url }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.get(format!("{}{}", self.base_url, path)).basic_auth(&self.user, Some(&self.password))
    }

    /// Fails unless the API answers an authenticated request.
    pub async fn probe(&self) -> Result<()> {
        let resp = self.get("/api/json").send().await.map_err(http_error)?;
        if !resp.status().is_success() {
            return Err(Error::Management(format!("probe {} returned {}", self.base_url, resp.status())));
        }
        Ok(())
    }

    /// CSRF crumb, or `None` when protection is disabled on the instance.
    async fn crumb(&self) -> Result<Option<Crumb>> {
        let resp = self.get("/crumbIssuer/api/json").send().await.map_err(http_error)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::Management(format!("crumb issuer returned {}", resp.status())));
        }
        Ok(Some(resp.json().await.map_err(http_error)?))
    }
}

/// Appends a print of `verifier`; the console only echoes it when the script ran to completion.
fn verified_script(content: &str, verifier: &str) -> String { format!("{}\nprint(\"{}\")\n", content, verifier) }

#[async_trait::async_trait]
impl ManagementClient for JenkinsHttpClient {
    async fn fetch_all_plugins(&self) -> Result<Vec<Plugin>> {
        let resp = self.get("/pluginManager/api/json?depth=1").send().await.map_err(http_error)?;
        if !resp.status().is_success() {
            return Err(Error::Management(format!("plugin manager returned {}", resp.status())));
        }
        let list: PluginList = resp.json().await.map_err(http_error)?;
        Ok(list.plugins.into_iter().map(|p| Plugin::new(p.short_name, p.version)).collect())
    }

    async fn execute_payload(&self, content: &str) -> Result<()> {
        let t0 = Instant::now();
        let verifier = uuid::Uuid::new_v4().to_string();
        let script = verified_script(content, &verifier);
        let mut req = self
            .http
            .post(format!("{}/scriptText", self.base_url))
            .basic_auth(&self.user, Some(&self.password))
            .form(&[("script", script.as_str())]);
        if let Some(c) = self.crumb().await? {
            req = req.header(c.crumb_request_field, c.crumb);
        }
        let resp = req.send().await.map_err(http_error)?;
        let status = resp.status();
        let output = resp.text().await.map_err(http_error)?;
        histogram!("script_execution_ms", t0.elapsed().as_millis() as f64);
        if !status.is_success() {
            return Err(Error::Management(format!("script console returned {}: {}", status, output.trim())));
        }
        if !output.contains(&verifier) {
            return Err(Error::Management(format!("script did not complete: {}", output.trim())));
        }
        debug!(bytes = content.len(), "script executed");
        Ok(())
    }
}

/// Builds [`JenkinsHttpClient`]s from the operator credentials secret.
pub struct HttpClientFactory<P> {
    platform: Arc<P>,
    settings: ConnectionSettings,
}

impl<P: Platform> HttpClientFactory<P> {
    pub fn new(platform: Arc<P>, settings: ConnectionSettings) -> Self { Self { platform, settings } }

    async fn credentials(&self, desired: &DesiredState) -> Result<(String, String)> {
        let name = labels::credentials_secret_name(&desired.name);
        let secret = self
            .platform
            .get::<Secret>(&desired.namespace, &name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("secret {}/{}", desired.namespace, name)))?;
        let data = secret.data.unwrap_or_default();
        let field = |key: &str| {
            data.get(key)
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                .ok_or_else(|| Error::NotFound(format!("key {} in secret {}", key, name)))
        };
        Ok((field(labels::CREDENTIALS_USER_KEY)?, field(labels::CREDENTIALS_PASSWORD_KEY)?))
    }
}

#[async_trait::async_trait]
impl<P: Platform + 'static> ClientFactory for HttpClientFactory<P> {
    async fn connect(&self, desired: &DesiredState) -> Result<Arc<dyn ManagementClient>> {
        let (user, password) = self.credentials(desired).await?;
        let client = JenkinsHttpClient::new(self.settings.base_url(desired), user, password, self.settings.timeout)?;
        client.probe().await?;
        counter!("management_clients_total", 1u64);
        info!(cr = %desired.name, url = %client.base_url(), "management api reachable");
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butler_core::Jenkins;
    use butler_kubehub::MemoryPlatform;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn desired() -> DesiredState {
        let mut j = Jenkins::new("ci", Default::default());
        j.metadata.namespace = Some("build".into());
        DesiredState::from_jenkins(&j).unwrap()
    }

    #[test]
    fn base_url_defaults_to_service_dns() {
        let s = ConnectionSettings::default();
        assert_eq!(s.base_url(&desired()), "http://jenkins-operator-http-ci.build.svc.cluster.local:8080");
        let s = ConnectionSettings { host: Some("localhost".into()), port: Some(18080), ..Default::default() };
        assert_eq!(s.base_url(&desired()), "http://localhost:18080");
    }

    #[test]
    fn plugin_manager_payload_parses() {
        let body = r#"{"plugins":[{"shortName":"git","version":"4.0.0","active":true},{"shortName":"kubernetes","version":"1.25"}]}"#;
        let list: PluginList = serde_json::from_str(body).unwrap();
        assert_eq!(list.plugins.len(), 2);
        assert_eq!(list.plugins[0].short_name, "git");
    }

    #[test]
    fn verifier_is_printed_last() {
        let s = verified_script("println 'hi'", "abc");
        assert!(s.starts_with("println 'hi'\n"));
        assert!(s.trim_end().ends_with("print(\"abc\")"));
    }

    #[tokio::test]
    async fn missing_credentials_secret_is_not_found() {
        let p = Arc::new(MemoryPlatform::new());
        let f = HttpClientFactory::new(p, ConnectionSettings::default());
        let err = f.connect(&desired()).await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn credentials_are_read_from_secret() {
        let p = Arc::new(MemoryPlatform::new());
        p.insert(
            "build",
            Secret {
                metadata: ObjectMeta { name: Some(labels::credentials_secret_name("ci")), ..Default::default() },
                data: Some(BTreeMap::from([
                    (labels::CREDENTIALS_USER_KEY.to_string(), ByteString(b"jenkins-operator".to_vec())),
                    (labels::CREDENTIALS_PASSWORD_KEY.to_string(), ByteString(b"s3cret".to_vec())),
                ])),
                ..Default::default()
            },
        );
        let f = HttpClientFactory::new(p, ConnectionSettings::default());
        let (user, password) = f.credentials(&desired()).await.unwrap();
        assert_eq!((user.as_str(), password.as_str()), ("jenkins-operator", "s3cret"));
    }
}
