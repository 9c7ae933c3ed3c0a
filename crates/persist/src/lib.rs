//! Butler persistence: checksum records of applied configuration payloads.
//! Records live in a config map owned by the instance, one key per payload.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine as _;
use butler_core::{labels, DesiredState, Result};
use butler_kubehub::Platform;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use metrics::counter;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Content digest used for checksum records (base64 of SHA-256).
pub fn digest(content: &str) -> String {
    let hash = Sha256::digest(content.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hash)
}

#[async_trait::async_trait]
pub trait ChecksumStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<String>>;
    async fn put(&self, name: &str, digest: &str) -> Result<()>;
    /// Forget every record, forcing a full re-application.
    async fn clear(&self) -> Result<()>;
}

/// Checksum records kept in `jenkins-operator-checksums-<instance>`, keys
/// prefixed by the payload source (`base-groovy.1-settings.groovy`).
pub struct ConfigMapChecksumStore<P> {
    platform: Arc<P>,
    namespace: String,
    config_map: String,
    labels: BTreeMap<String, String>,
    owner: Option<OwnerReference>,
    source: String,
}

impl<P: Platform> ConfigMapChecksumStore<P> {
    pub fn new(platform: Arc<P>, desired: &DesiredState, source: &str) -> Self {
        Self {
            platform,
            namespace: desired.namespace.clone(),
            config_map: labels::checksum_config_map_name(&desired.name),
            labels: desired.labels.clone(),
            owner: desired.owner.clone(),
            source: source.to_string(),
        }
    }

    fn key(&self, name: &str) -> String { format!("{}.{}", self.source, name) }

    async fn load(&self) -> Result<Option<ConfigMap>> { self.platform.get::<ConfigMap>(&self.namespace, &self.config_map).await }
}

#[async_trait::async_trait]
impl<P: Platform> ChecksumStore for ConfigMapChecksumStore<P> {
    async fn get(&self, name: &str) -> Result<Option<String>> {
        let cm = self.load().await?;
        Ok(cm.and_then(|cm| cm.data).and_then(|mut data| data.remove(&self.key(name))))
    }

    async fn put(&self, name: &str, digest: &str) -> Result<()> {
        let key = self.key(name);
        match self.load().await? {
            None => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.config_map.clone()),
                        namespace: Some(self.namespace.clone()),
                        labels: Some(self.labels.clone()),
                        owner_references: self.owner.clone().map(|o| vec![o]),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(key, digest.to_string())])),
                    ..Default::default()
                };
                self.platform.create(&self.namespace, &cm).await?;
            }
            Some(mut cm) => {
                let data = cm.data.get_or_insert_with(BTreeMap::new);
                if data.get(&key).map(String::as_str) == Some(digest) {
                    return Ok(());
                }
                data.insert(key, digest.to_string());
                self.platform.replace(&self.namespace, &cm).await?;
            }
        }
        counter!("checksum_records_written_total", 1u64);
        debug!(config_map = %self.config_map, payload = %name, "checksum recorded");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let Some(mut cm) = self.load().await? else { return Ok(()) };
        if cm.data.as_ref().map_or(true, BTreeMap::is_empty) {
            return Ok(());
        }
        cm.data = Some(BTreeMap::new());
        self.platform.replace(&self.namespace, &cm).await?;
        debug!(config_map = %self.config_map, "checksum records cleared");
        Ok(())
    }
}
