//! HTTP channels: Slack and Microsoft Teams webhooks, Mailgun email relay.
//! Secrets are resolved from the platform on every send.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use butler_core::crd::{MailgunChannel, NotificationConfig, SecretKeyRef};
use butler_core::{NotificationEvent, Severity};
use butler_kubehub::Platform;
use k8s_openapi::api::core::v1::Secret;
use serde_json::json;

use crate::{summary, Provider, ProviderFactory};

async fn secret_value<P: Platform>(platform: &P, namespace: &str, selector: &SecretKeyRef) -> anyhow::Result<String> {
    let secret = platform
        .get::<Secret>(namespace, &selector.name)
        .await?
        .ok_or_else(|| anyhow!("secret {}/{} not found", namespace, selector.name))?;
    let value = secret
        .data
        .and_then(|mut d| d.remove(&selector.key))
        .ok_or_else(|| anyhow!("key {} missing in secret {}", selector.key, selector.name))?;
    Ok(String::from_utf8(value.0).context("secret value is not utf-8")?.trim().to_string())
}

fn color(severity: Severity) -> &'static str {
    match severity {
        Severity::Warning => "#ff9800",
        Severity::Info => "#2196f3",
    }
}

async fn post_json(http: &reqwest::Client, url: &str, body: &serde_json::Value) -> anyhow::Result<()> {
    let resp = http.post(url).json(body).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        bail!("webhook returned {}: {}", status, text);
    }
    Ok(())
}

pub struct SlackProvider<P> {
    platform: Arc<P>,
    http: reqwest::Client,
    namespace: String,
    config: NotificationConfig,
}

impl<P> SlackProvider<P> {
    fn message(&self, event: &NotificationEvent) -> serde_json::Value {
        let (title, lines) = summary(event, self.config.verbose);
        json!({
            "attachments": [{
                "fallback": title,
                "color": color(event.severity),
                "title": title,
                "text": lines.join("\n"),
                "fields": [
                    { "title": "Namespace", "value": self.namespace, "short": true },
                    { "title": "Source", "value": event.reason.source().to_string(), "short": true },
                ],
            }]
        })
    }
}

#[async_trait::async_trait]
impl<P: Platform + 'static> Provider for SlackProvider<P> {
    async fn send(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        let selector = &self.config.slack.as_ref().context("slack config missing")?.web_hook_url_secret_key_selector;
        let url = secret_value(self.platform.as_ref(), &self.namespace, selector).await?;
        post_json(&self.http, &url, &self.message(event)).await
    }
}

pub struct TeamsProvider<P> {
    platform: Arc<P>,
    http: reqwest::Client,
    namespace: String,
    config: NotificationConfig,
}

impl<P> TeamsProvider<P> {
    fn message(&self, event: &NotificationEvent) -> serde_json::Value {
        let (title, lines) = summary(event, self.config.verbose);
        json!({
            "@type": "MessageCard",
            "@context": "https://schema.org/extensions",
            "themeColor": color(event.severity).trim_start_matches('#'),
            "title": title,
            "summary": title,
            "sections": [{
                "facts": [
                    { "name": "Namespace", "value": self.namespace },
                    { "name": "Source", "value": event.reason.source().to_string() },
                ],
                "text": lines.join("<br/>"),
            }]
        })
    }
}

#[async_trait::async_trait]
impl<P: Platform + 'static> Provider for TeamsProvider<P> {
    async fn send(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        let selector = &self.config.teams.as_ref().context("teams config missing")?.web_hook_url_secret_key_selector;
        let url = secret_value(self.platform.as_ref(), &self.namespace, selector).await?;
        post_json(&self.http, &url, &self.message(event)).await
    }
}

pub struct MailgunProvider<P> {
    platform: Arc<P>,
    http: reqwest::Client,
    namespace: String,
    config: NotificationConfig,
    api_base: String,
}

impl<P> MailgunProvider<P> {
    fn html(&self, event: &NotificationEvent) -> String {
        let (title, lines) = summary(event, self.config.verbose);
        let items: String = lines.iter().map(|l| format!("<li>{}</li>", l)).collect();
        format!(
            "<h2 style=\"color:{}\">{}</h2><p>Namespace: {}<br/>Source: {}</p><ul>{}</ul>",
            color(event.severity),
            title,
            self.namespace,
            event.reason.source(),
            items
        )
    }

    fn channel(&self) -> anyhow::Result<&MailgunChannel> { self.config.mailgun.as_ref().context("mailgun config missing") }
}

#[async_trait::async_trait]
impl<P: Platform + 'static> Provider for MailgunProvider<P> {
    async fn send(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        let channel = self.channel()?;
        let key = secret_value(self.platform.as_ref(), &self.namespace, &channel.api_key_secret_key_selector).await?;
        let (title, _) = summary(event, false);
        let html = self.html(event);
        let form = [
            ("from", channel.from.as_str()),
            ("to", channel.recipient.as_str()),
            ("subject", title.as_str()),
            ("html", html.as_str()),
        ];
        let url = format!("{}/v3/{}/messages", self.api_base, channel.domain);
        let resp = self.http.post(url).basic_auth("api", Some(key)).form(&form).send().await?;
        if !resp.status().is_success() {
            bail!("mailgun returned {}", resp.status());
        }
        Ok(())
    }
}

/// Builds the HTTP providers, sharing one connection pool.
pub struct HttpProviderFactory<P> {
    platform: Arc<P>,
    http: reqwest::Client,
    mailgun_api: String,
}

impl<P: Platform> HttpProviderFactory<P> {
    pub fn new(platform: Arc<P>) -> Self {
        Self { platform, http: reqwest::Client::new(), mailgun_api: "https://api.mailgun.net".into() }
    }
}

impl<P: Platform + 'static> ProviderFactory for HttpProviderFactory<P> {
    fn provider(&self, namespace: &str, config: &NotificationConfig) -> Option<Arc<dyn Provider>> {
        let (platform, http, namespace, config) = (self.platform.clone(), self.http.clone(), namespace.to_string(), config.clone());
        if config.slack.is_some() {
            Some(Arc::new(SlackProvider { platform, http, namespace, config }))
        } else if config.teams.is_some() {
            Some(Arc::new(TeamsProvider { platform, http, namespace, config }))
        } else if config.mailgun.is_some() {
            Some(Arc::new(MailgunProvider { platform, http, namespace, config, api_base: self.mailgun_api.clone() }))
        } else {
            None
        }
    }
}
