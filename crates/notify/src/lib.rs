//! Butler notifications.
//!
//! Reconcile cycles push [`NotificationEvent`]s into an unbounded channel and
//! move on. The [`Dispatcher`] drains it: each event is recorded as a
//! platform audit event, then delivered to every configured channel whose
//! minimum severity it meets, one detached task per channel. Delivery
//! failures are logged and counted, never returned.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use butler_core::{NotificationEvent, Severity};
use butler_core::crd::NotificationConfig;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Resource;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub mod providers;

pub use providers::{HttpProviderFactory, MailgunProvider, SlackProvider, TeamsProvider};

/// Sending half handed to reconcile code.
pub type Notifier = mpsc::UnboundedSender<NotificationEvent>;

pub fn channel() -> (Notifier, mpsc::UnboundedReceiver<NotificationEvent>) { mpsc::unbounded_channel() }

/// Queue an event without waiting for delivery.
pub fn notify(tx: &Notifier, event: NotificationEvent) {
    if tx.send(event).is_err() {
        warn!("notification dispatcher is gone, event dropped");
    }
}

/// One outbound channel.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    async fn send(&self, event: &NotificationEvent) -> anyhow::Result<()>;
}

/// Maps a channel config to its provider; `None` for configs with no recognised channel.
pub trait ProviderFactory: Send + Sync {
    fn provider(&self, namespace: &str, config: &NotificationConfig) -> Option<Arc<dyn Provider>>;
}

/// Platform-level record of every accepted event.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: &NotificationEvent) -> anyhow::Result<()>;
}

/// Publishes audit events through the kube event recorder.
pub struct RecorderAudit {
    client: kube::Client,
    reporter: Reporter,
}

impl RecorderAudit {
    pub fn new(client: kube::Client, controller: &str) -> Self {
        Self { client, reporter: Reporter { controller: controller.to_string(), instance: None } }
    }
}

#[async_trait::async_trait]
impl AuditSink for RecorderAudit {
    async fn emit(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), event.target.object_ref(&()));
        recorder
            .publish(Event {
                type_: event_type(event.severity),
                reason: event.reason.kind().to_string(),
                note: Some(event.reason.short().join("; ")),
                action: "Reconcile".into(),
                secondary: None,
            })
            .await?;
        Ok(())
    }
}

fn event_type(severity: Severity) -> EventType {
    match severity {
        Severity::Warning => EventType::Warning,
        Severity::Info => EventType::Normal,
    }
}

/// Audit sink that keeps `(reason kind, note)` pairs in memory.
#[derive(Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<(String, String)>>,
}

impl MemoryAudit {
    pub fn new() -> Self { Self::default() }
    pub fn events(&self) -> Vec<(String, String)> { self.events.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAudit {
    async fn emit(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push((event.reason.kind().to_string(), event.reason.short().join("; ")));
        Ok(())
    }
}

/// Whether a channel with minimum level `wanted` receives `event`.
pub fn accepts(wanted: Severity, event: Severity) -> bool { event >= wanted }

pub struct Dispatcher {
    audit: Arc<dyn AuditSink>,
    providers: Arc<dyn ProviderFactory>,
}

impl Dispatcher {
    pub fn new(audit: Arc<dyn AuditSink>, providers: Arc<dyn ProviderFactory>) -> Self { Self { audit, providers } }

    /// Drain the feed until every sender is dropped.
    pub async fn listen(self, mut rx: mpsc::UnboundedReceiver<NotificationEvent>) {
        while let Some(event) = rx.recv().await {
            self.dispatch(event).await;
        }
        debug!("notification feed closed");
    }

    /// Handle one event; the returned handles complete when each channel delivery ends.
    pub async fn dispatch(&self, event: NotificationEvent) -> Vec<JoinHandle<()>> {
        let cr = event.instance_name().to_string();
        if !event.reason.has_messages() {
            warn!(cr = %cr, reason = event.reason.kind(), "notification without messages dropped");
            return Vec::new();
        }
        if let Err(e) = self.audit.emit(&event).await {
            warn!(cr = %cr, error = %e, "audit event not recorded");
        }
        let namespace = event.target.metadata.namespace.clone().unwrap_or_default();
        let event = Arc::new(event);
        let mut handles = Vec::new();
        for config in &event.target.spec.notifications {
            let Some(provider) = self.providers.provider(&namespace, config) else {
                warn!(cr = %cr, channel = %config.name, "unknown notification service, skipping");
                continue;
            };
            if !accepts(config.level, event.severity) {
                debug!(cr = %cr, channel = %config.name, "below channel level, skipping");
                continue;
            }
            let event = event.clone();
            let cr = cr.clone();
            let channel = config.name.clone();
            handles.push(tokio::spawn(async move {
                match provider.send(&event).await {
                    Ok(()) => {
                        counter!("notifications_sent_total", 1u64, "channel" => channel.clone());
                        debug!(cr = %cr, channel = %channel, "notification sent");
                    }
                    Err(e) => {
                        counter!("notifications_failed_total", 1u64, "channel" => channel.clone());
                        error!(cr = %cr, channel = %channel, error = %e, "failed to send notification");
                    }
                }
            }));
        }
        handles
    }
}

/// Title and body lines shared by every channel.
pub(crate) fn summary(event: &NotificationEvent, verbose: bool) -> (String, Vec<String>) {
    let phase = match event.phase {
        butler_core::Phase::Base => "base",
        butler_core::Phase::User => "user",
    };
    let title = format!("Jenkins '{}' {} configuration", event.instance_name(), phase);
    let lines = if verbose { event.reason.messages().to_vec() } else { event.reason.short() };
    (title, lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use butler_core::{Jenkins, Phase, Reason, RestartReason, Source};
    use butler_core::crd::WebhookChannel;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<String>>,
    }

    struct Channel {
        name: String,
        log: Arc<Recording>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Provider for Channel {
        async fn send(&self, _event: &NotificationEvent) -> anyhow::Result<()> {
            self.log.sent.lock().unwrap().push(self.name.clone());
            if self.fail {
                anyhow::bail!("webhook returned 500");
            }
            Ok(())
        }
    }

    struct Factory(Arc<Recording>);

    impl ProviderFactory for Factory {
        fn provider(&self, _namespace: &str, config: &NotificationConfig) -> Option<Arc<dyn Provider>> {
            config.slack.as_ref()?;
            Some(Arc::new(Channel { name: config.name.clone(), log: self.0.clone(), fail: config.name.starts_with("broken") }))
        }
    }

    fn slack(name: &str, level: Severity) -> NotificationConfig {
        NotificationConfig { name: name.into(), level, slack: Some(WebhookChannel::default()), ..Default::default() }
    }

    fn event(channels: Vec<NotificationConfig>, severity: Severity, messages: Vec<String>) -> NotificationEvent {
        let mut j = Jenkins::new("ci", Default::default());
        j.metadata.namespace = Some("build".into());
        j.spec.notifications = channels;
        NotificationEvent { target: Arc::new(j), phase: Phase::Base, severity, reason: Reason::PodRestart(RestartReason::new(Source::Operator, messages)) }
    }

    fn dispatcher(log: Arc<Recording>, audit: Arc<MemoryAudit>) -> Dispatcher { Dispatcher::new(audit, Arc::new(Factory(log))) }

    async fn settle(handles: Vec<JoinHandle<()>>) {
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn info_event_skips_warning_channel() {
        let log = Arc::new(Recording::default());
        let d = dispatcher(log.clone(), Arc::new(MemoryAudit::new()));
        settle(d.dispatch(event(vec![slack("ops", Severity::Warning)], Severity::Info, vec!["x".into()])).await).await;
        assert!(log.sent.lock().unwrap().is_empty());
        settle(d.dispatch(event(vec![slack("ops", Severity::Info)], Severity::Info, vec!["x".into()])).await).await;
        assert_eq!(*log.sent.lock().unwrap(), vec!["ops".to_string()]);
    }

    #[tokio::test]
    async fn warning_reaches_every_channel_and_failures_stay_local() {
        let log = Arc::new(Recording::default());
        let audit = Arc::new(MemoryAudit::new());
        let d = dispatcher(log.clone(), audit.clone());
        let mut unknown = slack("mystery", Severity::Info);
        unknown.slack = None;
        let channels = vec![slack("broken", Severity::Info), slack("ops", Severity::Warning), unknown];
        let handles = d.dispatch(event(channels, Severity::Warning, vec!["plugins changed".into()])).await;
        assert_eq!(handles.len(), 2);
        settle(handles).await;
        let mut sent = log.sent.lock().unwrap().clone();
        sent.sort();
        assert_eq!(sent, vec!["broken".to_string(), "ops".to_string()]);
        assert_eq!(audit.events(), vec![("PodRestart".to_string(), "plugins changed".to_string())]);
    }

    #[tokio::test]
    async fn events_without_messages_are_dropped_before_audit() {
        let log = Arc::new(Recording::default());
        let audit = Arc::new(MemoryAudit::new());
        let d = dispatcher(log.clone(), audit.clone());
        assert!(d.dispatch(event(vec![slack("ops", Severity::Info)], Severity::Warning, vec![])).await.is_empty());
        assert!(audit.events().is_empty());
    }

    #[tokio::test]
    async fn listen_drains_until_senders_drop() {
        let log = Arc::new(Recording::default());
        let audit = Arc::new(MemoryAudit::new());
        let (tx, rx) = channel();
        notify(&tx, event(vec![], Severity::Info, vec!["a".into()]));
        notify(&tx, event(vec![], Severity::Warning, vec!["b".into()]));
        drop(tx);
        dispatcher(log, audit.clone()).listen(rx).await;
        assert_eq!(audit.events().len(), 2);
    }
}
