//! Restart reasons and the notification events built from them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crd::Jenkins;

/// Who caused a restart or a failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Source {
    /// The operator itself (e.g. plugin drift).
    Operator,
    /// The platform (e.g. a container terminated).
    Platform,
    /// A human edit of the instance resource.
    User,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Source::Operator => "operator",
            Source::Platform => "kubernetes",
            Source::User => "user",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartReason {
    pub source: Source,
    pub messages: Vec<String>,
}

impl RestartReason {
    pub fn new(source: Source, messages: Vec<String>) -> Self { Self { source, messages } }
    pub fn operator(message: impl Into<String>) -> Self { Self::new(Source::Operator, vec![message.into()]) }
    pub fn platform(message: impl Into<String>) -> Self { Self::new(Source::Platform, vec![message.into()]) }
    pub fn user(messages: Vec<String>) -> Self { Self::new(Source::User, messages) }
    pub fn has_messages(&self) -> bool { !self.messages.is_empty() }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    Base,
    User,
}

/// Severity of an event, doubling as a channel's minimum level.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
}

/// Why a notification was raised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Reason {
    PodRestart(RestartReason),
    PayloadFailed { source: Source, messages: Vec<String> },
}

impl Reason {
    /// Short machine-friendly name, used as the audit event reason.
    pub fn kind(&self) -> &'static str {
        match self {
            Reason::PodRestart(_) => "PodRestart",
            Reason::PayloadFailed { .. } => "PayloadFailed",
        }
    }

    pub fn source(&self) -> Source {
        match self {
            Reason::PodRestart(r) => r.source,
            Reason::PayloadFailed { source, .. } => *source,
        }
    }

    pub fn messages(&self) -> &[String] {
        match self {
            Reason::PodRestart(r) => &r.messages,
            Reason::PayloadFailed { messages, .. } => messages,
        }
    }

    pub fn has_messages(&self) -> bool { !self.messages().is_empty() }

    /// First line of every message, for compact channels.
    pub fn short(&self) -> Vec<String> {
        self.messages().iter().map(|m| m.lines().next().unwrap_or_default().to_string()).collect()
    }
}

impl From<RestartReason> for Reason {
    fn from(r: RestartReason) -> Self { Reason::PodRestart(r) }
}

#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub target: Arc<Jenkins>,
    pub phase: Phase,
    pub severity: Severity,
    pub reason: Reason,
}

impl NotificationEvent {
    pub fn instance_name(&self) -> &str { self.target.metadata.name.as_deref().unwrap_or("unknown") }
}
