//! Butler core types: the managed Jenkins resource, per-cycle desired/observed
//! state, restart reasons, notification events and the shared error type.

#![forbid(unsafe_code)]

pub mod crd;
pub mod error;
pub mod labels;
pub mod reason;
pub mod state;

pub use crd::{Jenkins, JenkinsSpec, JenkinsStatus, Plugin, Route, RouteSpec};
pub use error::{Error, Result, StageContext};
pub use reason::{NotificationEvent, Phase, Reason, RestartReason, Severity, Source};
pub use state::{DesiredState, ObservedEvent, ObservedPod, Payload, PodPhase, ReconcileResult, Timing};
