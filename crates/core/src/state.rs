//! Per-cycle state: what the instance should look like, what the platform
//! reports, and what the scheduler should do next.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, Pod};
use k8s_openapi::api::rbac::v1::RoleRef;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

use crate::crd::{Customization, Jenkins, JenkinsMaster, NotificationConfig, Plugin, ServiceConfig};
use crate::error::{Error, Result};
use crate::labels;

/// Bounded waits of the pod health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// How long a pod may stay pending before platform events are consulted.
    pub starting_timeout: Duration,
    /// Requeue delay while the pod is not ready yet.
    pub readiness_backoff: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self { starting_timeout: Duration::from_secs(120), readiness_backoff: Duration::from_secs(5) }
    }
}

/// Directive returned to the scheduler after a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
    /// Stop automatic retries until the instance changes.
    pub terminal: bool,
}

impl ReconcileResult {
    pub fn done() -> Self { Self::default() }
    pub fn requeue() -> Self { Self { requeue: true, ..Self::default() } }
    pub fn requeue_after(after: Duration) -> Self { Self { requeue: true, requeue_after: Some(after), terminal: false } }
    pub fn terminal() -> Self { Self { requeue: false, requeue_after: None, terminal: true } }
}

/// A named declarative configuration payload. The content is opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub name: String,
    pub content: String,
}

impl Payload {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self { name: name.into(), content: content.into() }
    }
}

/// Service shape after defaults are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceTarget {
    pub name: String,
    pub type_: String,
    /// Port name on the service.
    pub port_name: String,
    pub port: i32,
    /// Container port the service forwards to; fixed whatever the service port.
    pub target_port: i32,
    pub node_port: Option<i32>,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub load_balancer_ip: Option<String>,
    pub load_balancer_source_ranges: Vec<String>,
}

impl ServiceTarget {
    fn resolve(name: String, port_name: &str, cfg: &ServiceConfig, container_port: i32) -> Self {
        Self {
            name,
            type_: cfg.type_.clone().unwrap_or_else(|| "ClusterIP".to_string()),
            port_name: port_name.to_string(),
            port: cfg.port.unwrap_or(container_port),
            target_port: container_port,
            node_port: cfg.node_port,
            annotations: cfg.annotations.clone(),
            labels: cfg.labels.clone(),
            load_balancer_ip: cfg.load_balancer_ip.clone(),
            load_balancer_source_ranges: cfg.load_balancer_source_ranges.clone(),
        }
    }
}

/// Immutable snapshot of the target configuration for one cycle.
#[derive(Debug, Clone)]
pub struct DesiredState {
    pub name: String,
    pub namespace: String,
    /// Base name of the service account, role and role binding.
    pub resource_name: String,
    pub labels: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,
    pub use_deployment: bool,
    pub master: JenkinsMaster,
    pub http_service: ServiceTarget,
    pub slave_service: ServiceTarget,
    pub roles: Vec<RoleRef>,
    /// Base plugins followed by user plugins.
    pub plugins: Vec<Plugin>,
    pub payloads: Vec<Payload>,
    pub notifications: Vec<NotificationConfig>,
    pub groovy_scripts: Customization,
    pub configuration_as_code: Customization,
    pub provision_start_time: Option<DateTime<Utc>>,
}

impl DesiredState {
    pub fn from_jenkins(jenkins: &Jenkins) -> Result<Self> {
        let name = jenkins.metadata.name.clone().ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let namespace = jenkins.metadata.namespace.clone().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let spec = &jenkins.spec;
        let use_deployment = jenkins.annotations().get(labels::USE_DEPLOYMENT_ANNOTATION).is_some_and(|v| v == "true");
        let plugins = spec.master.base_plugins.iter().chain(spec.master.plugins.iter()).cloned().collect();
        Ok(Self {
            resource_name: labels::resource_name(&name),
            labels: labels::resource_labels(&name),
            owner: jenkins.controller_owner_ref(&()),
            use_deployment,
            master: spec.master.clone(),
            http_service: ServiceTarget::resolve(labels::http_service_name(&name), "http", &spec.service, labels::DEFAULT_HTTP_PORT),
            slave_service: ServiceTarget::resolve(labels::slave_service_name(&name), "slave", &spec.slave_service, labels::DEFAULT_SLAVE_PORT),
            roles: spec.roles.clone(),
            plugins,
            payloads: Vec::new(),
            notifications: spec.notifications.clone(),
            groovy_scripts: spec.groovy_scripts.clone(),
            configuration_as_code: spec.configuration_as_code.clone(),
            provision_start_time: jenkins.status.as_ref().and_then(|s| s.provision_start_time.as_ref()).map(|t| t.0),
            name,
            namespace,
        })
    }

    pub fn with_payloads(mut self, payloads: Vec<Payload>) -> Self {
        self.payloads = payloads;
        self
    }

    pub fn pod_name(&self) -> String { labels::master_pod_name(&self.name) }
    pub fn owner_references(&self) -> Option<Vec<OwnerReference>> { self.owner.clone().map(|o| vec![o]) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerObservation {
    pub name: String,
    pub ready: bool,
    /// Termination detail when the container is in the terminated state.
    pub terminated: Option<String>,
}

/// Live facts about the master pod, rebuilt each cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedPod {
    pub name: String,
    pub phase: PodPhase,
    pub terminating: bool,
    pub containers: Vec<ContainerObservation>,
}

impl From<&Pod> for ObservedPod {
    fn from(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let containers = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|list| {
                list.iter()
                    .map(|cs| {
                        let terminated = cs.state.as_ref().and_then(|st| st.terminated.as_ref()).map(|t| {
                            format!(
                                "Container '{}' is terminated, reason '{}', exit code {}, message '{}'",
                                cs.name,
                                t.reason.as_deref().unwrap_or("unknown"),
                                t.exit_code,
                                t.message.as_deref().unwrap_or("")
                            )
                        });
                        ContainerObservation { name: cs.name.clone(), ready: cs.ready, terminated }
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            name: pod.name_any(),
            phase: PodPhase::parse(status.and_then(|s| s.phase.as_deref())),
            terminating: pod.metadata.deletion_timestamp.is_some(),
            containers,
        }
    }
}

/// A platform event in the instance namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    pub name: String,
    pub involved_name: String,
    pub type_: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
    pub field_path: Option<String>,
}

impl ObservedEvent {
    pub fn is_normal(&self) -> bool { self.type_ == "Normal" }

    /// Events are named `<subject>.<suffix>`; the involved object name is checked first.
    pub fn concerns(&self, subject: &str) -> bool {
        self.involved_name == subject || self.name.strip_prefix(subject).is_some_and(|rest| rest.starts_with('.'))
    }
}

impl From<&Event> for ObservedEvent {
    fn from(ev: &Event) -> Self {
        let timestamp = ev
            .last_timestamp
            .as_ref()
            .map(|t| t.0)
            .or_else(|| ev.event_time.as_ref().map(|t| t.0))
            .or_else(|| ev.metadata.creation_timestamp.as_ref().map(|t| t.0));
        Self {
            name: ev.name_any(),
            involved_name: ev.involved_object.name.clone().unwrap_or_default(),
            type_: ev.type_.clone().unwrap_or_else(|| "Normal".to_string()),
            timestamp,
            message: ev.message.clone().unwrap_or_default(),
            field_path: ev.involved_object.field_path.clone(),
        }
    }
}
