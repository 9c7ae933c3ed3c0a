use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use butler_api::{FakeClientFactory, FakeManagementClient};
use butler_core::crd::{ConfigMapRef, Customization};
use butler_core::{labels, DesiredState, Jenkins, JenkinsStatus, NotificationEvent, Phase, Plugin, Reason, ReconcileResult, RestartReason, Source};
use butler_kubehub::{MemoryPlatform, Platform, RouteCapability, Write};
use butler_ops::{KubeRestarter, RecordingRestarter, Restarter};
use butler_reconcile::{reconcile_instance, templates, Context, Settings};
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, ContainerStatus, Event, ObjectReference, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use tokio::sync::mpsc::UnboundedReceiver;

const NS: &str = "build";

struct Harness {
    platform: Arc<MemoryPlatform>,
    client: Arc<FakeManagementClient>,
    factory: Arc<FakeClientFactory>,
    restarter: Arc<RecordingRestarter>,
    events: UnboundedReceiver<NotificationEvent>,
    ctx: Context<MemoryPlatform>,
}

impl Harness {
    fn new(jenkins: Jenkins, installed: Vec<Plugin>) -> Self {
        let platform = Arc::new(MemoryPlatform::new());
        platform.insert(NS, jenkins);
        let client = Arc::new(FakeManagementClient::new().with_plugins(installed));
        let factory = Arc::new(FakeClientFactory::new(client.clone()));
        let restarter = Arc::new(RecordingRestarter::new());
        let (notifier, events) = butler_notify::channel();
        let ctx = Context {
            platform: platform.clone(),
            clients: factory.clone(),
            restarter: restarter.clone(),
            notifier,
            routes: Arc::new(RouteCapability::fixed(false)),
            settings: Settings::default(),
        };
        Self { platform, client, factory, restarter, events, ctx }
    }

    fn jenkins(&self) -> Arc<Jenkins> { Arc::new(self.platform.object::<Jenkins>(NS, "ci").unwrap()) }

    fn desired(&self) -> DesiredState { DesiredState::from_jenkins(&self.jenkins()).unwrap() }

    async fn cycle(&self) -> ReconcileResult { reconcile_instance(self.jenkins(), &self.ctx).await.unwrap() }

    fn status(&self) -> JenkinsStatus { self.jenkins().status.clone().unwrap_or_default() }

    fn set_pod_status(&self, phase: &str, ready: bool) {
        let mut pod = self.platform.object::<Pod>(NS, "jenkins-ci").unwrap_or_else(|| templates::master_pod(&self.desired()));
        pod.status = Some(PodStatus {
            phase: Some(phase.into()),
            container_statuses: Some(vec![ContainerStatus { name: templates::MASTER_CONTAINER.into(), ready, ..Default::default() }]),
            ..Default::default()
        });
        self.platform.insert(NS, pod);
    }

    fn notifications(&mut self) -> Vec<NotificationEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }
}

fn jenkins() -> Jenkins {
    let mut j = Jenkins::new("ci", Default::default());
    j.metadata.namespace = Some(NS.into());
    j
}

fn provisioned(started: chrono::DateTime<Utc>) -> Jenkins {
    let mut j = jenkins();
    j.status = Some(JenkinsStatus { provision_start_time: Some(Time(started)), ..Default::default() });
    j
}

#[tokio::test]
async fn fresh_instance_converges_then_goes_quiet() {
    let h = Harness::new(jenkins(), vec![]);

    let first = h.cycle().await;
    assert_eq!(first, ReconcileResult::requeue());
    assert!(h.platform.object::<Pod>(NS, "jenkins-ci").is_some());
    assert!(h.status().provision_start_time.is_some());

    h.set_pod_status("Running", true);
    assert_eq!(h.cycle().await, ReconcileResult::done());
    assert_eq!(h.client.executed().len(), templates::base_payloads(&h.desired(), "cluster.local").len());
    let status = h.status();
    assert!(status.base_configuration_completed_time.is_some());
    assert!(status.user_configuration_completed_time.is_some());

    h.platform.clear_writes();
    let executed = h.client.executed().len();
    assert_eq!(h.cycle().await, ReconcileResult::done());
    assert_eq!(h.platform.writes(), vec![]);
    assert_eq!(h.client.executed().len(), executed);
    assert!(h.restarter.calls().is_empty());
}

#[tokio::test]
async fn plugin_version_drift_restarts_once() {
    let mut j = provisioned(Utc::now());
    j.spec.master.plugins = vec![Plugin::new("A", "1")];
    let mut h = Harness::new(j, vec![Plugin::new("A", "2")]);
    h.set_pod_status("Running", true);

    assert_eq!(h.cycle().await, ReconcileResult::requeue());
    let calls = h.restarter.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.source, Source::Operator);
    assert!(h.client.executed().is_empty());
    assert_eq!(h.client.plugin_fetches(), 1);

    let sent = h.notifications();
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0].reason, Reason::PodRestart(ref r) if r.source == Source::Operator));
}

#[tokio::test]
async fn plugin_order_is_not_drift() {
    let mut j = provisioned(Utc::now());
    j.spec.master.plugins = vec![Plugin::new("A", "1"), Plugin::new("B", "2")];
    let h = Harness::new(j, vec![Plugin::new("B", "2"), Plugin::new("A", "1")]);
    h.set_pod_status("Running", true);

    assert_eq!(h.cycle().await, ReconcileResult::done());
    assert!(h.restarter.calls().is_empty());
}

#[tokio::test]
async fn pending_pod_stops_only_with_a_matching_warning() {
    let h = Harness::new(provisioned(Utc::now() - chrono::Duration::minutes(3)), vec![]);
    h.set_pod_status("Pending", false);

    let result = h.cycle().await;
    assert_eq!(result, ReconcileResult::requeue_after(Duration::from_secs(5)));
    assert!(!result.terminal);

    h.platform.insert(
        NS,
        Event {
            metadata: ObjectMeta { name: Some("jenkins-ci.17a3f".into()), ..Default::default() },
            involved_object: ObjectReference { kind: Some("Pod".into()), name: Some("jenkins-ci".into()), ..Default::default() },
            type_: Some("Warning".into()),
            reason: Some("FailedScheduling".into()),
            message: Some("0/3 nodes are available: insufficient memory".into()),
            last_timestamp: Some(Time(Utc::now())),
            ..Default::default()
        },
    );
    let result = h.cycle().await;
    assert!(result.terminal);
    assert!(!result.requeue);
    assert_eq!(h.factory.connects(), 0);
}

#[tokio::test]
async fn missing_provision_record_is_terminal() {
    let h = Harness::new(jenkins(), vec![]);
    h.set_pod_status("Running", true);
    assert_eq!(h.cycle().await, ReconcileResult::terminal());
    assert_eq!(h.factory.connects(), 0);
}

#[tokio::test]
async fn terminated_container_restarts_with_platform_reason() {
    let h = Harness::new(provisioned(Utc::now()), vec![]);
    let mut pod = templates::master_pod(&h.desired());
    pod.status = Some(PodStatus {
        phase: Some("Running".into()),
        container_statuses: Some(vec![ContainerStatus {
            name: templates::MASTER_CONTAINER.into(),
            state: Some(k8s_openapi::api::core::v1::ContainerState {
                terminated: Some(k8s_openapi::api::core::v1::ContainerStateTerminated { exit_code: 137, reason: Some("OOMKilled".into()), ..Default::default() }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    });
    h.platform.insert(NS, pod);

    assert_eq!(h.cycle().await, ReconcileResult::requeue());
    let calls = h.restarter.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.source, Source::Platform);
}

#[tokio::test]
async fn terminating_pod_after_restart_is_awaited() {
    let h = Harness::new(provisioned(Utc::now()), vec![]);
    h.set_pod_status("Running", true);
    assert_eq!(h.cycle().await, ReconcileResult::done());

    KubeRestarter::new(h.platform.clone()).restart_managed_instance(&h.desired(), &RestartReason::operator("plugins changed")).await.unwrap();
    let status = h.status();
    assert!(status.provision_start_time.is_some());
    assert!(status.base_configuration_completed_time.is_none());

    // the old pod lingers while its containers shut down
    let mut pod = templates::master_pod(&h.desired());
    pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
    pod.status = Some(PodStatus { phase: Some("Running".into()), ..Default::default() });
    h.platform.insert(NS, pod);
    assert_eq!(h.cycle().await, ReconcileResult::requeue_after(Duration::from_secs(5)));
    assert!(h.restarter.calls().is_empty());

    h.platform.delete::<Pod>(NS, "jenkins-ci").await.unwrap();
    assert_eq!(h.cycle().await, ReconcileResult::requeue());
    assert!(h.platform.object::<Pod>(NS, "jenkins-ci").is_some());
}

#[tokio::test]
async fn changed_image_restarts_with_user_reason() {
    let h = Harness::new(provisioned(Utc::now()), vec![]);
    let mut pod = templates::master_pod(&h.desired());
    pod.spec.as_mut().unwrap().containers[0].image = Some("jenkins/jenkins:2.60".into());
    h.platform.insert(NS, pod);

    assert_eq!(h.cycle().await, ReconcileResult::requeue());
    assert_eq!(h.restarter.calls()[0].1.source, Source::User);
}

#[tokio::test]
async fn deployment_mode_skips_the_management_api() {
    let mut j = jenkins();
    j.metadata.annotations = Some(BTreeMap::from([(labels::USE_DEPLOYMENT_ANNOTATION.to_string(), "true".to_string())]));
    let h = Harness::new(j, vec![]);

    assert_eq!(h.cycle().await, ReconcileResult::requeue_after(Duration::from_secs(5)));
    assert!(h.platform.object::<Deployment>(NS, "jenkins-operator-ci").is_some());
    assert!(h.platform.object::<Pod>(NS, "jenkins-ci").is_none());
    assert_eq!(h.factory.connects(), 0);

    h.platform.clear_writes();
    h.cycle().await;
    assert!(!h.platform.writes().iter().any(|w| matches!(w, Write::Replace { kind, .. } if kind == "Deployment")));
}

#[tokio::test]
async fn failed_user_script_is_retried_alone() {
    let mut j = provisioned(Utc::now());
    j.spec.groovy_scripts = Customization { configurations: vec![ConfigMapRef { name: "groovy".into() }], ..Default::default() };
    let mut h = Harness::new(j, vec![]);
    h.platform.insert(
        NS,
        ConfigMap {
            metadata: ObjectMeta { name: Some("groovy".into()), ..Default::default() },
            data: Some(BTreeMap::from([
                ("a.groovy".to_string(), "println 'boom'".to_string()),
                ("b.groovy".to_string(), "println 'fine'".to_string()),
                ("notes.txt".to_string(), "ignored".to_string()),
            ])),
            ..Default::default()
        },
    );
    h.set_pod_status("Running", true);
    h.client.fail_when_contains("boom");

    assert_eq!(h.cycle().await, ReconcileResult::requeue());
    assert!(h.status().base_configuration_completed_time.is_some());
    assert!(h.status().user_configuration_completed_time.is_none());
    let sent = h.notifications();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].phase, Phase::User);
    assert!(matches!(sent[0].reason, Reason::PayloadFailed { source: Source::User, .. }));

    h.client.heal();
    let before = h.client.executed().len();
    assert_eq!(h.cycle().await, ReconcileResult::done());
    let retried = &h.client.executed()[before..];
    assert_eq!(retried.len(), 1);
    assert!(retried[0].contains("boom"));
    assert!(h.status().user_configuration_completed_time.is_some());
}
