//! Base phase: supporting resources, the master workload, readiness, plugin
//! drift and the operator's own groovy payloads.

use std::collections::BTreeMap;
use std::sync::Arc;

use butler_api::ManagementClient;
use butler_apply::{has_suffix, identity, Applier};
use butler_core::{
    labels, DesiredState, Error, Jenkins, NotificationEvent, ObservedEvent, ObservedPod, Phase, Reason, ReconcileResult, RestartReason, Result,
    Severity, Source, StageContext,
};
use butler_kubehub::Platform;
use butler_notify::notify;
use butler_persist::{digest, ConfigMapChecksumStore};
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::monitor::{self, Readiness, StartCheck};
use crate::sync::{adopt, ensure, Synchronizer};
use crate::{plugins, restart, templates, Context};

pub const BASE_SOURCE: &str = "base-groovy";
/// Digest of the deployment's pod template, compared instead of the defaulted live spec.
pub const TEMPLATE_DIGEST_ANNOTATION: &str = "butler.jenkins.io/template-digest";
pub const PLUGINS_CHANGED: &str = "plugins changed";

/// Cycle result plus, once the instance is ready, the client bound to it.
pub type BaseOutcome = (ReconcileResult, Option<Arc<dyn ManagementClient>>);

pub struct BaseReconciler<'a, P> {
    ctx: &'a Context<P>,
    jenkins: &'a Arc<Jenkins>,
    desired: &'a DesiredState,
}

impl<'a, P: Platform> BaseReconciler<'a, P> {
    pub fn new(ctx: &'a Context<P>, jenkins: &'a Arc<Jenkins>, desired: &'a DesiredState) -> Self { Self { ctx, jenkins, desired } }

    fn ns(&self) -> &str { &self.desired.namespace }

    pub async fn reconcile(&self) -> Result<BaseOutcome> {
        let d = self.desired;
        Synchronizer::new(self.ctx.platform.as_ref(), d, &self.ctx.routes).ensure_resources().await?;

        if d.use_deployment {
            return Ok((self.ensure_deployment().await.stage("deployment")?, None));
        }

        let Some(pod) = self.ensure_master_pod().await.stage("master pod")? else {
            return Ok((ReconcileResult::requeue(), None));
        };
        debug!(cr = %d.name, "jenkins master pod is present");

        let observed = ObservedPod::from(&pod);
        match self.detect_starting_issues(&observed).await.stage("starting issues")? {
            StartCheck::Continue => {}
            StartCheck::NoProvisionRecord => {
                warn!(cr = %d.name, "no provisioning start recorded, stopping until the instance changes");
                return Ok((ReconcileResult::terminal(), None));
            }
            StartCheck::Stuck(events) => {
                warn!(cr = %d.name, pod = %observed.name, events = ?events, "jenkins master pod is stuck pending, stopping until the instance changes");
                return Ok((ReconcileResult::terminal(), None));
            }
        }

        match monitor::assess_readiness(&observed, self.ctx.settings.timing.readiness_backoff) {
            Readiness::Ready => debug!(cr = %d.name, "jenkins master pod is ready"),
            Readiness::Wait(after) => {
                debug!(cr = %d.name, phase = ?observed.phase, terminating = observed.terminating, "jenkins master pod not ready");
                return Ok((ReconcileResult::requeue_after(after), None));
            }
            Readiness::Restart(reason) => {
                restart::restart(self.ctx, self.jenkins, d, reason).await.stage("restart terminated container")?;
                return Ok((ReconcileResult::requeue(), None));
            }
        }

        let client = self.ctx.clients.connect(d).await.stage("management api client")?;
        debug!(cr = %d.name, "jenkins api client set");

        let installed = client.fetch_all_plugins().await.stage("fetch plugins")?;
        let drift = plugins::drift(&d.plugins, &installed);
        if !drift.is_empty() {
            info!(cr = %d.name, drift = ?drift, "some plugins have changed, restarting jenkins");
            let messages = std::iter::once(PLUGINS_CHANGED.to_string()).chain(drift).collect();
            restart::restart(self.ctx, self.jenkins, d, RestartReason::new(Source::Operator, messages)).await.stage("restart on plugin drift")?;
            return Ok((ReconcileResult::requeue(), None));
        }

        let result = self.apply_base_payloads(client.as_ref()).await.stage("base configuration")?;
        Ok((result, Some(client)))
    }

    /// `None` when the pod was just created or replaced.
    async fn ensure_master_pod(&self) -> Result<Option<Pod>> {
        let d = self.desired;
        let Some(pod) = self.ctx.platform.get::<Pod>(self.ns(), &d.pod_name()).await? else {
            self.ctx.platform.create(self.ns(), &templates::master_pod(d)).await?;
            let status = serde_json::json!({ "provisionStartTime": Time(Utc::now()) });
            self.ctx.platform.patch_status::<Jenkins>(self.ns(), &d.name, status).await?;
            info!(cr = %d.name, pod = %d.pod_name(), "jenkins master pod created");
            return Ok(None);
        };
        if pod.metadata.deletion_timestamp.is_none() {
            let changes = pod_drift(d, &pod);
            if !changes.is_empty() {
                restart::restart(self.ctx, self.jenkins, d, RestartReason::user(changes)).await?;
                return Ok(None);
            }
        }
        Ok(Some(pod))
    }

    /// Events are only fetched for a pod that has been pending past the timeout.
    async fn detect_starting_issues(&self, observed: &ObservedPod) -> Result<StartCheck> {
        let d = self.desired;
        let now = Utc::now();
        let timeout = self.ctx.settings.timing.starting_timeout;
        let events: Vec<ObservedEvent> = match d.provision_start_time {
            Some(start) if monitor::pending_timed_out(start, observed, now, timeout) => {
                self.ctx.platform.list::<Event>(self.ns()).await?.iter().map(ObservedEvent::from).collect()
            }
            _ => Vec::new(),
        };
        Ok(monitor::detect_starting_issues(d.provision_start_time, observed, &events, now, timeout))
    }

    /// Readiness is the platform's business in deployment mode; no management client is handed out.
    async fn ensure_deployment(&self) -> Result<ReconcileResult> {
        let d = self.desired;
        let mut desired = templates::deployment(d);
        let fingerprint = deployment_fingerprint(&desired)?;
        desired.annotations_mut().insert(TEMPLATE_DIGEST_ANNOTATION.into(), fingerprint);
        let current = ensure(self.ctx.platform.as_ref(), self.ns(), desired, |mut existing: Deployment, want| {
            adopt(&mut existing.metadata, &want.metadata);
            if existing.annotations().get(TEMPLATE_DIGEST_ANNOTATION) != want.annotations().get(TEMPLATE_DIGEST_ANNOTATION) {
                existing.annotations_mut().extend(want.annotations().clone());
                existing.spec = want.spec.clone();
            }
            existing
        })
        .await?;
        let ready = current.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
        if ready < 1 {
            debug!(cr = %d.name, "jenkins deployment not ready");
            return Ok(ReconcileResult::requeue_after(self.ctx.settings.timing.readiness_backoff));
        }
        debug!(cr = %d.name, "jenkins deployment is present");
        Ok(ReconcileResult::done())
    }

    async fn apply_base_payloads(&self, client: &dyn ManagementClient) -> Result<ReconcileResult> {
        let d = self.desired;
        let store = ConfigMapChecksumStore::new(self.ctx.platform.clone(), d, BASE_SOURCE);
        let outcome = Applier::new(client, &store, BASE_SOURCE).ensure(&d.payloads, has_suffix(&[".groovy"]), identity).await?;
        debug!(cr = %d.name, applied = outcome.applied, skipped = outcome.skipped, failed = outcome.failed.len(), "base payloads processed");
        if outcome.requeue() {
            notify(
                &self.ctx.notifier,
                NotificationEvent {
                    target: self.jenkins.clone(),
                    phase: Phase::Base,
                    severity: Severity::Warning,
                    reason: Reason::PayloadFailed { source: Source::Operator, messages: outcome.messages },
                },
            );
            return Ok(ReconcileResult::requeue());
        }
        Ok(ReconcileResult::done())
    }
}

fn deployment_fingerprint(deployment: &Deployment) -> Result<String> {
    let spec = serde_json::to_string(&deployment.spec).map_err(Error::from)?;
    Ok(digest(&spec))
}

/// Differences between the live pod and the desired one that need a new pod.
pub fn pod_drift(desired: &DesiredState, actual: &Pod) -> Vec<String> {
    let want = templates::master_pod(desired);
    let mut changes = Vec::new();
    let want_containers = want.spec.map(|s| s.containers).unwrap_or_default();
    let actual_containers = actual.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default();
    for c in &want_containers {
        match actual_containers.iter().find(|a| a.name == c.name) {
            None => changes.push(format!("Container '{}' is missing", c.name)),
            Some(a) if a.image != c.image => changes.push(format!(
                "Image of container '{}' has changed to '{}', actual '{}'",
                c.name,
                c.image.as_deref().unwrap_or_default(),
                a.image.as_deref().unwrap_or_default()
            )),
            Some(_) => {}
        }
    }
    if !labels::contains_all(&templates::pod_labels(desired), actual.metadata.labels.as_ref()) {
        changes.push(format!("Labels have changed to '{:?}', actual '{:?}'", templates::pod_labels(desired), actual.labels()));
    }
    let want_annotations: BTreeMap<String, String> = want.metadata.annotations.unwrap_or_default();
    if !labels::contains_all(&want_annotations, actual.metadata.annotations.as_ref()) {
        changes.push(format!("Annotations have changed to '{:?}', actual '{:?}'", want_annotations, actual.annotations()));
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use butler_core::Jenkins;

    fn desired() -> DesiredState {
        let mut j = Jenkins::new("ci", Default::default());
        j.metadata.namespace = Some("build".into());
        j.spec.master.annotations = BTreeMap::from([("team".to_string(), "qa".to_string())]);
        DesiredState::from_jenkins(&j).unwrap()
    }

    #[test]
    fn fresh_pod_has_no_drift() {
        let d = desired();
        let mut pod = templates::master_pod(&d);
        pod.labels_mut().insert("pod-template-hash".into(), "x".into());
        assert!(pod_drift(&d, &pod).is_empty());
    }

    #[test]
    fn image_label_and_annotation_changes_are_drift() {
        let d = desired();
        let mut pod = templates::master_pod(&d);
        pod.spec.as_mut().unwrap().containers[0].image = Some("jenkins/jenkins:2.100".into());
        pod.labels_mut().remove(labels::LABEL_INSTANCE_KEY);
        pod.metadata.annotations = None;
        let changes = pod_drift(&d, &pod);
        assert_eq!(changes.len(), 3, "{changes:?}");
        assert!(changes[0].contains("jenkins/jenkins:2.100"));
    }

    #[test]
    fn deployment_fingerprint_tracks_template() {
        let d = desired();
        let a = templates::deployment(&d);
        let mut b = a.clone();
        assert_eq!(deployment_fingerprint(&a).unwrap(), deployment_fingerprint(&b).unwrap());
        b.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0].image = Some("other".into());
        assert_ne!(deployment_fingerprint(&a).unwrap(), deployment_fingerprint(&b).unwrap());
    }
}
