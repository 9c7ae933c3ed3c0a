//! User phase: groovy scripts and configuration-as-code documents from the
//! config maps the instance references.

use std::sync::Arc;

use butler_api::ManagementClient;
use butler_apply::{casc_script, has_suffix, identity, Applier, ApplyOutcome, Transform};
use butler_core::crd::Customization;
use butler_core::{DesiredState, Error, Jenkins, NotificationEvent, Payload, Phase, Reason, ReconcileResult, Result, Severity, Source, StageContext};
use butler_kubehub::Platform;
use butler_notify::notify;
use butler_persist::ConfigMapChecksumStore;
use k8s_openapi::api::core::v1::ConfigMap;
use tracing::debug;

use crate::Context;

pub const GROOVY_SOURCE: &str = "user-groovy";
pub const CASC_SOURCE: &str = "user-casc";

pub struct UserReconciler<'a, P> {
    ctx: &'a Context<P>,
    jenkins: &'a Arc<Jenkins>,
    desired: &'a DesiredState,
    client: &'a dyn ManagementClient,
}

impl<'a, P: Platform> UserReconciler<'a, P> {
    pub fn new(ctx: &'a Context<P>, jenkins: &'a Arc<Jenkins>, desired: &'a DesiredState, client: &'a dyn ManagementClient) -> Self {
        Self { ctx, jenkins, desired, client }
    }

    /// Both sources are attempted every cycle; a failure in one does not hold back the other.
    pub async fn reconcile(&self) -> Result<ReconcileResult> {
        let d = self.desired;
        let groovy = self
            .apply(GROOVY_SOURCE, &d.groovy_scripts, &[".groovy"], identity)
            .await
            .stage("user groovy scripts")?;
        let casc = self
            .apply(CASC_SOURCE, &d.configuration_as_code, &[".yaml", ".yml"], casc_script)
            .await
            .stage("user configuration as code")?;

        let messages: Vec<String> = groovy.messages.into_iter().chain(casc.messages).collect();
        if messages.is_empty() {
            return Ok(ReconcileResult::done());
        }
        notify(
            &self.ctx.notifier,
            NotificationEvent {
                target: self.jenkins.clone(),
                phase: Phase::User,
                severity: Severity::Warning,
                reason: Reason::PayloadFailed { source: Source::User, messages },
            },
        );
        Ok(ReconcileResult::requeue())
    }

    async fn apply(&self, source: &str, customization: &Customization, suffixes: &[&str], transform: Transform) -> Result<ApplyOutcome> {
        let payloads = self.load(customization).await?;
        if payloads.is_empty() {
            return Ok(ApplyOutcome::default());
        }
        let store = ConfigMapChecksumStore::new(self.ctx.platform.clone(), self.desired, source);
        let outcome = Applier::new(self.client, &store, source).ensure(&payloads, has_suffix(suffixes), transform).await?;
        debug!(cr = %self.desired.name, source, applied = outcome.applied, skipped = outcome.skipped, failed = outcome.failed.len(), "user payloads processed");
        Ok(outcome)
    }

    /// Payloads named `<config map>.<key>`, in reference order then key order.
    async fn load(&self, customization: &Customization) -> Result<Vec<Payload>> {
        let ns = self.desired.namespace.as_str();
        let mut payloads = Vec::new();
        for cm_ref in &customization.configurations {
            let cm = self
                .ctx
                .platform
                .get::<ConfigMap>(ns, &cm_ref.name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("ConfigMap {}/{}", ns, cm_ref.name)))?;
            for (key, content) in cm.data.unwrap_or_default() {
                payloads.push(Payload::new(format!("{}.{}", cm_ref.name, key), content));
            }
        }
        Ok(payloads)
    }
}
