//! Butler reconcile: one cycle of the control loop for a Jenkins instance.
//!
//! A cycle converges supporting resources, the master workload, plugins and
//! configuration payloads, in that order, and tells the scheduler what to do
//! next through a [`ReconcileResult`]. Every stage is idempotent; an error
//! aborts the cycle and the whole cycle is retried later.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use butler_api::ClientFactory;
use butler_core::{DesiredState, Jenkins, ReconcileResult, Result, StageContext, Timing};
use butler_kubehub::{Platform, RouteCapability};
use butler_notify::Notifier;
use butler_ops::Restarter;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

pub mod base;
pub mod monitor;
pub mod plugins;
pub mod rbac;
pub mod restart;
pub mod sync;
pub mod templates;
pub mod user;

pub use base::BaseReconciler;
pub use sync::Synchronizer;
pub use user::UserReconciler;

#[derive(Debug, Clone)]
pub struct Settings {
    pub timing: Timing,
    /// Used in the in-cluster URLs baked into base payloads.
    pub cluster_domain: String,
}

impl Default for Settings {
    fn default() -> Self { Self { timing: Timing::default(), cluster_domain: "cluster.local".into() } }
}

/// Collaborators shared by every cycle.
pub struct Context<P> {
    pub platform: Arc<P>,
    pub clients: Arc<dyn ClientFactory>,
    pub restarter: Arc<dyn Restarter>,
    pub notifier: Notifier,
    /// Process-wide memoized route probe.
    pub routes: Arc<RouteCapability>,
    pub settings: Settings,
}

/// Run one cycle for `jenkins`.
pub async fn reconcile_instance<P: Platform>(jenkins: Arc<Jenkins>, ctx: &Context<P>) -> Result<ReconcileResult> {
    let t0 = Instant::now();
    counter!("reconcile_cycles_total", 1u64);
    let result = run(&jenkins, ctx).await;
    histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    match &result {
        Ok(r) => debug!(cr = ?jenkins.metadata.name, requeue = r.requeue, after = ?r.requeue_after, terminal = r.terminal, "cycle finished"),
        Err(e) => {
            counter!("reconcile_errors_total", 1u64);
            warn!(cr = ?jenkins.metadata.name, error = %e, "cycle failed");
        }
    }
    result
}

async fn run<P: Platform>(jenkins: &Arc<Jenkins>, ctx: &Context<P>) -> Result<ReconcileResult> {
    let desired = DesiredState::from_jenkins(jenkins)?;
    let payloads = templates::base_payloads(&desired, &ctx.settings.cluster_domain);
    let desired = desired.with_payloads(payloads);
    let status = jenkins.status.clone().unwrap_or_default();

    let (result, client) = BaseReconciler::new(ctx, jenkins, &desired).reconcile().await?;
    if result.requeue || result.terminal {
        return Ok(result);
    }
    let Some(client) = client else { return Ok(result) };
    if status.base_configuration_completed_time.is_none() {
        let patch = serde_json::json!({ "baseConfigurationCompletedTime": Time(Utc::now()) });
        ctx.platform.patch_status::<Jenkins>(&desired.namespace, &desired.name, patch).await.stage("base configuration status")?;
        info!(cr = %desired.name, "base configuration phase is complete");
    }

    let result = UserReconciler::new(ctx, jenkins, &desired, client.as_ref()).reconcile().await?;
    if result.requeue {
        return Ok(result);
    }
    if status.user_configuration_completed_time.is_none() {
        let patch = serde_json::json!({ "userConfigurationCompletedTime": Time(Utc::now()) });
        ctx.platform.patch_status::<Jenkins>(&desired.namespace, &desired.name, patch).await.stage("user configuration status")?;
        info!(cr = %desired.name, "user configuration phase is complete");
    }
    Ok(result)
}
