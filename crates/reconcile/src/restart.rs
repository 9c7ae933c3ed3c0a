use std::sync::Arc;

use butler_core::{DesiredState, Jenkins, NotificationEvent, Phase, Reason, RestartReason, Result, Severity};
use butler_kubehub::Platform;
use butler_notify::notify;
use tracing::info;

use crate::Context;

/// Announce the restart, then hand it to the restarter. The request is not awaited beyond acceptance.
pub async fn restart<P: Platform>(ctx: &Context<P>, jenkins: &Arc<Jenkins>, desired: &DesiredState, reason: RestartReason) -> Result<()> {
    info!(cr = %desired.name, source = %reason.source, messages = ?reason.messages, "restart requested");
    notify(
        &ctx.notifier,
        NotificationEvent { target: jenkins.clone(), phase: Phase::Base, severity: Severity::Warning, reason: Reason::PodRestart(reason.clone()) },
    );
    ctx.restarter.restart_managed_instance(desired, &reason).await
}
