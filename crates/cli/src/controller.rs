//! kube-runtime wiring: watches, the reconcile entry point and the mapping
//! from cycle results to scheduler actions.

use std::sync::Arc;
use std::time::Duration;

use butler_core::{labels, Error, Jenkins, ReconcileResult};
use butler_kubehub::{ChangeTracker, KubePlatform, Managed};
use butler_reconcile::{reconcile_instance, Context};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, warn};

/// A plain requeue still goes through the scheduler with a short pause.
const IMMEDIATE_REQUEUE: Duration = Duration::from_secs(1);

pub struct State {
    pub ctx: Context<KubePlatform>,
    pub error_backoff: Duration,
    pub resync: Option<Duration>,
}

fn api<K: Managed>(client: &Client, namespace: Option<&str>) -> Api<K> {
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Terminal results wait for the instance (or its pod) to change.
pub fn to_action(result: ReconcileResult, resync: Option<Duration>) -> Action {
    if result.terminal {
        return Action::await_change();
    }
    match (result.requeue, result.requeue_after) {
        (true, Some(after)) => Action::requeue(after),
        (true, None) => Action::requeue(IMMEDIATE_REQUEUE),
        (false, _) => resync.map_or_else(Action::await_change, Action::requeue),
    }
}

async fn reconcile(jenkins: Arc<Jenkins>, state: Arc<State>) -> Result<Action, Error> {
    let result = reconcile_instance(jenkins, &state.ctx).await?;
    Ok(to_action(result, state.resync))
}

fn error_policy(jenkins: Arc<Jenkins>, err: &Error, state: Arc<State>) -> Action {
    warn!(cr = %jenkins.name_any(), error = %err, "reconcile failed, retrying");
    Action::requeue(state.error_backoff)
}

pub async fn run(client: Client, namespace: Option<&str>, state: State) {
    let watched = watcher::Config::default().labels(&format!(
        "{}={},{}={}",
        labels::LABEL_APP_KEY,
        labels::LABEL_APP_VALUE,
        labels::LABEL_WATCH_KEY,
        labels::LABEL_WATCH_VALUE
    ));
    let secrets = Arc::new(ChangeTracker::<Secret>::new());
    let config_maps = Arc::new(ChangeTracker::<ConfigMap>::new());

    Controller::new(api::<Jenkins>(&client, namespace), watcher::Config::default())
        .owns(api::<Pod>(&client, namespace), watcher::Config::default())
        .owns(api::<Deployment>(&client, namespace), watcher::Config::default())
        .watches(api::<Secret>(&client, namespace), watched.clone(), move |s| secrets.observe(s))
        .watches(api::<ConfigMap>(&client, namespace), watched, move |cm| config_maps.observe(cm))
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(state))
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(cr = %obj.name, "reconciled"),
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_map_to_actions() {
        let resync = Some(Duration::from_secs(600));
        assert_eq!(to_action(ReconcileResult::terminal(), resync), Action::await_change());
        assert_eq!(to_action(ReconcileResult::requeue_after(Duration::from_secs(5)), None), Action::requeue(Duration::from_secs(5)));
        assert_eq!(to_action(ReconcileResult::requeue(), None), Action::requeue(IMMEDIATE_REQUEUE));
        assert_eq!(to_action(ReconcileResult::done(), resync), Action::requeue(Duration::from_secs(600)));
        assert_eq!(to_action(ReconcileResult::done(), None), Action::await_change());
    }
}
