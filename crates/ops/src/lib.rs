//! Butler ops: imperative restart of the managed Jenkins master.
//!
//! Reconcile code never deletes the workload itself; it asks a [`Restarter`].

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use butler_core::{DesiredState, Error, Jenkins, RestartReason, Result, StageContext};
use butler_kubehub::Platform;
use butler_persist::{ChecksumStore, ConfigMapChecksumStore};
use k8s_openapi::api::core::v1::Pod;
use metrics::counter;
use tracing::info;

#[async_trait::async_trait]
pub trait Restarter: Send + Sync {
    /// Request a restart. Returns once the request is accepted, not once the
    /// instance is back.
    async fn restart_managed_instance(&self, desired: &DesiredState, reason: &RestartReason) -> Result<()>;
}

/// Deletes the master pod and resets provisioning state so the next cycle
/// recreates the pod and re-applies every payload.
pub struct KubeRestarter<P> {
    platform: Arc<P>,
}

impl<P: Platform> KubeRestarter<P> {
    pub fn new(platform: Arc<P>) -> Self { Self { platform } }
}

#[async_trait::async_trait]
impl<P: Platform + 'static> Restarter for KubeRestarter<P> {
    async fn restart_managed_instance(&self, desired: &DesiredState, reason: &RestartReason) -> Result<()> {
        let pod = desired.pod_name();
        info!(cr = %desired.name, pod = %pod, source = %reason.source, messages = ?reason.messages, "restarting jenkins master");
        self.platform.delete::<Pod>(&desired.namespace, &pod).await.stage("delete master pod")?;
        // provisionStartTime stays until the replacement pod restamps it
        let cleared = serde_json::json!({
            "baseConfigurationCompletedTime": null,
            "userConfigurationCompletedTime": null,
        });
        self.platform.patch_status::<Jenkins>(&desired.namespace, &desired.name, cleared).await.stage("reset status")?;
        // clearing drops records of every source, not just this one
        ConfigMapChecksumStore::new(self.platform.clone(), desired, "base-groovy").clear().await.stage("clear checksums")?;
        counter!("restarts_total", 1u64, "source" => reason.source.to_string());
        Ok(())
    }
}

/// Records restart requests instead of acting on them.
#[derive(Default)]
pub struct RecordingRestarter {
    calls: Mutex<Vec<(String, RestartReason)>>,
    fail: bool,
}

impl RecordingRestarter {
    pub fn new() -> Self { Self::default() }
    pub fn failing() -> Self { Self { fail: true, ..Self::default() } }
    pub fn calls(&self) -> Vec<(String, RestartReason)> { self.calls.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl Restarter for RecordingRestarter {
    async fn restart_managed_instance(&self, desired: &DesiredState, reason: &RestartReason) -> Result<()> {
        self.calls.lock().unwrap().push((desired.name.clone(), reason.clone()));
        if self.fail {
            return Err(Error::Restart(format!("restart of {} refused", desired.name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butler_core::{labels, JenkinsStatus};
    use butler_kubehub::{MemoryPlatform, Write};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    fn jenkins() -> Jenkins {
        let mut j = Jenkins::new("ci", Default::default());
        j.metadata.namespace = Some("build".into());
        j.status = Some(JenkinsStatus {
            provision_start_time: Some(Time(chrono::Utc::now())),
            base_configuration_completed_time: Some(Time(chrono::Utc::now())),
            ..Default::default()
        });
        j
    }

    #[tokio::test]
    async fn restart_deletes_pod_and_resets_configuration() {
        let p = Arc::new(MemoryPlatform::new());
        let j = jenkins();
        p.insert("build", j.clone());
        p.insert("build", Pod { metadata: ObjectMeta { name: Some(labels::master_pod_name("ci")), ..Default::default() }, ..Default::default() });
        let d = DesiredState::from_jenkins(&j).unwrap();
        let store = ConfigMapChecksumStore::new(p.clone(), &d, "user-groovy");
        store.put("a.groovy", "h").await.unwrap();

        KubeRestarter::new(p.clone()).restart_managed_instance(&d, &RestartReason::operator("plugins changed")).await.unwrap();

        assert!(p.object::<Pod>("build", "jenkins-ci").is_none());
        let status = p.object::<Jenkins>("build", "ci").unwrap().status.unwrap();
        assert!(status.provision_start_time.is_some());
        assert!(status.base_configuration_completed_time.is_none());
        assert!(store.get("a.groovy").await.unwrap().is_none());
        assert!(p.writes().contains(&Write::Delete { kind: "Pod".into(), name: "jenkins-ci".into() }));
    }

    #[tokio::test]
    async fn recording_restarter_keeps_reasons() {
        let r = RecordingRestarter::new();
        let mut j = Jenkins::new("ci", Default::default());
        j.metadata.namespace = Some("build".into());
        let d = DesiredState::from_jenkins(&j).unwrap();
        r.restart_managed_instance(&d, &RestartReason::platform("Container 'jenkins-master' is terminated")).await.unwrap();
        assert_eq!(r.calls().len(), 1);
        assert!(RecordingRestarter::failing().restart_managed_instance(&d, &RestartReason::user(vec!["x".into()])).await.is_err());
    }
}
