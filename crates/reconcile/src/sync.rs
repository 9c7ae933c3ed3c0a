//! Resource synchronizer: makes every supporting object exist and match its
//! desired shape, writing only when something actually differs.

use std::collections::BTreeMap;

use butler_core::{labels, DesiredState, Error, Result, Route, StageContext};
use butler_core::crd::Customization;
use butler_kubehub::{Managed, Platform, RouteCapability};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::{rbac, templates};

/// Create `desired` when missing; otherwise replace with `merge(existing, desired)`
/// only when the merge changed something.
pub async fn ensure<P, K, F>(platform: &P, namespace: &str, desired: K, merge: F) -> Result<K>
where
    P: Platform,
    K: Managed,
    F: FnOnce(K, &K) -> K,
{
    let name = desired.meta().name.clone().ok_or(Error::MissingObjectKey(".metadata.name"))?;
    match platform.get::<K>(namespace, &name).await? {
        None => match platform.create(namespace, &desired).await {
            Ok(created) => {
                info!(kind = %K::kind(&()), name = %name, ns = %namespace, "created");
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                debug!(kind = %K::kind(&()), name = %name, "created concurrently");
                Ok(desired)
            }
            Err(e) => Err(e),
        },
        Some(existing) => {
            let merged = merge(existing.clone(), &desired);
            if merged == existing {
                return Ok(existing);
            }
            debug!(kind = %K::kind(&()), name = %name, ns = %namespace, "updating");
            platform.replace(namespace, &merged).await
        }
    }
}

/// Add the desired labels and owner to existing metadata, keeping everything else.
pub fn adopt(meta: &mut ObjectMeta, desired: &ObjectMeta) {
    if let Some(want) = &desired.labels {
        meta.labels.get_or_insert_with(BTreeMap::new).extend(want.clone());
    }
    if meta.owner_references.as_ref().map_or(true, Vec::is_empty) {
        meta.owner_references = desired.owner_references.clone();
    }
}

fn replace_data(mut existing: ConfigMap, desired: &ConfigMap) -> ConfigMap {
    adopt(&mut existing.metadata, &desired.metadata);
    existing.data = desired.data.clone();
    existing
}

pub struct Synchronizer<'a, P> {
    platform: &'a P,
    desired: &'a DesiredState,
    routes: &'a RouteCapability,
}

impl<'a, P: Platform> Synchronizer<'a, P> {
    pub fn new(platform: &'a P, desired: &'a DesiredState, routes: &'a RouteCapability) -> Self { Self { platform, desired, routes } }

    fn ns(&self) -> &str { &self.desired.namespace }

    /// Every supporting resource, in dependency order.
    pub async fn ensure_resources(&self) -> Result<()> {
        let d = self.desired;
        self.ensure_credentials_secret().await.stage("credentials secret")?;
        ensure(self.platform, self.ns(), templates::scripts_config_map(d), replace_data).await.stage("scripts config map")?;
        ensure(self.platform, self.ns(), templates::init_configuration_config_map(d), replace_data).await.stage("init configuration config map")?;
        ensure(self.platform, self.ns(), templates::base_configuration_config_map(d), replace_data).await.stage("base configuration config map")?;
        self.label_watched(&d.groovy_scripts).await.stage("groovy scripts watched labels")?;
        self.label_watched(&d.configuration_as_code).await.stage("configuration as code watched labels")?;
        rbac::ensure_base(self.platform, d).await.stage("service account, role and role binding")?;
        rbac::ensure_extra_bindings(self.platform, d).await.stage("extra role bindings")?;
        for target in [&d.http_service, &d.slave_service] {
            let svc = templates::service(d, target);
            ensure(self.platform, self.ns(), svc, |existing: Service, _| templates::apply_service(existing, d, target)).await.stage("service")?;
        }
        if self.routes.available(self.platform).await.stage("route api probe")? {
            ensure(self.platform, self.ns(), templates::route(d), |existing: Route, _| templates::apply_route(existing, d)).await.stage("route")?;
        }
        debug!(cr = %d.name, "kubernetes resources are present");
        Ok(())
    }

    /// A fresh password is generated only when the secret or one of its keys is missing.
    async fn ensure_credentials_secret(&self) -> Result<()> {
        let desired = templates::credentials_secret(self.desired);
        ensure(self.platform, self.ns(), desired, |mut existing: Secret, desired| {
            let data = existing.data.get_or_insert_with(BTreeMap::new);
            if !data.contains_key(labels::CREDENTIALS_USER_KEY) || !data.contains_key(labels::CREDENTIALS_PASSWORD_KEY) {
                *data = desired.data.clone().unwrap_or_default();
            }
            adopt(&mut existing.metadata, &desired.metadata);
            existing
        })
        .await?;
        Ok(())
    }

    /// Label the user's secret and config maps so their changes reach the router.
    async fn label_watched(&self, customization: &Customization) -> Result<()> {
        let want = labels::watched_labels(&self.desired.name);
        if !customization.secret.name.is_empty() {
            let secret = self.user_object::<Secret>(&customization.secret.name).await?;
            self.add_labels(secret, &want).await?;
        }
        for cm in &customization.configurations {
            let config_map = self.user_object::<ConfigMap>(&cm.name).await?;
            self.add_labels(config_map, &want).await?;
        }
        Ok(())
    }

    async fn user_object<K: Managed>(&self, name: &str) -> Result<K> {
        self.platform
            .get::<K>(self.ns(), name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {}/{}", K::kind(&()), self.ns(), name)))
    }

    async fn add_labels<K: Managed>(&self, mut obj: K, want: &BTreeMap<String, String>) -> Result<()> {
        if labels::contains_all(want, obj.meta().labels.as_ref()) {
            return Ok(());
        }
        obj.labels_mut().extend(want.clone());
        self.platform.replace(self.ns(), &obj).await?;
        info!(cr = %self.desired.name, kind = %K::kind(&()), name = %obj.name_any(), "added watched labels");
        Ok(())
    }
}
