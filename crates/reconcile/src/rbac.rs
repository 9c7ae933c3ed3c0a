//! Service account, role and bindings of the instance.
//!
//! Extra bindings are the one place the operator deletes anything: bindings
//! that follow the instance's naming pattern, carry its instance label, and
//! are no longer wanted.

use std::collections::BTreeSet;

use butler_core::{labels, DesiredState, Result};
use butler_kubehub::Platform;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::ResourceExt;
use metrics::counter;
use tracing::{debug, info};

use crate::sync::{adopt, ensure};
use crate::templates;

pub async fn ensure_base<P: Platform>(platform: &P, desired: &DesiredState) -> Result<()> {
    let ns = desired.namespace.as_str();
    ensure(platform, ns, templates::service_account(desired), |mut existing: ServiceAccount, want| {
        adopt(&mut existing.metadata, &want.metadata);
        existing
    })
    .await?;
    ensure(platform, ns, templates::role(desired), |mut existing: Role, want| {
        adopt(&mut existing.metadata, &want.metadata);
        existing.rules = want.rules.clone();
        existing
    })
    .await?;
    ensure(platform, ns, templates::base_role_binding(desired), |mut existing: RoleBinding, want| {
        adopt(&mut existing.metadata, &want.metadata);
        existing.subjects = want.subjects.clone();
        existing
    })
    .await?;
    Ok(())
}

/// Create one binding per desired role, then delete managed bindings that are
/// no longer desired. Returns how many were deleted.
pub async fn ensure_extra_bindings<P: Platform>(platform: &P, desired: &DesiredState) -> Result<usize> {
    let ns = desired.namespace.as_str();
    let mut wanted = BTreeSet::new();
    for role_ref in &desired.roles {
        let name = labels::extra_binding_name(&desired.resource_name, role_ref);
        let binding = templates::role_binding(desired, name.clone(), role_ref.clone());
        match platform.create(ns, &binding).await {
            Ok(_) => info!(cr = %desired.name, binding = %name, "role binding created"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
        wanted.insert(name);
    }

    let mut deleted = 0;
    for binding in platform.list::<RoleBinding>(ns).await? {
        let name = binding.name_any();
        if !is_managed_extra(desired, &binding) || wanted.contains(&name) {
            continue;
        }
        info!(cr = %desired.name, binding = %name, "deleting role binding");
        platform.delete::<RoleBinding>(ns, &name).await?;
        counter!("rbac_bindings_deleted_total", 1u64);
        deleted += 1;
    }
    debug!(cr = %desired.name, wanted = wanted.len(), deleted, "extra role bindings are present");
    Ok(deleted)
}

/// Named `<resource>-<cr|r>-<role>` and labelled with this instance.
fn is_managed_extra(desired: &DesiredState, binding: &RoleBinding) -> bool {
    labels::is_extra_binding_name(&desired.resource_name, &binding.name_any())
        && binding.labels().get(labels::LABEL_INSTANCE_KEY).map(String::as_str) == Some(desired.name.as_str())
}
