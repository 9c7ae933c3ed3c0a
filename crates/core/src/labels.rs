//! Naming and labelling convention for everything the operator owns.
//!
//! Ownership is decided purely by these names and labels, so every create and
//! every delete in the workspace goes through the helpers below.

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::RoleRef;

pub const LABEL_APP_KEY: &str = "app";
pub const LABEL_APP_VALUE: &str = "jenkins-operator";
pub const LABEL_WATCH_KEY: &str = "watch";
pub const LABEL_WATCH_VALUE: &str = "true";
pub const LABEL_INSTANCE_KEY: &str = "jenkins-cr";

pub const USE_DEPLOYMENT_ANNOTATION: &str = "jenkins.io/use-deployment";

pub const DEFAULT_HTTP_PORT: i32 = 8080;
pub const DEFAULT_SLAVE_PORT: i32 = 50000;

pub const CREDENTIALS_USER_KEY: &str = "user";
pub const CREDENTIALS_PASSWORD_KEY: &str = "password";
pub const OPERATOR_USER_NAME: &str = "jenkins-operator";

pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
pub const CLUSTER_ROLE_KIND: &str = "ClusterRole";
pub const ROLE_KIND: &str = "Role";

/// Labels carried by every resource of one instance (and used as the pod selector).
pub fn resource_labels(instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP_KEY.to_string(), LABEL_APP_VALUE.to_string()),
        (LABEL_INSTANCE_KEY.to_string(), instance.to_string()),
    ])
}

/// Labels that make a user-owned secret or config map visible to the event router.
pub fn watched_labels(instance: &str) -> BTreeMap<String, String> {
    let mut labels = resource_labels(instance);
    labels.insert(LABEL_WATCH_KEY.to_string(), LABEL_WATCH_VALUE.to_string());
    labels
}

/// Base name shared by the service account, role and role binding.
pub fn resource_name(instance: &str) -> String { format!("{}-{}", LABEL_APP_VALUE, instance) }

pub fn credentials_secret_name(instance: &str) -> String { format!("{}-credentials-{}", LABEL_APP_VALUE, instance) }
pub fn scripts_config_map_name(instance: &str) -> String { format!("{}-scripts-{}", LABEL_APP_VALUE, instance) }
pub fn init_configuration_config_map_name(instance: &str) -> String { format!("{}-init-configuration-{}", LABEL_APP_VALUE, instance) }
pub fn base_configuration_config_map_name(instance: &str) -> String { format!("{}-base-configuration-{}", LABEL_APP_VALUE, instance) }
pub fn checksum_config_map_name(instance: &str) -> String { format!("{}-checksums-{}", LABEL_APP_VALUE, instance) }
pub fn http_service_name(instance: &str) -> String { format!("{}-http-{}", LABEL_APP_VALUE, instance) }
pub fn slave_service_name(instance: &str) -> String { format!("{}-slave-{}", LABEL_APP_VALUE, instance) }
pub fn master_pod_name(instance: &str) -> String { format!("jenkins-{}", instance) }

fn kind_tag(role_ref: &RoleRef) -> &'static str {
    if role_ref.kind == CLUSTER_ROLE_KIND { "cr" } else { "r" }
}

/// `<resource-name>-<cr|r>-<role>` for one extra role binding.
pub fn extra_binding_name(resource_name: &str, role_ref: &RoleRef) -> String {
    format!("{}-{}-{}", resource_name, kind_tag(role_ref), role_ref.name)
}

/// True when `binding` follows the extra-binding naming pattern of `resource_name`.
pub fn is_extra_binding_name(resource_name: &str, binding: &str) -> bool {
    ["cr", "r"]
        .iter()
        .any(|tag| binding.strip_prefix(resource_name).and_then(|rest| rest.strip_prefix(&format!("-{}-", tag))).is_some_and(|role| !role.is_empty()))
}

/// Owning instance name when all three router labels are present.
pub fn owner_from_labels(labels: &BTreeMap<String, String>) -> Option<&str> {
    if labels.get(LABEL_APP_KEY).map(String::as_str) != Some(LABEL_APP_VALUE) {
        return None;
    }
    if labels.get(LABEL_WATCH_KEY).map(String::as_str) != Some(LABEL_WATCH_VALUE) {
        return None;
    }
    labels.get(LABEL_INSTANCE_KEY).map(String::as_str).filter(|n| !n.is_empty())
}

/// True when every entry of `expected` is present in `actual` with the same value.
pub fn contains_all(expected: &BTreeMap<String, String>, actual: Option<&BTreeMap<String, String>>) -> bool {
    let Some(actual) = actual else { return expected.is_empty() };
    expected.iter().all(|(k, v)| actual.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(kind: &str, name: &str) -> RoleRef {
        RoleRef { api_group: RBAC_API_GROUP.into(), kind: kind.into(), name: name.into() }
    }

    #[test]
    fn extra_binding_names_follow_kind_tag() {
        assert_eq!(extra_binding_name("jenkins-operator-ci", &role("ClusterRole", "view")), "jenkins-operator-ci-cr-view");
        assert_eq!(extra_binding_name("jenkins-operator-ci", &role("Role", "edit")), "jenkins-operator-ci-r-edit");
    }

    #[test]
    fn extra_binding_pattern_rejects_foreign_names() {
        assert!(is_extra_binding_name("jenkins-operator-ci", "jenkins-operator-ci-cr-view"));
        assert!(is_extra_binding_name("jenkins-operator-ci", "jenkins-operator-ci-r-edit"));
        assert!(!is_extra_binding_name("jenkins-operator-ci", "jenkins-operator-ci"));
        assert!(!is_extra_binding_name("jenkins-operator-ci", "jenkins-operator-ci-r-"));
        assert!(!is_extra_binding_name("jenkins-operator-ci", "admin"));
        assert!(!is_extra_binding_name("jenkins-operator-ci", "jenkins-operator-cid-r-edit"));
    }

    #[test]
    fn owner_requires_all_three_labels() {
        assert_eq!(owner_from_labels(&watched_labels("ci")), Some("ci"));
        assert_eq!(owner_from_labels(&resource_labels("ci")), None);
        let mut wrong_app = watched_labels("ci");
        wrong_app.insert(LABEL_APP_KEY.into(), "other".into());
        assert_eq!(owner_from_labels(&wrong_app), None);
        let mut empty_owner = watched_labels("");
        empty_owner.insert(LABEL_INSTANCE_KEY.into(), String::new());
        assert_eq!(owner_from_labels(&empty_owner), None);
    }
}
