//! Maps changes on secondary resources (user secrets and config maps) back to
//! the owning `Jenkins` instance.

use std::sync::Mutex;

use butler_core::{labels, Jenkins};
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

/// Change notification on a secondary resource.
#[derive(Debug, Clone, Copy)]
pub enum SecondaryEvent<'a, K> {
    Create(&'a K),
    Update { old: &'a K, new: &'a K },
    Delete(&'a K),
    Generic(&'a K),
}

/// Reconcile key of the owning instance, when the object carries all router labels.
pub fn owner_key<K: Resource>(obj: &K) -> Option<ObjectRef<Jenkins>> {
    let meta = obj.meta();
    let owner = meta.labels.as_ref().and_then(labels::owner_from_labels)?;
    let mut key = ObjectRef::new(owner);
    if let Some(ns) = meta.namespace.as_deref() {
        key = key.within(ns);
    }
    Some(key)
}

/// Decide which instance (if any) a change should reconcile.
pub fn route<K>(event: SecondaryEvent<'_, K>) -> Option<ObjectRef<Jenkins>>
where
    K: Resource<DynamicType = ()> + PartialEq,
{
    match event {
        SecondaryEvent::Create(obj) | SecondaryEvent::Delete(obj) | SecondaryEvent::Generic(obj) => owner_key(obj),
        SecondaryEvent::Update { old, new } => {
            let before = owner_key(old);
            let after = owner_key(new);
            if let Some(owner) = after.as_ref().or(before.as_ref()) {
                if old != new {
                    info!(cr = %owner.name, "{}/{} has been updated", K::kind(&()), new.name_any());
                } else {
                    debug!(cr = %owner.name, "{}/{} resynced without changes", K::kind(&()), new.name_any());
                }
            }
            before.or(after)
        }
    }
}

/// Remembers the last payload per object so watch events (which only carry the
/// new object) can be routed as creates or updates.
pub struct ChangeTracker<K> {
    seen: Mutex<FxHashMap<(String, String), K>>,
}

impl<K> Default for ChangeTracker<K> {
    fn default() -> Self { Self { seen: Mutex::new(FxHashMap::default()) } }
}

impl<K> ChangeTracker<K>
where
    K: Resource<DynamicType = ()> + PartialEq + Clone,
{
    pub fn new() -> Self { Self::default() }

    pub fn observe(&self, obj: K) -> Option<ObjectRef<Jenkins>> {
        let key = (obj.namespace().unwrap_or_default(), obj.name_any());
        let mut seen = match self.seen.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let routed = match seen.get(&key) {
            Some(old) => route(SecondaryEvent::Update { old, new: &obj }),
            None => route(SecondaryEvent::Create(&obj)),
        };
        if owner_key(&obj).is_some() {
            seen.insert(key, obj);
        } else {
            seen.remove(&key);
        }
        routed
    }

    pub fn len(&self) -> usize { self.seen.lock().map(|g| g.len()).unwrap_or(0) }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn secret(labels: BTreeMap<String, String>, data: &str) -> Secret {
        Secret {
            metadata: ObjectMeta { name: Some("creds".into()), namespace: Some("build".into()), labels: Some(labels), ..Default::default() },
            string_data: Some(BTreeMap::from([("k".to_string(), data.to_string())])),
            ..Default::default()
        }
    }

    #[test]
    fn routes_watched_objects_to_owner() {
        let s = secret(labels::watched_labels("ci"), "a");
        let key = route(SecondaryEvent::Create(&s)).unwrap();
        assert_eq!(key.name, "ci");
        assert_eq!(key.namespace.as_deref(), Some("build"));
        assert!(route(SecondaryEvent::Delete(&s)).is_some());
    }

    #[test]
    fn ignores_objects_missing_a_label() {
        let s = secret(labels::resource_labels("ci"), "a");
        assert!(route(SecondaryEvent::Generic(&s)).is_none());
        let cm = ConfigMap::default();
        assert!(owner_key(&cm).is_none());
    }

    #[test]
    fn update_enqueues_whether_or_not_payload_changed() {
        let old = secret(labels::watched_labels("ci"), "a");
        let new = secret(labels::watched_labels("ci"), "b");
        assert!(route(SecondaryEvent::Update { old: &old, new: &new }).is_some());
        assert!(route(SecondaryEvent::Update { old: &old, new: &old }).is_some());
    }

    #[test]
    fn update_that_adds_labels_still_routes() {
        let old = secret(BTreeMap::new(), "a");
        let new = secret(labels::watched_labels("ci"), "a");
        assert_eq!(route(SecondaryEvent::Update { old: &old, new: &new }).unwrap().name, "ci");
    }

    #[test]
    fn tracker_remembers_only_owned_objects() {
        let tracker = ChangeTracker::<Secret>::new();
        assert!(tracker.observe(secret(BTreeMap::new(), "a")).is_none());
        assert!(tracker.is_empty());
        assert!(tracker.observe(secret(labels::watched_labels("ci"), "a")).is_some());
        assert!(tracker.observe(secret(labels::watched_labels("ci"), "b")).is_some());
        assert_eq!(tracker.len(), 1);
    }
}
