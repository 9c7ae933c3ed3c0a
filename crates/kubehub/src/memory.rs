//! In-memory platform with a write log, for exercising reconcile logic
//! without an API server.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use butler_core::{Error, Result};
use kube::core::ErrorResponse;
use serde_json::Value as Json;

use crate::{Managed, Platform};

/// A write the platform accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Create { kind: String, name: String },
    Replace { kind: String, name: String },
    Delete { kind: String, name: String },
    Status { kind: String, name: String },
}

impl Write {
    pub fn kind(&self) -> &str {
        match self {
            Write::Create { kind, .. } | Write::Replace { kind, .. } | Write::Delete { kind, .. } | Write::Status { kind, .. } => kind,
        }
    }
}

type Key = (String, String, String); // (kind, namespace, name)

#[derive(Default)]
pub struct MemoryPlatform {
    objects: Mutex<BTreeMap<Key, Json>>,
    writes: Mutex<Vec<Write>>,
    apis: Mutex<BTreeSet<String>>,
    next_rv: AtomicU64,
    probes: AtomicUsize,
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse { status: "Failure".into(), message, reason: reason.into(), code }))
}

fn key<K: Managed>(namespace: &str, name: &str) -> Key {
    (K::kind(&()).to_string(), namespace.to_string(), name.to_string())
}

impl MemoryPlatform {
    pub fn new() -> Self { Self::default() }

    /// Serve an extra API group version (e.g. `route.openshift.io/v1`).
    pub fn with_api(self, group_version: &str) -> Self {
        self.apis.lock().unwrap().insert(group_version.to_string());
        self
    }

    /// Seed an object without recording a write.
    pub fn insert<K: Managed>(&self, namespace: &str, obj: K) {
        let name = obj.meta().name.clone().unwrap_or_default();
        let mut v = serde_json::to_value(&obj).expect("serializable object");
        self.stamp(&mut v, namespace);
        self.objects.lock().unwrap().insert(key::<K>(namespace, &name), v);
    }

    pub fn object<K: Managed>(&self, namespace: &str, name: &str) -> Option<K> {
        let objects = self.objects.lock().unwrap();
        objects.get(&key::<K>(namespace, name)).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn names<K: Managed>(&self, namespace: &str) -> Vec<String> {
        let kind = K::kind(&()).to_string();
        let objects = self.objects.lock().unwrap();
        objects.keys().filter(|(k, ns, _)| *k == kind && ns == namespace).map(|(_, _, n)| n.clone()).collect()
    }

    pub fn writes(&self) -> Vec<Write> { self.writes.lock().unwrap().clone() }
    pub fn clear_writes(&self) { self.writes.lock().unwrap().clear(); }
    pub fn probe_count(&self) -> usize { self.probes.load(Ordering::SeqCst) }

    fn stamp(&self, v: &mut Json, namespace: &str) {
        let rv = self.next_rv.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("namespace".into(), Json::String(namespace.to_string()));
            meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
            if !meta.contains_key("uid") {
                meta.insert("uid".into(), Json::String(format!("00000000-0000-0000-0000-{:012}", rv)));
            }
        }
    }

    fn record(&self, w: Write) { self.writes.lock().unwrap().push(w); }
}

fn merge(target: &mut Json, patch: &Json) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(t), Some(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                } else if v.is_object() && t.get(k).is_some_and(|cur| cur.is_object()) {
                    if let Some(cur) = t.get_mut(k) { merge(cur, v); }
                } else {
                    t.insert(k.clone(), v.clone());
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

#[async_trait::async_trait]
impl Platform for MemoryPlatform {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let objects = self.objects.lock().unwrap();
        match objects.get(&key::<K>(namespace, name)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let k = key::<K>(namespace, &name);
        let mut v = serde_json::to_value(obj)?;
        {
            let mut objects = self.objects.lock().unwrap();
            if objects.contains_key(&k) {
                return Err(api_error(409, "AlreadyExists", format!("{} \"{}\" already exists", k.0, name)));
            }
            self.stamp(&mut v, namespace);
            objects.insert(k.clone(), v.clone());
        }
        self.record(Write::Create { kind: k.0, name });
        Ok(serde_json::from_value(v)?)
    }

    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let k = key::<K>(namespace, &name);
        let mut v = serde_json::to_value(obj)?;
        {
            let mut objects = self.objects.lock().unwrap();
            let Some(current) = objects.get(&k) else {
                return Err(api_error(404, "NotFound", format!("{} \"{}\" not found", k.0, name)));
            };
            let current_rv = current.pointer("/metadata/resourceVersion").cloned();
            let sent_rv = v.pointer("/metadata/resourceVersion").cloned();
            if sent_rv.is_some() && sent_rv != current_rv {
                return Err(api_error(409, "Conflict", format!("{} \"{}\" was modified", k.0, name)));
            }
            if let (Some(uid), Some(meta)) = (current.pointer("/metadata/uid").cloned(), v.get_mut("metadata").and_then(|m| m.as_object_mut())) {
                meta.insert("uid".into(), uid);
            }
            self.stamp(&mut v, namespace);
            objects.insert(k.clone(), v.clone());
        }
        self.record(Write::Replace { kind: k.0, name });
        Ok(serde_json::from_value(v)?)
    }

    async fn list<K: Managed>(&self, namespace: &str) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let objects = self.objects.lock().unwrap();
        objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(Error::from))
            .collect()
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<()> {
        let k = key::<K>(namespace, name);
        let removed = self.objects.lock().unwrap().remove(&k).is_some();
        if removed {
            self.record(Write::Delete { kind: k.0, name: name.to_string() });
        }
        Ok(())
    }

    async fn patch_status<K: Managed>(&self, namespace: &str, name: &str, status: Json) -> Result<()> {
        let k = key::<K>(namespace, name);
        {
            let mut objects = self.objects.lock().unwrap();
            let Some(current) = objects.get_mut(&k) else {
                return Err(api_error(404, "NotFound", format!("{} \"{}\" not found", k.0, name)));
            };
            let obj = current.as_object_mut().ok_or(Error::MissingObjectKey("status"))?;
            let slot = obj.entry("status").or_insert_with(|| Json::Object(Default::default()));
            merge(slot, &status);
        }
        self.record(Write::Status { kind: k.0, name: name.to_string() });
        Ok(())
    }

    async fn supports_api(&self, group_version: &str) -> Result<bool> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.apis.lock().unwrap().contains(group_version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn cm(name: &str) -> ConfigMap {
        ConfigMap { metadata: ObjectMeta { name: Some(name.into()), ..Default::default() }, ..Default::default() }
    }

    #[tokio::test]
    async fn create_twice_reports_already_exists() {
        let p = MemoryPlatform::new();
        p.create("ns", &cm("a")).await.unwrap();
        let err = p.create("ns", &cm("a")).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(p.writes().len(), 1);
    }

    #[tokio::test]
    async fn replace_with_stale_version_conflicts() {
        let p = MemoryPlatform::new();
        let first = p.create("ns", &cm("a")).await.unwrap();
        p.replace("ns", &first).await.unwrap();
        let err = p.replace("ns", &first).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn missing_objects_are_none_and_deletes_are_quiet() {
        let p = MemoryPlatform::new();
        assert!(p.get::<ConfigMap>("ns", "nope").await.unwrap().is_none());
        p.delete::<ConfigMap>("ns", "nope").await.unwrap();
        assert!(p.writes().is_empty());
    }
}
