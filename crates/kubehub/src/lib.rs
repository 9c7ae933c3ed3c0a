//! Butler kubehub: typed platform access, the route capability probe, and
//! label-driven routing of secondary resource events.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use butler_core::Result;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};

pub mod capability;
pub mod client;
pub mod memory;
pub mod router;

pub use capability::RouteCapability;
pub use client::KubePlatform;
pub use memory::{MemoryPlatform, Write};
pub use router::{owner_key, route, ChangeTracker, SecondaryEvent};

/// Namespaced kinds the operator reads and writes.
pub trait Managed:
    Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Managed for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Resource store of the platform. Writes are plain create/replace; callers
/// decide whether a write is needed so repeated cycles stay write-free.
#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>>;
    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K>;
    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K>;
    async fn list<K: Managed>(&self, namespace: &str) -> Result<Vec<K>>;
    /// Deleting an object that is already gone succeeds.
    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<()>;
    /// Merge `status` into the object's status subresource.
    async fn patch_status<K: Managed>(&self, namespace: &str, name: &str, status: serde_json::Value) -> Result<()>;
    /// Whether the API server serves `group/version`.
    async fn supports_api(&self, group_version: &str) -> Result<bool>;
}
