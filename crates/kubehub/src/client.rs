use butler_core::{Error, Result};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, Resource,
};
use metrics::counter;
use tracing::debug;

use crate::{Managed, Platform};

/// Platform backed by a live API server.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self> { Ok(Self::new(Client::try_default().await?)) }

    pub fn client(&self) -> &Client { &self.client }

    fn api<K: Managed>(&self, namespace: &str) -> Api<K> { Api::namespaced(self.client.clone(), namespace) }
}

fn name_of<K: Managed>(obj: &K) -> Result<&str> {
    obj.meta().name.as_deref().ok_or(Error::MissingObjectKey(".metadata.name"))
}

#[async_trait::async_trait]
impl Platform for KubePlatform {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let created = self.api::<K>(namespace).create(&PostParams::default(), obj).await?;
        counter!("platform_writes_total", 1u64, "verb" => "create");
        debug!(kind = %K::kind(&()), name = %name_of(obj)?, ns = %namespace, "created");
        Ok(created)
    }

    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = name_of(obj)?;
        let replaced = self.api::<K>(namespace).replace(name, &PostParams::default(), obj).await?;
        counter!("platform_writes_total", 1u64, "verb" => "replace");
        debug!(kind = %K::kind(&()), name = %name, ns = %namespace, "replaced");
        Ok(replaced)
    }

    async fn list<K: Managed>(&self, namespace: &str) -> Result<Vec<K>> {
        Ok(self.api::<K>(namespace).list(&ListParams::default()).await?.items)
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<()> {
        match self.api::<K>(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                counter!("platform_writes_total", 1u64, "verb" => "delete");
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status<K: Managed>(&self, namespace: &str, name: &str, status: serde_json::Value) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api::<K>(namespace).patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        counter!("platform_writes_total", 1u64, "verb" => "patch_status");
        Ok(())
    }

    async fn supports_api(&self, group_version: &str) -> Result<bool> {
        match self.client.list_api_group_resources(group_version).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
