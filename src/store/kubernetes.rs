//! Kubernetes Record Store
//!
//! Backs the record store port with the Kubernetes API server. Optimistic
//! concurrency comes from `metadata.resourceVersion`: replaces and status
//! patches carry the version the writer read, and a 409 from the server is
//! surfaced as a version conflict.

use crate::crd::Record;
use crate::domain::ports::{RecordStore, WatchEvent, WatchStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

// =============================================================================
// Kube Store
// =============================================================================

/// Record store for one namespaced custom resource kind
pub struct KubeStore<K> {
    api: Api<K>,
    namespace: String,
}

impl<K> KubeStore<K>
where
    K: Record + Resource<Scope = NamespaceResourceScope>,
{
    /// Create a store scoped to `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    /// Namespace this store operates in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// Render an equality-based label selector
fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Map API server status codes onto the store's error vocabulary
fn map_api_error<K: Record>(err: kube::Error, name: &str, expected: Option<&str>) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => Error::not_found(K::KIND.to_string(), name),
        kube::Error::Api(resp) if resp.code == 409 => match expected {
            Some(version) => Error::VersionConflict {
                kind: K::KIND.to_string(),
                name: name.to_string(),
                expected: version.to_string(),
            },
            None => Error::Conflict {
                kind: K::KIND.to_string(),
                name: name.to_string(),
                reason: resp.message.clone(),
            },
        },
        _ => Error::Kube(err),
    }
}

#[async_trait]
impl<K> RecordStore<K> for KubeStore<K>
where
    K: Record + Resource<Scope = NamespaceResourceScope>,
{
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if !labels.is_empty() {
            params = params.labels(&label_selector(labels));
        }
        Ok(self.api.list(&params).await?.items)
    }

    async fn create(&self, record: K) -> Result<K> {
        let name = record.name_any();
        debug!(kind = %K::KIND, name = %name, "Creating record");
        self.api
            .create(&PostParams::default(), &record)
            .await
            .map_err(|e| map_api_error::<K>(e, &name, None))
    }

    async fn update(&self, record: K) -> Result<K> {
        let name = record.name_any();
        let expected = record.resource_version().unwrap_or_default();
        self.api
            .replace(&name, &PostParams::default(), &record)
            .await
            .map_err(|e| map_api_error::<K>(e, &name, Some(&expected)))
    }

    async fn update_status(&self, record: K) -> Result<K> {
        let name = record.name_any();
        let expected = record.resource_version().unwrap_or_default();
        let status = serde_json::to_value(&record)?
            .get("status")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        // resourceVersion in a merge patch makes the server check it
        let patch = json!({
            "metadata": { "resourceVersion": expected },
            "status": status,
        });

        self.api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_api_error::<K>(e, &name, Some(&expected)))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_api_error::<K>(e, name, None))
    }

    fn watch(&self) -> WatchStream<K> {
        watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .map(|event| match event {
                Ok(watcher::Event::Applied(record)) => Ok(WatchEvent::Applied(record)),
                Ok(watcher::Event::Deleted(record)) => Ok(WatchEvent::Deleted(record)),
                Ok(watcher::Event::Restarted(records)) => Ok(WatchEvent::Restarted(records)),
                Err(e) => Err(Error::Watch(e.to_string())),
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector() {
        let mut labels = BTreeMap::new();
        labels.insert("storage.billyronks.io/nodeid".to_string(), "node-a".to_string());
        labels.insert("storage.billyronks.io/pool".to_string(), "tank".to_string());
        assert_eq!(
            label_selector(&labels),
            "storage.billyronks.io/nodeid=node-a,storage.billyronks.io/pool=tank"
        );
    }
}
