//! In-Memory Record Store
//!
//! A versioned record store backed by DashMap with broadcast watch events.
//! Implements the same compare-and-set and finalizer semantics as the
//! Kubernetes API server, so the orchestrator and reconcilers can run
//! against it unchanged in tests and standalone setups.

use crate::crd::Record;
use crate::domain::ports::{RecordStore, WatchEvent, WatchStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Capacity of the watch event channel
const WATCH_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory record store for one record kind
pub struct MemoryStore<K: Record> {
    /// Namespace stamped on created records
    namespace: String,
    /// Records by name
    records: DashMap<String, K>,
    /// Monotonic resourceVersion source
    version: AtomicU64,
    /// Pending injected version conflicts
    injected_conflicts: AtomicUsize,
    /// Watch event broadcaster
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K: Record> MemoryStore<K> {
    /// Create an empty store
    pub fn new(namespace: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            namespace: namespace.into(),
            records: DashMap::new(),
            version: AtomicU64::new(0),
            injected_conflicts: AtomicUsize::new(0),
            events,
        }
    }

    /// Number of records currently stored
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Make the next `count` guarded writes fail with a version conflict,
    /// as if another writer had raced ahead.
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn publish(&self, event: WatchEvent<K>) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> Vec<K> {
        let mut all: Vec<K> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|r| r.name_any());
        all
    }

    /// Guarded replace shared by `update` and `update_status`
    fn replace(&self, mut record: K) -> Result<K> {
        let name = record_name(&record)?;

        match self.records.entry(name.clone()) {
            Entry::Vacant(_) => Err(Error::not_found(K::KIND.to_string(), name)),
            Entry::Occupied(mut entry) => {
                let expected = record.resource_version().unwrap_or_default();
                let stored = entry.get();
                if self.take_injected_conflict() || stored.resource_version() != record.resource_version() {
                    return Err(Error::VersionConflict {
                        kind: K::KIND.to_string(),
                        name,
                        expected,
                    });
                }

                // Server-owned metadata cannot be changed by writers
                {
                    let stored_meta = stored.meta();
                    let meta = record.meta_mut();
                    meta.uid = stored_meta.uid.clone();
                    meta.creation_timestamp = stored_meta.creation_timestamp.clone();
                    meta.deletion_timestamp = stored_meta.deletion_timestamp.clone();
                    meta.namespace = stored_meta.namespace.clone();
                }
                record.meta_mut().resource_version = Some(self.next_version());

                if record.meta().deletion_timestamp.is_some() && record.finalizers().is_empty() {
                    entry.remove();
                    debug!(kind = %K::KIND, name = %name, "Finalizers cleared, record removed");
                    self.publish(WatchEvent::Deleted(record.clone()));
                } else {
                    entry.insert(record.clone());
                    self.publish(WatchEvent::Applied(record.clone()));
                }

                Ok(record)
            }
        }
    }
}

fn record_name<K: Record>(record: &K) -> Result<String> {
    match record.meta().name.as_deref() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(Error::InvalidArgument(format!("{} without a name", K::KIND))),
    }
}

fn labels_match(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[async_trait]
impl<K: Record> RecordStore<K> for MemoryStore<K> {
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.records.get(name).map(|r| r.value().clone()))
    }

    async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<K>> {
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|r| labels_match(r.labels(), labels))
            .collect())
    }

    async fn create(&self, mut record: K) -> Result<K> {
        let name = record_name(&record)?;

        match self.records.entry(name.clone()) {
            Entry::Occupied(_) => Err(Error::Conflict {
                kind: K::KIND.to_string(),
                name,
                reason: "name already taken".into(),
            }),
            Entry::Vacant(entry) => {
                let version = self.next_version();
                {
                    let meta = record.meta_mut();
                    meta.namespace.get_or_insert_with(|| self.namespace.clone());
                    meta.uid = Some(format!("{}-{}", K::KIND, version));
                    meta.resource_version = Some(version);
                    meta.creation_timestamp = Some(Time(Utc::now()));
                    meta.deletion_timestamp = None;
                }
                entry.insert(record.clone());
                trace!(kind = %K::KIND, name = %name, "Record created");
                self.publish(WatchEvent::Applied(record.clone()));
                Ok(record)
            }
        }
    }

    async fn update(&self, record: K) -> Result<K> {
        self.replace(record)
    }

    async fn update_status(&self, record: K) -> Result<K> {
        self.replace(record)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.records.entry(name.to_string()) {
            Entry::Vacant(_) => Err(Error::not_found(K::KIND.to_string(), name)),
            Entry::Occupied(mut entry) => {
                if entry.get().finalizers().is_empty() {
                    let record = entry.remove();
                    debug!(kind = %K::KIND, name = %name, "Record removed");
                    self.publish(WatchEvent::Deleted(record));
                } else if entry.get().meta().deletion_timestamp.is_none() {
                    let version = self.next_version();
                    let record = entry.get_mut();
                    record.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
                    record.meta_mut().resource_version = Some(version);
                    debug!(kind = %K::KIND, name = %name, "Deletion requested, waiting on finalizers");
                    let record = record.clone();
                    self.publish(WatchEvent::Applied(record));
                }
                Ok(())
            }
        }
    }

    fn watch(&self) -> WatchStream<K> {
        let rx = self.events.subscribe();
        let initial = self.snapshot();

        let head = futures::stream::once(async move { Ok(WatchEvent::Restarted(initial)) });
        let tail = futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((Ok(event), rx)),
                Err(broadcast::error::RecvError::Lagged(missed)) => Some((
                    Err(Error::Watch(format!("watch lagged by {} events", missed))),
                    rx,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        head.chain(tail).boxed()
    }
}
