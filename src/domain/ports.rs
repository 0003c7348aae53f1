//! Domain Ports - Core trait definitions for the provisioner
//!
//! These traits define the boundaries between the coordination logic and
//! external systems: the shared resource store, and the host-local storage
//! engine. Adapters implement these traits to provide concrete functionality.

use crate::crd::{
    LocalBackupSpec, LocalRestoreSpec, LocalVolumeSpec, PoolStatus, PropertyChange, Record,
    VolumeProperties,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::BTreeMap;

// =============================================================================
// Resource Store Port
// =============================================================================

/// A change observed on a watched record kind
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// Record created or modified
    Applied(K),
    /// Record removed from the store
    Deleted(K),
    /// Full relist; replaces everything seen so far
    Restarted(Vec<K>),
}

/// Stream of watch events for one record kind
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// Port for a strongly-consistent, versioned record store
///
/// Writes are compare-and-set: `update` and `update_status` succeed only if
/// the record's `metadata.resourceVersion` still matches the stored version,
/// and fail with [`crate::Error::VersionConflict`] otherwise. Callers re-read
/// and retry on conflict.
#[async_trait]
pub trait RecordStore<K: Record>: Send + Sync {
    /// Get a record by name
    async fn get(&self, name: &str) -> Result<Option<K>>;

    /// List records whose labels contain every given pair
    async fn list(&self, labels: &BTreeMap<String, String>) -> Result<Vec<K>>;

    /// Create a record; fails with `Conflict` if the name is taken
    async fn create(&self, record: K) -> Result<K>;

    /// Replace metadata and spec, guarded by resourceVersion
    async fn update(&self, record: K) -> Result<K>;

    /// Replace status, guarded by resourceVersion
    async fn update_status(&self, record: K) -> Result<K>;

    /// Request deletion
    ///
    /// A record without finalizers is removed immediately; otherwise its
    /// deletionTimestamp is set and it stays visible until the finalizers
    /// are cleared. Fails with `ResourceNotFound` if absent.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Watch all records of this kind, starting with a full listing
    fn watch(&self) -> WatchStream<K>;
}

// =============================================================================
// Storage Engine Port
// =============================================================================

/// A volume as reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostVolume {
    pub capacity_bytes: u64,
    pub properties: VolumeProperties,
}

/// A snapshot as reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSnapshot {
    pub creation_time: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Port for host-local storage operations
///
/// Creation and destruction must be idempotent: creating an existing
/// resource with the same parameters and destroying an absent one succeed.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Get engine name
    fn engine_name(&self) -> &str;

    /// Create a volume, cloning from `snap_name`/`source_volume` when set
    async fn create_volume(&self, name: &str, spec: &LocalVolumeSpec) -> Result<()>;

    /// Look up a volume
    async fn get_volume(&self, name: &str, pool: &str) -> Result<Option<HostVolume>>;

    /// Apply in-place property edits
    async fn set_properties(&self, name: &str, pool: &str, changes: &[PropertyChange]) -> Result<()>;

    /// Grow a volume
    async fn resize_volume(&self, name: &str, pool: &str, capacity_bytes: u64) -> Result<()>;

    /// Destroy a volume
    async fn destroy_volume(&self, name: &str, pool: &str) -> Result<()>;

    /// Take a snapshot of a volume
    async fn create_snapshot(&self, volume: &str, snapshot: &str, pool: &str) -> Result<HostSnapshot>;

    /// Destroy a snapshot
    async fn destroy_snapshot(&self, volume: &str, snapshot: &str, pool: &str) -> Result<()>;

    /// Stream a snapshot to the backup destination
    async fn send_backup(&self, name: &str, spec: &LocalBackupSpec) -> Result<()>;

    /// Remove host-side state held for a backup
    async fn destroy_backup(&self, name: &str, spec: &LocalBackupSpec) -> Result<()>;

    /// Receive a backup stream into a volume
    async fn receive_restore(&self, name: &str, spec: &LocalRestoreSpec) -> Result<()>;

    /// List pools on this host
    async fn list_pools(&self) -> Result<Vec<PoolStatus>>;
}
