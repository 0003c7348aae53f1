//! Simulated Storage Engine
//!
//! An in-memory [`StorageEngine`] that keeps pools, volumes, snapshots and
//! transfers in maps and enforces pool capacity. Used by the standalone
//! binary mode and by tests, which can also inject failures per operation.

use crate::crd::{parse_snapshot_id, LocalBackupSpec, LocalRestoreSpec, LocalVolumeSpec, PoolStatus, PropertyChange};
use crate::domain::ports::{HostSnapshot, HostVolume, StorageEngine};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tracing::{debug, trace};

/// Engine operation names, as used by [`SimulatedEngine::fail_next`]
pub mod ops {
    pub const CREATE_VOLUME: &str = "create_volume";
    pub const SET_PROPERTIES: &str = "set_properties";
    pub const RESIZE_VOLUME: &str = "resize_volume";
    pub const DESTROY_VOLUME: &str = "destroy_volume";
    pub const CREATE_SNAPSHOT: &str = "create_snapshot";
    pub const DESTROY_SNAPSHOT: &str = "destroy_snapshot";
    pub const SEND_BACKUP: &str = "send_backup";
    pub const DESTROY_BACKUP: &str = "destroy_backup";
    pub const RECEIVE_RESTORE: &str = "receive_restore";
}

#[derive(Debug, Clone)]
struct SimPool {
    uuid: String,
    size_bytes: u64,
}

#[derive(Debug, Clone)]
struct SimVolume {
    pool: String,
    volume: HostVolume,
    thin: bool,
}

/// In-memory storage engine for one host
#[derive(Debug)]
pub struct SimulatedEngine {
    node_id: String,
    pools: DashMap<String, SimPool>,
    /// Volumes by `pool/name`
    volumes: DashMap<String, SimVolume>,
    /// Snapshots by `pool/volume@snapshot`
    snapshots: DashMap<String, HostSnapshot>,
    backups: DashSet<String>,
    restores: DashSet<String>,
    /// Remaining injected failures by operation
    failures: DashMap<&'static str, usize>,
    /// Calls by operation
    calls: DashMap<&'static str, usize>,
}

fn volume_key(pool: &str, name: &str) -> String {
    format!("{}/{}", pool, name)
}

fn snapshot_key(pool: &str, volume: &str, snapshot: &str) -> String {
    format!("{}/{}@{}", pool, volume, snapshot)
}

impl SimulatedEngine {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            pools: DashMap::new(),
            volumes: DashMap::new(),
            snapshots: DashMap::new(),
            backups: DashSet::new(),
            restores: DashSet::new(),
            failures: DashMap::new(),
            calls: DashMap::new(),
        }
    }

    /// Builder form of [`add_pool`](Self::add_pool)
    pub fn with_pool(self, name: &str, size_bytes: u64) -> Self {
        self.add_pool(name, size_bytes);
        self
    }

    pub fn add_pool(&self, name: &str, size_bytes: u64) {
        self.pools.insert(
            name.to_string(),
            SimPool {
                uuid: format!("{}-{}", self.node_id, name),
                size_bytes,
            },
        );
    }

    /// Make the next `count` calls of `operation` fail
    pub fn fail_next(&self, operation: &'static str, count: usize) {
        self.failures.insert(operation, count);
    }

    /// Number of calls of `operation` so far
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.get(operation).map(|c| *c).unwrap_or(0)
    }

    pub fn has_volume(&self, pool: &str, name: &str) -> bool {
        self.volumes.contains_key(&volume_key(pool, name))
    }

    pub fn has_snapshot(&self, pool: &str, volume: &str, snapshot: &str) -> bool {
        self.snapshots.contains_key(&snapshot_key(pool, volume, snapshot))
    }

    pub fn has_backup(&self, name: &str) -> bool {
        self.backups.contains(name)
    }

    pub fn has_restore(&self, name: &str) -> bool {
        self.restores.contains(name)
    }

    /// Bytes reserved on a pool by thick volumes
    fn used_bytes(&self, pool: &str) -> u64 {
        self.volumes
            .iter()
            .filter(|v| v.pool == pool && !v.thin)
            .map(|v| v.volume.capacity_bytes)
            .sum()
    }

    fn free_bytes(&self, pool: &str) -> Result<u64> {
        let size = self
            .pools
            .get(pool)
            .map(|p| p.size_bytes)
            .ok_or_else(|| self.failed("pool", pool, "pool not found"))?;
        Ok(size.saturating_sub(self.used_bytes(pool)))
    }

    fn reserve(&self, pool: &str, requested: u64) -> Result<()> {
        let available = self.free_bytes(pool)?;
        if requested > available {
            return Err(Error::InsufficientCapacity {
                pool: pool.to_string(),
                requested,
                available,
            });
        }
        Ok(())
    }

    fn failed(&self, operation: &str, target: &str, reason: &str) -> Error {
        Error::EngineOperationFailed {
            operation: operation.to_string(),
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Count a call and consume an injected failure, if any
    fn enter(&self, operation: &'static str, target: &str) -> Result<()> {
        *self.calls.entry(operation).or_insert(0) += 1;
        trace!(node = %self.node_id, operation, target, "Engine call");

        if let Some(mut remaining) = self.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(self.failed(operation, target, "injected failure"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageEngine for SimulatedEngine {
    fn engine_name(&self) -> &str {
        "simulated"
    }

    async fn create_volume(&self, name: &str, spec: &LocalVolumeSpec) -> Result<()> {
        let key = volume_key(&spec.pool_name, name);
        self.enter(ops::CREATE_VOLUME, &key)?;

        if let Some(existing) = self.volumes.get(&key) {
            if existing.volume.capacity_bytes == spec.capacity_bytes {
                return Ok(());
            }
            return Err(self.failed(ops::CREATE_VOLUME, &key, "exists with a different size"));
        }

        if let Some(id) = &spec.snap_name {
            let (volume, snapshot) =
                parse_snapshot_id(id).ok_or_else(|| self.failed(ops::CREATE_VOLUME, &key, "malformed snapshot id"))?;
            if !self.has_snapshot(&spec.pool_name, volume, snapshot) {
                return Err(self.failed(ops::CREATE_VOLUME, &key, "source snapshot not found"));
            }
        }
        if let Some(source) = &spec.source_volume {
            if !self.has_volume(&spec.pool_name, source) {
                return Err(self.failed(ops::CREATE_VOLUME, &key, "source volume not found"));
            }
        }

        let thin = spec.properties.thin_provision;
        if !thin {
            self.reserve(&spec.pool_name, spec.capacity_bytes)?;
        } else {
            self.free_bytes(&spec.pool_name)?;
        }

        self.volumes.insert(
            key.clone(),
            SimVolume {
                pool: spec.pool_name.clone(),
                volume: HostVolume {
                    capacity_bytes: spec.capacity_bytes,
                    properties: spec.properties.clone(),
                },
                thin,
            },
        );
        debug!(node = %self.node_id, volume = %key, "Volume created");
        Ok(())
    }

    async fn get_volume(&self, name: &str, pool: &str) -> Result<Option<HostVolume>> {
        Ok(self.volumes.get(&volume_key(pool, name)).map(|v| v.volume.clone()))
    }

    async fn set_properties(&self, name: &str, pool: &str, changes: &[PropertyChange]) -> Result<()> {
        let key = volume_key(pool, name);
        self.enter(ops::SET_PROPERTIES, &key)?;

        let mut volume = self
            .volumes
            .get_mut(&key)
            .ok_or_else(|| self.failed(ops::SET_PROPERTIES, &key, "volume not found"))?;
        let properties = &mut volume.volume.properties;
        for change in changes {
            let slot = match change.name {
                "compression" => &mut properties.compression,
                "dedup" => &mut properties.dedup,
                "recordsize" => &mut properties.record_size,
                other => return Err(self.failed(ops::SET_PROPERTIES, &key, &format!("{} is not editable", other))),
            };
            *slot = Some(change.value.clone());
        }
        Ok(())
    }

    async fn resize_volume(&self, name: &str, pool: &str, capacity_bytes: u64) -> Result<()> {
        let key = volume_key(pool, name);
        self.enter(ops::RESIZE_VOLUME, &key)?;

        let (current, thin) = self
            .volumes
            .get(&key)
            .map(|v| (v.volume.capacity_bytes, v.thin))
            .ok_or_else(|| self.failed(ops::RESIZE_VOLUME, &key, "volume not found"))?;
        if capacity_bytes <= current {
            return Ok(());
        }
        if !thin {
            self.reserve(pool, capacity_bytes - current)?;
        }
        if let Some(mut volume) = self.volumes.get_mut(&key) {
            volume.volume.capacity_bytes = capacity_bytes;
        }
        Ok(())
    }

    async fn destroy_volume(&self, name: &str, pool: &str) -> Result<()> {
        let key = volume_key(pool, name);
        self.enter(ops::DESTROY_VOLUME, &key)?;
        if self.volumes.remove(&key).is_some() {
            debug!(node = %self.node_id, volume = %key, "Volume destroyed");
        }
        Ok(())
    }

    async fn create_snapshot(&self, volume: &str, snapshot: &str, pool: &str) -> Result<HostSnapshot> {
        let key = snapshot_key(pool, volume, snapshot);
        self.enter(ops::CREATE_SNAPSHOT, &key)?;

        if let Some(existing) = self.snapshots.get(&key) {
            return Ok(existing.clone());
        }
        let size_bytes = self
            .volumes
            .get(&volume_key(pool, volume))
            .map(|v| v.volume.capacity_bytes)
            .ok_or_else(|| self.failed(ops::CREATE_SNAPSHOT, &key, "source volume not found"))?;

        let taken = HostSnapshot {
            creation_time: Utc::now(),
            size_bytes,
        };
        self.snapshots.insert(key.clone(), taken.clone());
        debug!(node = %self.node_id, snapshot = %key, "Snapshot taken");
        Ok(taken)
    }

    async fn destroy_snapshot(&self, volume: &str, snapshot: &str, pool: &str) -> Result<()> {
        let key = snapshot_key(pool, volume, snapshot);
        self.enter(ops::DESTROY_SNAPSHOT, &key)?;
        self.snapshots.remove(&key);
        Ok(())
    }

    async fn send_backup(&self, name: &str, spec: &LocalBackupSpec) -> Result<()> {
        self.enter(ops::SEND_BACKUP, name)?;
        if !self.has_volume(&spec.pool_name, &spec.volume_name) {
            return Err(self.failed(ops::SEND_BACKUP, name, "volume not found"));
        }
        let key = snapshot_key(&spec.pool_name, &spec.volume_name, &spec.snap_name);
        self.snapshots.entry(key).or_insert_with(|| HostSnapshot {
            creation_time: Utc::now(),
            size_bytes: 0,
        });
        self.backups.insert(name.to_string());
        Ok(())
    }

    async fn destroy_backup(&self, name: &str, spec: &LocalBackupSpec) -> Result<()> {
        self.enter(ops::DESTROY_BACKUP, name)?;
        self.snapshots
            .remove(&snapshot_key(&spec.pool_name, &spec.volume_name, &spec.snap_name));
        self.backups.remove(name);
        Ok(())
    }

    async fn receive_restore(&self, name: &str, spec: &LocalRestoreSpec) -> Result<()> {
        self.enter(ops::RECEIVE_RESTORE, name)?;
        if !self.has_volume(&spec.pool_name, &spec.volume_name) {
            return Err(self.failed(ops::RECEIVE_RESTORE, name, "target volume not found"));
        }
        self.restores.insert(name.to_string());
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<PoolStatus>> {
        let mut pools: Vec<PoolStatus> = self
            .pools
            .iter()
            .map(|p| {
                let used = self.used_bytes(p.key());
                PoolStatus {
                    name: p.key().clone(),
                    uuid: p.uuid.clone(),
                    free_bytes: p.size_bytes.saturating_sub(used),
                    used_bytes: used,
                }
            })
            .collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pools)
    }
}
