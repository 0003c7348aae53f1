//! Per-kind convergence
//!
//! Adapters from intent records to [`StorageEngine`] calls, one per record
//! kind the agent reconciles.

use crate::agent::reconciler::Converge;
use crate::crd::{LocalBackup, LocalRestore, LocalSnapshot, LocalSnapshotStatus, LocalVolume};
use crate::domain::ports::StorageEngine;
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Volumes
// =============================================================================

/// Creates, edits and destroys volumes
pub struct VolumeSync {
    engine: Arc<dyn StorageEngine>,
}

impl VolumeSync {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Converge<LocalVolume> for VolumeSync {
    async fn apply(&self, volume: &mut LocalVolume) -> Result<()> {
        let name = volume.name_any();
        match volume.spec.content_source() {
            Some(source) => info!(volume = %name, pool = %volume.spec.pool_name, %source, "Creating clone"),
            None => info!(volume = %name, pool = %volume.spec.pool_name, size = volume.spec.capacity_bytes, "Creating volume"),
        }
        self.engine.create_volume(&name, &volume.spec).await
    }

    async fn reconfigure(&self, volume: &LocalVolume) -> Result<()> {
        let name = volume.name_any();
        let spec = &volume.spec;

        let on_host = self
            .engine
            .get_volume(&name, &spec.pool_name)
            .await?
            .ok_or_else(|| Error::EngineOperationFailed {
                operation: "reconfigure".into(),
                target: format!("{}/{}", spec.pool_name, name),
                reason: "volume missing on host".into(),
            })?;

        let changes = spec.properties.editable_changes(&on_host.properties);
        if !changes.is_empty() {
            debug!(volume = %name, ?changes, "Applying property edits");
            self.engine.set_properties(&name, &spec.pool_name, &changes).await?;
        }

        if spec.capacity_bytes > on_host.capacity_bytes {
            info!(volume = %name, from = on_host.capacity_bytes, to = spec.capacity_bytes, "Growing volume");
            self.engine
                .resize_volume(&name, &spec.pool_name, spec.capacity_bytes)
                .await?;
        }

        Ok(())
    }

    async fn teardown(&self, volume: &LocalVolume) -> Result<()> {
        let name = volume.name_any();
        info!(volume = %name, pool = %volume.spec.pool_name, "Destroying volume");
        self.engine.destroy_volume(&name, &volume.spec.pool_name).await
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Takes and destroys snapshots, recording creation time and size
pub struct SnapshotSync {
    engine: Arc<dyn StorageEngine>,
}

impl SnapshotSync {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Converge<LocalSnapshot> for SnapshotSync {
    async fn apply(&self, snapshot: &mut LocalSnapshot) -> Result<()> {
        let name = snapshot.name_any();
        let spec = &snapshot.spec;
        info!(volume = %spec.source_volume, snapshot = %name, "Taking snapshot");

        let taken = self
            .engine
            .create_snapshot(&spec.source_volume, &name, &spec.pool_name)
            .await?;

        let status = snapshot.status.get_or_insert_with(LocalSnapshotStatus::default);
        status.creation_time = Some(taken.creation_time);
        status.size_bytes = taken.size_bytes;
        Ok(())
    }

    async fn teardown(&self, snapshot: &LocalSnapshot) -> Result<()> {
        let name = snapshot.name_any();
        info!(volume = %snapshot.spec.source_volume, snapshot = %name, "Destroying snapshot");
        self.engine
            .destroy_snapshot(&snapshot.spec.source_volume, &name, &snapshot.spec.pool_name)
            .await
    }
}

// =============================================================================
// Backups and Restores
// =============================================================================

/// Streams snapshots to a backup destination
pub struct BackupSync {
    engine: Arc<dyn StorageEngine>,
}

impl BackupSync {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Converge<LocalBackup> for BackupSync {
    async fn apply(&self, backup: &mut LocalBackup) -> Result<()> {
        let name = backup.name_any();
        info!(backup = %name, volume = %backup.spec.volume_name, dest = %backup.spec.backup_dest, "Sending backup");
        self.engine.send_backup(&name, &backup.spec).await
    }

    async fn teardown(&self, backup: &LocalBackup) -> Result<()> {
        let name = backup.name_any();
        debug!(backup = %name, "Removing backup snapshot");
        self.engine.destroy_backup(&name, &backup.spec).await
    }
}

/// Receives backup streams into volumes
pub struct RestoreSync {
    engine: Arc<dyn StorageEngine>,
}

impl RestoreSync {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Converge<LocalRestore> for RestoreSync {
    async fn apply(&self, restore: &mut LocalRestore) -> Result<()> {
        let name = restore.name_any();
        info!(restore = %name, volume = %restore.spec.volume_name, src = %restore.spec.restore_src, "Receiving restore");
        self.engine.receive_restore(&name, &restore.spec).await
    }

    /// The restored data belongs to the volume; nothing to remove
    async fn teardown(&self, restore: &LocalRestore) -> Result<()> {
        debug!(restore = %restore.name_any(), "Restore record released");
        Ok(())
    }
}
