//! Provisioning Orchestrator
//!
//! Turns provisioning requests into intent-record writes and waits for the
//! owning host's agent to converge them. The orchestrator never talks to a
//! host directly: it writes a record, then polls the record's status.
//!
//! Every operation holds the lock for its resource name for the whole call,
//! including bounded waits, so duplicate requests serialize instead of
//! racing. Cross-replica races are settled by the store's version checks.

use crate::controlplane::locks::{LockRegistry, PairGuard};
use crate::controlplane::params::{round_capacity, VolumeParams};
use crate::controlplane::scheduler::{HostTopology, Scheduler, TopologySegment};
use crate::crd::{
    parse_snapshot_id, snapshot_id, ContentSource, DateTime, IntentRecord, LocalSnapshot,
    LocalSnapshotSpec, LocalVolume, LocalVolumeSpec, RecordKind, RecordState, StorageNode, Utc,
    POOL_LABEL,
};
use crate::domain::ports::RecordStore;
use crate::error::{Error, Result};
use crate::store::{modify, WriteTarget};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Namespace intent records are written to
    pub namespace: String,
    /// Interval between status polls during a bounded wait
    pub poll_interval: Duration,
    /// Deadline of a bounded wait
    pub wait_timeout: Duration,
    /// Age after which an unclaimed Pending record is collected
    pub orphan_pending_ttl: Duration,
    /// Interval of the orphan sweep
    pub orphan_sweep_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: "openebs".to_string(),
            poll_interval: Duration::from_secs(1),
            wait_timeout: Duration::from_secs(120),
            orphan_pending_ttl: Duration::from_secs(600),
            orphan_sweep_interval: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Stores
// =============================================================================

/// The record stores the control plane reads and writes
#[derive(Clone)]
pub struct Stores {
    pub volumes: Arc<dyn RecordStore<LocalVolume>>,
    pub snapshots: Arc<dyn RecordStore<LocalSnapshot>>,
    pub nodes: Arc<dyn RecordStore<StorageNode>>,
}

// =============================================================================
// Requests and Results
// =============================================================================

/// A request to create a volume
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub name: String,
    pub size_bytes: u64,
    /// Acceptable host segments in preference order
    pub constraint: Vec<TopologySegment>,
    pub params: VolumeParams,
    pub content_source: Option<ContentSource>,
}

/// A volume that reached Ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedVolume {
    pub name: String,
    pub owner_node_id: String,
    pub pool_name: String,
    pub capacity_bytes: u64,
    pub content_source: Option<ContentSource>,
}

impl From<&LocalVolume> for ProvisionedVolume {
    fn from(vol: &LocalVolume) -> Self {
        Self {
            name: vol.name_any(),
            owner_node_id: vol.spec.owner_node_id.clone(),
            pool_name: vol.spec.pool_name.clone(),
            capacity_bytes: vol.spec.capacity_bytes,
            content_source: vol.spec.content_source(),
        }
    }
}

/// Current view of a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub source_volume: String,
    pub size_bytes: u64,
    pub creation_time: Option<DateTime<Utc>>,
    pub ready_to_use: bool,
}

impl From<&LocalSnapshot> for SnapshotInfo {
    fn from(snap: &LocalSnapshot) -> Self {
        let status = snap.status.clone().unwrap_or_default();
        Self {
            snapshot_id: snap.snapshot_id(),
            source_volume: snap.spec.source_volume.clone(),
            size_bytes: if status.size_bytes > 0 {
                status.size_bytes
            } else {
                snap.spec.capacity_bytes
            },
            creation_time: status
                .creation_time
                .or_else(|| snap.creation_timestamp().map(|t| t.0)),
            ready_to_use: status.ready_to_use,
        }
    }
}

/// Outcome of an expand request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpandResult {
    pub capacity_bytes: u64,
    pub node_expansion_required: bool,
}

// =============================================================================
// Lock Keys
// =============================================================================

fn volume_key(name: &str) -> String {
    format!("volume/{}", name)
}

fn snapshot_key(name: &str) -> String {
    format!("snapshot/{}", name)
}

fn source_key(source: &ContentSource) -> String {
    match source {
        ContentSource::Volume(name) => volume_key(name),
        ContentSource::Snapshot(id) => match parse_snapshot_id(id) {
            Some((_, snap)) => snapshot_key(snap),
            None => snapshot_key(id),
        },
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Control-plane side of the provisioning protocol
pub struct Orchestrator {
    config: OrchestratorConfig,
    stores: Stores,
    locks: Arc<LockRegistry>,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(config: OrchestratorConfig, stores: Stores, locks: Arc<LockRegistry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            stores,
            locks,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Both keys, always taken in sorted order so that no two operations
    /// can each hold one key of the same pair
    async fn lock_pair(&self, a: String, b: String) -> Result<PairGuard<'_>> {
        if a <= b {
            self.locks.acquire_both(&a, &b).await
        } else {
            self.locks.acquire_both(&b, &a).await
        }
    }

    // =========================================================================
    // CreateVolume
    // =========================================================================

    /// Create a volume and wait until a host has provisioned it
    #[instrument(skip(self, request), fields(volume = %request.name))]
    pub async fn create_volume(&self, request: ProvisionRequest) -> Result<ProvisionedVolume> {
        if request.name.is_empty() {
            return Err(Error::InvalidArgument("volume name is required".into()));
        }
        let size = round_capacity(request.size_bytes);

        let _guard = match &request.content_source {
            Some(source) => self.lock_pair(volume_key(&request.name), source_key(source)).await?,
            None => {
                let key = volume_key(&request.name);
                self.lock_pair(key.clone(), key).await?
            }
        };

        if let Some(existing) = self.check_existing_volume(&request.name, size, request.params.wait).await? {
            debug!(owner = %existing.owner_node_id, "Volume already provisioned");
            return Ok(existing);
        }

        let (spec, candidates) = match &request.content_source {
            Some(source) => {
                let spec = self.clone_spec(source, &request.params.pool_name, size).await?;
                let owner = spec.owner_node_id.clone();
                (spec, vec![owner])
            }
            None => {
                let mut spec = LocalVolumeSpec::new("", request.params.pool_name.clone(), size);
                spec.properties = request.params.properties.clone();
                let candidates = self.candidates(&request).await?;
                (spec, candidates)
            }
        };

        if candidates.is_empty() {
            return Err(Error::SchedulingFailed {
                volume: request.name.clone(),
                reason: "no host satisfies the topology constraint".into(),
            });
        }

        self.provision_on_candidates(&request.name, spec, &candidates).await
    }

    /// Decide what to do about a record already holding the name
    ///
    /// Returns the volume when the request is a duplicate of a finished
    /// create, `None` when creation should go ahead.
    async fn check_existing_volume(
        &self,
        name: &str,
        size: u64,
        wait: bool,
    ) -> Result<Option<ProvisionedVolume>> {
        let Some(existing) = self.stores.volumes.get(name).await? else {
            return Ok(None);
        };

        if existing.is_deleting() {
            if !wait {
                return Err(Error::in_progress(RecordKind::Volume.to_string(), name, "volume is being deleted"));
            }
            info!(volume = %name, "Waiting for previous volume to be deleted");
            self.wait_until_gone(self.stores.volumes.as_ref(), name).await?;
            return Ok(None);
        }

        if existing.state() == RecordState::Failed {
            info!(volume = %name, "Removing failed record before creating again");
            self.remove_record(self.stores.volumes.as_ref(), name).await?;
            return Ok(None);
        }

        if existing.capacity_bytes() != size {
            return Err(Error::Conflict {
                kind: RecordKind::Volume.to_string(),
                name: name.to_string(),
                reason: format!(
                    "exists with size {} bytes, requested {} bytes",
                    existing.capacity_bytes(),
                    size
                ),
            });
        }

        if existing.is_ready() {
            return Ok(Some(ProvisionedVolume::from(&existing)));
        }

        Err(Error::in_progress(RecordKind::Volume.to_string(), name, "volume creation has not finished"))
    }

    /// Spec of a volume cloned from a snapshot or another volume
    async fn clone_spec(&self, source: &ContentSource, pool: &str, size: u64) -> Result<LocalVolumeSpec> {
        let mut spec = match source {
            ContentSource::Snapshot(id) => {
                let (volume, snap) = parse_snapshot_id(id)
                    .ok_or_else(|| Error::InvalidArgument(format!("malformed snapshot id {}", id)))?;
                let snapshot = self
                    .stores
                    .snapshots
                    .get(snap)
                    .await?
                    .filter(|s| s.spec.source_volume == volume)
                    .ok_or_else(|| Error::not_found(RecordKind::Snapshot.to_string(), id.as_str()))?;
                if !snapshot.ready_to_use() || snapshot.is_deleting() {
                    return Err(Error::in_progress(RecordKind::Snapshot.to_string(), id.as_str(), "snapshot is not ready"));
                }
                let mut spec = LocalVolumeSpec::new(
                    snapshot.spec.owner_node_id.clone(),
                    snapshot.spec.pool_name.clone(),
                    snapshot.spec.capacity_bytes,
                );
                spec.properties = snapshot.spec.properties.clone();
                spec
            }
            ContentSource::Volume(name) => {
                let volume = self
                    .stores
                    .volumes
                    .get(name)
                    .await?
                    .ok_or_else(|| Error::not_found(RecordKind::Volume.to_string(), name.as_str()))?;
                if !volume.is_ready() || volume.is_deleting() {
                    return Err(Error::in_progress(RecordKind::Volume.to_string(), name.as_str(), "source volume is not ready"));
                }
                volume.spec
            }
        };

        if spec.pool_name != pool {
            return Err(Error::InvalidArgument(format!(
                "source {} is on pool {}, requested pool {}",
                source, spec.pool_name, pool
            )));
        }
        if spec.capacity_bytes != size {
            return Err(Error::InvalidArgument(format!(
                "source {} has size {} bytes, requested {} bytes",
                source, spec.capacity_bytes, size
            )));
        }

        spec.set_content_source(Some(source.clone()));
        Ok(spec)
    }

    /// Ordered candidate hosts for a scheduled volume
    async fn candidates(&self, request: &ProvisionRequest) -> Result<Vec<String>> {
        if let Some(node) = &request.params.node {
            return Ok(vec![node.clone()]);
        }

        let pool = &request.params.pool_name;
        let hosts: Vec<HostTopology> = self
            .stores
            .nodes
            .list(&BTreeMap::new())
            .await?
            .iter()
            .filter(|n| n.pool_free_bytes(pool).is_some())
            .map(|n| HostTopology::new(n.node_name(), n.topology()))
            .collect();

        let mut selector = BTreeMap::new();
        selector.insert(POOL_LABEL.to_string(), pool.clone());
        let volumes = self.stores.volumes.list(&selector).await?;
        let load = Scheduler::load_by_host(request.params.scheduler, &volumes, pool);

        let candidates = Scheduler::select(&request.constraint, &hosts, &load);
        debug!(
            algorithm = %request.params.scheduler,
            candidates = ?candidates,
            "Scheduled volume"
        );
        Ok(candidates)
    }

    /// Try each candidate in order until one host provisions the volume
    async fn provision_on_candidates(
        &self,
        name: &str,
        spec: LocalVolumeSpec,
        candidates: &[String],
    ) -> Result<ProvisionedVolume> {
        let mut last_failure = None;

        for node in candidates {
            let mut spec = spec.clone();
            spec.owner_node_id = node.clone();
            let record = LocalVolume::pending(name, &self.config.namespace, spec);

            match self.stores.volumes.create(record).await {
                Ok(_) => {}
                Err(Error::Conflict { .. }) => {
                    return Err(Error::in_progress(
                        RecordKind::Volume.to_string(),
                        name,
                        "record created concurrently by another writer",
                    ));
                }
                Err(e) => return Err(e),
            }
            info!(volume = %name, node = %node, "Volume record created, waiting for host");

            match self.wait_for_terminal(self.stores.volumes.as_ref(), name, node).await {
                Ok(volume) => {
                    info!(volume = %name, node = %node, "Volume provisioned");
                    return Ok(ProvisionedVolume::from(&volume));
                }
                // Host work may still be in flight; another candidate is unsafe
                Err(e @ Error::Timeout { .. }) => {
                    warn!(volume = %name, node = %node, "Timed out waiting for host");
                    return Err(e);
                }
                Err(e) => {
                    warn!(volume = %name, node = %node, error = %e, "Host failed to provision volume");
                    self.remove_record(self.stores.volumes.as_ref(), name).await?;
                    last_failure = Some(e);
                }
            }
        }

        Err(last_failure.unwrap_or_else(|| Error::SchedulingFailed {
            volume: name.to_string(),
            reason: "no candidate hosts".into(),
        }))
    }

    // =========================================================================
    // DeleteVolume
    // =========================================================================

    /// Request deletion of a volume; teardown happens on the owning host
    #[instrument(skip(self))]
    pub async fn delete_volume(&self, name: &str) -> Result<()> {
        let _guard = self.locks.acquire(&volume_key(name)).await?;

        let Some(volume) = self.stores.volumes.get(name).await? else {
            debug!(volume = %name, "Volume already gone");
            return Ok(());
        };
        if volume.is_deleting() {
            return Ok(());
        }
        if volume.state() == RecordState::Pending {
            return Err(Error::in_progress(RecordKind::Volume.to_string(), name, "volume creation has not finished"));
        }

        match self.stores.volumes.delete(name).await {
            Ok(()) | Err(Error::ResourceNotFound { .. }) => {
                info!(volume = %name, "Volume marked for deletion");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Snapshot a Ready volume on its host
    #[instrument(skip(self))]
    pub async fn create_snapshot(&self, source_volume: &str, name: &str, wait: bool) -> Result<SnapshotInfo> {
        if source_volume.is_empty() || name.is_empty() {
            return Err(Error::InvalidArgument("source volume and snapshot name are required".into()));
        }
        let _guard = self.lock_pair(volume_key(source_volume), snapshot_key(name)).await?;

        if let Some(existing) = self.stores.snapshots.get(name).await? {
            let linked = existing
                .linked_volume()
                .unwrap_or(existing.spec.source_volume.as_str());
            if linked != source_volume {
                return Err(Error::Conflict {
                    kind: RecordKind::Snapshot.to_string(),
                    name: name.to_string(),
                    reason: format!("exists for volume {}", linked),
                });
            }
            if existing.is_deleting() {
                return Err(Error::in_progress(RecordKind::Snapshot.to_string(), name, "snapshot is being deleted"));
            }
            if existing.state() != RecordState::Failed {
                if wait && !existing.ready_to_use() {
                    return self.wait_for_snapshot(name, &existing.spec.owner_node_id).await;
                }
                return Ok(SnapshotInfo::from(&existing));
            }
            info!(snapshot = %name, "Removing failed snapshot before creating again");
            self.remove_record(self.stores.snapshots.as_ref(), name).await?;
        }

        let volume = self
            .stores
            .volumes
            .get(source_volume)
            .await?
            .ok_or_else(|| Error::not_found(RecordKind::Volume.to_string(), source_volume))?;
        if !volume.is_ready() || volume.is_deleting() {
            return Err(Error::in_progress(RecordKind::Volume.to_string(), source_volume, "source volume is not ready"));
        }

        let spec = LocalSnapshotSpec::from_volume(source_volume, &volume.spec);
        let owner = spec.owner_node_id.clone();
        let created = match self
            .stores
            .snapshots
            .create(LocalSnapshot::pending(name, &self.config.namespace, spec))
            .await
        {
            Ok(created) => created,
            Err(Error::Conflict { .. }) => {
                return Err(Error::in_progress(
                    RecordKind::Snapshot.to_string(),
                    name,
                    "record created concurrently by another writer",
                ));
            }
            Err(e) => return Err(e),
        };
        info!(snapshot = %snapshot_id(source_volume, name), node = %owner, "Snapshot record created");

        if wait {
            return self.wait_for_snapshot(name, &owner).await;
        }
        Ok(SnapshotInfo::from(&created))
    }

    async fn wait_for_snapshot(&self, name: &str, owner: &str) -> Result<SnapshotInfo> {
        match self.wait_for_terminal(self.stores.snapshots.as_ref(), name, owner).await {
            Ok(snapshot) => Ok(SnapshotInfo::from(&snapshot)),
            Err(e @ Error::SyncFailed { .. }) => {
                self.remove_record(self.stores.snapshots.as_ref(), name).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Request deletion of a snapshot; malformed or unknown ids succeed
    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, id: &str) -> Result<()> {
        let Some((volume, name)) = parse_snapshot_id(id) else {
            debug!(snapshot = %id, "Malformed snapshot id, treating as deleted");
            return Ok(());
        };
        let _guard = self.lock_pair(volume_key(volume), snapshot_key(name)).await?;

        let Some(snapshot) = self.stores.snapshots.get(name).await? else {
            return Ok(());
        };
        if snapshot.spec.source_volume != volume || snapshot.is_deleting() {
            return Ok(());
        }

        match self.stores.snapshots.delete(name).await {
            Ok(()) | Err(Error::ResourceNotFound { .. }) => {
                info!(snapshot = %id, "Snapshot marked for deletion");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // ExpandVolume
    // =========================================================================

    /// Grow a volume in place; never shrinks
    #[instrument(skip(self))]
    pub async fn expand_volume(&self, name: &str, size_bytes: u64) -> Result<ExpandResult> {
        let size = round_capacity(size_bytes);
        let _guard = self.locks.acquire(&volume_key(name)).await?;

        let volume = self
            .stores
            .volumes
            .get(name)
            .await?
            .ok_or_else(|| Error::not_found(RecordKind::Volume.to_string(), name))?;

        if volume.capacity_bytes() >= size {
            return Ok(ExpandResult {
                capacity_bytes: volume.capacity_bytes(),
                node_expansion_required: false,
            });
        }
        if volume.is_deleting() || !volume.is_ready() {
            return Err(Error::in_progress(RecordKind::Volume.to_string(), name, "volume is not ready"));
        }

        let updated = modify(self.stores.volumes.as_ref(), name, WriteTarget::Spec, |v: &mut LocalVolume| {
            if v.spec.capacity_bytes >= size {
                return Ok(false);
            }
            v.spec.capacity_bytes = size;
            Ok(true)
        })
        .await?
        .ok_or_else(|| Error::not_found(RecordKind::Volume.to_string(), name))?;

        info!(volume = %name, capacity = updated.capacity_bytes(), "Volume expanded");
        Ok(ExpandResult {
            capacity_bytes: updated.capacity_bytes(),
            node_expansion_required: true,
        })
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    /// Largest free space of `pool` on any host satisfying the constraint
    ///
    /// A volume lives on one host, so capacities are never summed. An empty
    /// constraint matches every host.
    pub async fn available_capacity(&self, pool: &str, constraint: &[TopologySegment]) -> Result<u64> {
        let nodes = self.stores.nodes.list(&BTreeMap::new()).await?;
        let available = nodes
            .iter()
            .filter(|n| {
                let host = HostTopology::new(n.node_name(), n.topology());
                constraint.is_empty() || constraint.iter().any(|s| host.satisfies(s))
            })
            .filter_map(|n| n.pool_free_bytes(pool))
            .max()
            .unwrap_or(0);
        Ok(available)
    }

    // =========================================================================
    // Orphan Collection
    // =========================================================================

    /// Delete Pending records no host ever claimed
    ///
    /// A record is an orphan when it is Pending, carries no finalizer, is
    /// older than the configured TTL and no operation holds its lock. Such
    /// records are left behind when a bounded wait times out.
    pub async fn collect_orphans(&self) -> Result<usize> {
        let mut collected = 0;
        collected += self
            .collect_kind(self.stores.volumes.as_ref(), volume_key)
            .await?;
        collected += self
            .collect_kind(self.stores.snapshots.as_ref(), snapshot_key)
            .await?;
        if collected > 0 {
            info!(count = collected, "Collected orphaned Pending records");
        }
        Ok(collected)
    }

    async fn collect_kind<K: IntentRecord>(
        &self,
        store: &dyn RecordStore<K>,
        lock_key: fn(&str) -> String,
    ) -> Result<usize> {
        let ttl = chrono::Duration::from_std(self.config.orphan_pending_ttl)
            .map_err(|e| Error::Configuration(e.to_string()))?;
        let cutoff = Utc::now() - ttl;
        let mut collected = 0;

        for record in store.list(&BTreeMap::new()).await? {
            let name = record.name_any();
            let expired = record
                .creation_timestamp()
                .map(|t| t.0 < cutoff)
                .unwrap_or(false);
            if record.state() != RecordState::Pending
                || record.has_finalizer()
                || record.is_deleting()
                || !expired
                || self.locks.is_held(&lock_key(&name))
            {
                continue;
            }

            let Ok(_guard) = self.locks.acquire(&lock_key(&name)).await else {
                break;
            };
            // Re-check under the lock
            let Some(current) = store.get(&name).await? else {
                continue;
            };
            if current.state() != RecordState::Pending || current.has_finalizer() {
                continue;
            }

            warn!(kind = %K::KIND, name = %name, owner = %current.owner_node_id(), "Deleting orphaned Pending record");
            match store.delete(&name).await {
                Ok(()) => collected += 1,
                Err(Error::ResourceNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(collected)
    }

    /// Run the orphan sweep until cancelled
    pub async fn run_orphan_collector(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.orphan_sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Orphan collector stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.collect_orphans().await {
                        warn!(error = %e, "Orphan sweep failed");
                    }
                }
            }
        }
    }

    /// Stop accepting operations and wait for running ones to finish
    pub async fn shutdown(&self) {
        self.locks.close();
        self.locks.drain().await;
        info!("Orchestrator drained");
    }

    // =========================================================================
    // Bounded Waits
    // =========================================================================

    /// Poll `check` at the configured interval until it yields a value or
    /// the deadline passes
    async fn poll_until<T, F, Fut>(&self, kind: RecordKind, name: &str, mut check: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let started = Instant::now();
        loop {
            if let Some(value) = check().await? {
                return Ok(value);
            }
            let waited = started.elapsed();
            if waited >= self.config.wait_timeout {
                return Err(Error::Timeout {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    waited,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Wait until the record is Ready or Failed
    async fn wait_for_terminal<K: IntentRecord>(
        &self,
        store: &dyn RecordStore<K>,
        name: &str,
        node: &str,
    ) -> Result<K> {
        self.poll_until(K::KIND, name, || async move {
            let Some(record) = store.get(name).await? else {
                return Err(Error::SyncFailed {
                    kind: K::KIND.to_string(),
                    name: name.to_string(),
                    node: node.to_string(),
                    reason: "record removed while waiting".into(),
                });
            };
            match record.state() {
                RecordState::Ready => Ok(Some(record)),
                RecordState::Failed => Err(Error::SyncFailed {
                    kind: K::KIND.to_string(),
                    name: name.to_string(),
                    node: node.to_string(),
                    reason: failure_message(&record),
                }),
                RecordState::Pending => Ok(None),
            }
        })
        .await
    }

    /// Wait until the record has left the store
    async fn wait_until_gone<K: IntentRecord>(&self, store: &dyn RecordStore<K>, name: &str) -> Result<()> {
        self.poll_until(K::KIND, name, || async move {
            Ok(store.get(name).await?.is_none().then_some(()))
        })
        .await
    }

    /// Delete a record that has no host-side resource and wait until gone
    async fn remove_record<K: IntentRecord>(&self, store: &dyn RecordStore<K>, name: &str) -> Result<()> {
        match store.delete(name).await {
            Ok(()) | Err(Error::ResourceNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        self.wait_until_gone(store, name).await
    }
}

/// Failure reason recorded by the agent
fn failure_message<K: IntentRecord>(record: &K) -> String {
    serde_json::to_value(record)
        .ok()
        .and_then(|v| {
            let status = v.get("status")?;
            status
                .get("message")
                .or_else(|| status.get("error"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "host reported failure".to_string())
}
