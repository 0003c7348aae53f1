//! Host Agent
//!
//! The per-host side of the provisioning protocol. Each agent runs one
//! [`Reconciler`] per intent record kind, converging the records addressed
//! to its host through the local [`StorageEngine`], and a [`NodeReporter`]
//! publishing the host's pools.

pub mod handlers;
pub mod node_reporter;
pub mod queue;
pub mod reconciler;
pub mod simulated;

pub use handlers::{BackupSync, RestoreSync, SnapshotSync, VolumeSync};
pub use node_reporter::NodeReporter;
pub use queue::{QueueConfig, WorkQueue};
pub use reconciler::{Converge, Reconciler, ReconcilerConfig};
pub use simulated::SimulatedEngine;

use crate::crd::{LocalBackup, LocalRestore, LocalSnapshot, LocalVolume, StorageNode};
use crate::domain::ports::{RecordStore, StorageEngine};
use crate::metrics::Metrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

// =============================================================================
// Agent Configuration
// =============================================================================

/// Configuration for a host agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Id of the local host; records whose owner differs are ignored
    pub node_id: String,
    /// Topology labels published with the host's pools
    pub labels: BTreeMap<String, String>,
    /// Workers per record kind
    pub workers: usize,
    /// Interval of the full relist
    pub resync_interval: Duration,
    /// Interval of pool reports
    pub report_interval: Duration,
    /// Requeue delays
    pub queue: QueueConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            labels: BTreeMap::new(),
            workers: 4,
            resync_interval: Duration::from_secs(60),
            report_interval: Duration::from_secs(60),
            queue: QueueConfig::default(),
        }
    }
}

impl AgentConfig {
    fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            node_id: self.node_id.clone(),
            workers: self.workers,
            resync_interval: self.resync_interval,
            queue: self.queue.clone(),
        }
    }
}

/// The record stores an agent watches and writes
#[derive(Clone)]
pub struct AgentStores {
    pub volumes: Arc<dyn RecordStore<LocalVolume>>,
    pub snapshots: Arc<dyn RecordStore<LocalSnapshot>>,
    pub backups: Arc<dyn RecordStore<LocalBackup>>,
    pub restores: Arc<dyn RecordStore<LocalRestore>>,
    pub nodes: Arc<dyn RecordStore<StorageNode>>,
}

// =============================================================================
// Agent
// =============================================================================

/// Reconcilers and node reporter of one host
pub struct Agent {
    config: AgentConfig,
    stores: AgentStores,
    engine: Arc<dyn StorageEngine>,
    metrics: Option<Arc<Metrics>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        stores: AgentStores,
        engine: Arc<dyn StorageEngine>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            config,
            stores,
            engine,
            metrics,
        }
    }

    /// Run until cancelled; returns once every loop has stopped
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            node = %self.config.node_id,
            engine = %self.engine.engine_name(),
            workers = self.config.workers,
            "Starting agent"
        );

        let reporter = Arc::new(NodeReporter::new(
            self.config.node_id.clone(),
            self.config.labels.clone(),
            self.config.report_interval,
            self.stores.nodes.clone(),
            self.engine.clone(),
        ));

        let volumes = Reconciler::new(
            self.config.reconciler(),
            self.stores.volumes.clone(),
            Arc::new(VolumeSync::new(self.engine.clone())),
            self.metrics.clone(),
        );
        let snapshots = Reconciler::new(
            self.config.reconciler(),
            self.stores.snapshots.clone(),
            Arc::new(SnapshotSync::new(self.engine.clone())),
            self.metrics.clone(),
        );
        let backups = Reconciler::new(
            self.config.reconciler(),
            self.stores.backups.clone(),
            Arc::new(BackupSync::new(self.engine.clone())),
            self.metrics.clone(),
        );
        let restores = Reconciler::new(
            self.config.reconciler(),
            self.stores.restores.clone(),
            Arc::new(RestoreSync::new(self.engine.clone())),
            self.metrics.clone(),
        );

        let tasks = vec![
            tokio::spawn(reporter.run(cancel.clone())),
            tokio::spawn(volumes.run(cancel.clone())),
            tokio::spawn(snapshots.run(cancel.clone())),
            tokio::spawn(backups.run(cancel.clone())),
            tokio::spawn(restores.run(cancel.clone())),
        ];
        futures::future::join_all(tasks).await;

        info!(node = %self.config.node_id, "Agent stopped");
    }
}
