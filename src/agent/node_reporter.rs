//! Node Reporter
//!
//! Publishes the local host's pool inventory as its StorageNode record. The
//! scheduler reads the topology labels from it and capacity queries read
//! the free bytes of each pool.

use crate::crd::{StorageNode, StorageNodeSpec, StorageNodeStatus, NODE_ID_LABEL};
use crate::domain::ports::{RecordStore, StorageEngine};
use crate::error::{Error, Result};
use crate::store::{modify, WriteTarget};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodically upserts this host's StorageNode
pub struct NodeReporter {
    node_id: String,
    labels: BTreeMap<String, String>,
    interval: Duration,
    store: Arc<dyn RecordStore<StorageNode>>,
    engine: Arc<dyn StorageEngine>,
}

impl NodeReporter {
    pub fn new(
        node_id: impl Into<String>,
        labels: BTreeMap<String, String>,
        interval: Duration,
        store: Arc<dyn RecordStore<StorageNode>>,
        engine: Arc<dyn StorageEngine>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            labels,
            interval,
            store,
            engine,
        }
    }

    fn template(&self) -> StorageNode {
        let mut node = StorageNode::new(
            &self.node_id,
            StorageNodeSpec {
                node_name: self.node_id.clone(),
                labels: self.labels.clone(),
            },
        );
        node.labels_mut()
            .insert(NODE_ID_LABEL.to_string(), self.node_id.clone());
        node
    }

    /// Read the pools from the engine and write them to the store
    pub async fn report(&self) -> Result<StorageNode> {
        let pools = self.engine.list_pools().await?;
        let status = StorageNodeStatus::from_pools(pools);

        if self.store.get(&self.node_id).await?.is_none() {
            match self.store.create(self.template()).await {
                Ok(_) => info!(node = %self.node_id, engine = %self.engine.engine_name(), "Registered storage node"),
                Err(Error::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let labels = &self.labels;
        modify(self.store.as_ref(), &self.node_id, WriteTarget::Spec, |node: &mut StorageNode| {
            if node.spec.labels == *labels {
                return Ok(false);
            }
            node.spec.labels = labels.clone();
            Ok(true)
        })
        .await?;

        let reported = modify(self.store.as_ref(), &self.node_id, WriteTarget::Status, |node: &mut StorageNode| {
            node.status = Some(status.clone());
            Ok(true)
        })
        .await?
        .ok_or_else(|| Error::not_found("StorageNode", self.node_id.as_str()))?;

        debug!(node = %self.node_id, pools = status.pool_count, free = %status.total_free, "Reported pools");
        Ok(reported)
    }

    /// Report on every tick until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(node = %self.node_id, "Node reporter stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.report().await {
                        warn!(node = %self.node_id, error = %e, "Pool report failed");
                    }
                }
            }
        }
    }
}
