//! StorageNode CRD
//!
//! Represents a host's storage pool inventory. Each agent publishes its own
//! StorageNode; the control plane reads them for topology matching and
//! capacity queries.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Record, RecordKind, NODE_ID_LABEL};

// =============================================================================
// StorageNode CRD
// =============================================================================

/// StorageNode tracks the pools available on one cluster host.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "StorageNode",
    plural = "storagenodes",
    shortname = "sn",
    status = "StorageNodeStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Pools", "type": "integer", "jsonPath": ".status.poolCount"}"#,
    printcolumn = r#"{"name": "Free", "type": "string", "jsonPath": ".status.totalFree"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodeSpec {
    /// Host id; matches `ownerNodeId` on intent records
    pub node_name: String,

    /// Topology labels used for scheduling
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the StorageNode
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodeStatus {
    /// Current phase of the node
    #[serde(default)]
    pub phase: NodePhase,

    /// Number of pools reported
    #[serde(default)]
    pub pool_count: u32,

    /// Total free capacity (human readable)
    #[serde(default)]
    pub total_free: String,

    /// Pools on the host
    #[serde(default)]
    pub pools: Vec<PoolStatus>,

    /// Last report from the node agent
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_heartbeat_time: Option<DateTime<Utc>>,
}

/// Node lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum NodePhase {
    #[default]
    Pending,
    Ready,
    Degraded,
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodePhase::Pending => write!(f, "Pending"),
            NodePhase::Ready => write!(f, "Ready"),
            NodePhase::Degraded => write!(f, "Degraded"),
        }
    }
}

/// A single pool on a host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub name: String,

    #[serde(default)]
    pub uuid: String,

    #[serde(default)]
    pub free_bytes: u64,

    #[serde(default)]
    pub used_bytes: u64,
}

// =============================================================================
// Implementations
// =============================================================================

impl StorageNode {
    /// Get the node name
    pub fn node_name(&self) -> &str {
        &self.spec.node_name
    }

    /// Topology labels including the implicit host-id key
    pub fn topology(&self) -> BTreeMap<String, String> {
        let mut labels = self.spec.labels.clone();
        labels.insert(NODE_ID_LABEL.to_string(), self.spec.node_name.clone());
        labels
    }

    /// Free bytes of a named pool, if the host has it
    pub fn pool_free_bytes(&self, pool: &str) -> Option<u64> {
        self.status
            .as_ref()
            .and_then(|s| s.pools.iter().find(|p| p.name == pool))
            .map(|p| p.free_bytes)
    }
}

impl StorageNodeStatus {
    /// Rebuild the status from a pool listing
    pub fn from_pools(pools: Vec<PoolStatus>) -> Self {
        let mut status = Self {
            phase: NodePhase::Ready,
            pools,
            last_heartbeat_time: Some(Utc::now()),
            ..Default::default()
        };
        status.update_counts();
        status
    }

    /// Update summary fields from the pool list
    pub fn update_counts(&mut self) {
        self.pool_count = self.pools.len() as u32;
        self.total_free = format_bytes(self.pools.iter().map(|p| p.free_bytes).sum());
        if self.pools.is_empty() {
            self.phase = NodePhase::Degraded;
        }
    }
}

impl Record for StorageNode {
    const KIND: RecordKind = RecordKind::Node;
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;
    const PB: u64 = TB * 1024;

    if bytes >= PB {
        format!("{:.2}PB", bytes as f64 / PB as f64)
    } else if bytes >= TB {
        format!("{:.2}TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}
