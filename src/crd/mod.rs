//! Custom Resource Definitions for the LocalPV control plane
//!
//! This module contains all CRD types:
//! - LocalVolume: intent record for a host-local volume
//! - LocalSnapshot: intent record for a snapshot of a volume
//! - LocalBackup / LocalRestore: intent records for snapshot streams
//! - StorageNode: per-host pool inventory published by the agents
//!
//! The intent records share the [`IntentRecord`] contract so that a single
//! generic reconciler can converge any of them.

pub mod backup;
pub mod snapshot;
pub mod storage_node;
pub mod volume;

pub use backup::*;
pub use snapshot::*;
pub use storage_node::*;
pub use volume::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
pub use std::collections::BTreeMap;

use kube::{CustomResourceExt, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

// =============================================================================
// Well-known names
// =============================================================================

/// API group of every resource in this crate
pub const API_GROUP: &str = "storage.billyronks.io";

/// Finalizer held while the host-side resource exists
pub const FINALIZER: &str = "storage.billyronks.io/finalizer";

/// Label carrying the owning host id; also the topology key naming one host
pub const NODE_ID_LABEL: &str = "storage.billyronks.io/nodeid";

/// Label linking snapshots and backups to their source volume
pub const VOLUME_LABEL: &str = "storage.billyronks.io/volume";

/// Label carrying the pool a volume lives on
pub const POOL_LABEL: &str = "storage.billyronks.io/pool";

// =============================================================================
// Record Kind
// =============================================================================

/// The closed set of record kinds stored by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Volume,
    Snapshot,
    Backup,
    Restore,
    Node,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Volume => write!(f, "LocalVolume"),
            RecordKind::Snapshot => write!(f, "LocalSnapshot"),
            RecordKind::Backup => write!(f, "LocalBackup"),
            RecordKind::Restore => write!(f, "LocalRestore"),
            RecordKind::Node => write!(f, "StorageNode"),
        }
    }
}

// =============================================================================
// Record State
// =============================================================================

/// Lifecycle state of an intent record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum RecordState {
    #[default]
    Pending,
    Ready,
    Failed,
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordState::Pending => write!(f, "Pending"),
            RecordState::Ready => write!(f, "Ready"),
            RecordState::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Record Traits
// =============================================================================

/// Any object kept in the shared resource store
pub trait Record:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind of this record
    const KIND: RecordKind;
}

/// A record describing desired state that one host converges
pub trait IntentRecord: Record {
    /// Host responsible for the record
    fn owner_node_id(&self) -> &str;

    /// Current lifecycle state
    fn state(&self) -> RecordState;

    /// Set lifecycle state, with an optional human readable reason
    fn set_state(&mut self, state: RecordState, message: Option<String>);

    /// Stable rendering of the desired state, used to detect spec edits
    fn spec_fingerprint(&self) -> String;

    /// Replace this record's status with another copy's
    fn adopt_status(&mut self, from: &Self);

    /// Whether the host-side resource is believed to exist
    fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    /// Whether deletion has been requested
    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Add the finalizer; returns false if it was already present
    fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.finalizers_mut().push(FINALIZER.to_string());
        true
    }

    /// Remove the finalizer; returns false if it was absent
    fn remove_finalizer(&mut self) -> bool {
        let before = self.finalizers().len();
        self.finalizers_mut().retain(|f| f != FINALIZER);
        before != self.finalizers().len()
    }
}

/// All CRD manifests served by this crate
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition> {
    vec![
        LocalVolume::crd(),
        LocalSnapshot::crd(),
        LocalBackup::crd(),
        LocalRestore::crd(),
        StorageNode::crd(),
    ]
}
