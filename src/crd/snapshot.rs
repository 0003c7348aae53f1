//! LocalSnapshot CRD
//!
//! Intent record for a point-in-time snapshot of a LocalVolume. The spec is a
//! copy of the source volume's spec taken when the snapshot was requested.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::volume::{LocalVolumeSpec, VolumeProperties};
use super::{IntentRecord, Record, RecordKind, RecordState, NODE_ID_LABEL, VOLUME_LABEL};

/// Separator between volume and snapshot name in a snapshot id
pub const SNAPSHOT_ID_SEPARATOR: char = '@';

// =============================================================================
// LocalSnapshot CRD
// =============================================================================

/// LocalSnapshot describes a snapshot held on the source volume's host.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "LocalSnapshot",
    plural = "localsnapshots",
    shortname = "lsnap",
    status = "LocalSnapshotStatus",
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.sourceVolume"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.ownerNodeId"}"#,
    printcolumn = r#"{"name": "Ready", "type": "boolean", "jsonPath": ".status.readyToUse"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LocalSnapshotSpec {
    /// Volume the snapshot is taken from
    pub source_volume: String,

    /// Host owning the source volume
    pub owner_node_id: String,

    /// Pool of the source volume
    pub pool_name: String,

    /// Size of the source volume at snapshot time
    pub capacity_bytes: u64,

    /// Engine properties copied from the source volume
    #[serde(default)]
    pub properties: VolumeProperties,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the LocalSnapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalSnapshotStatus {
    #[serde(default)]
    pub ready_to_use: bool,

    /// Set when the last attempt failed
    #[serde(default)]
    pub error: Option<String>,

    /// Time the host took the snapshot
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub creation_time: Option<DateTime<Utc>>,

    /// Bytes referenced by the snapshot
    #[serde(default)]
    pub size_bytes: u64,
}

// =============================================================================
// Snapshot IDs
// =============================================================================

/// Render the external id of a snapshot
pub fn snapshot_id(volume: &str, snapshot: &str) -> String {
    format!("{}{}{}", volume, SNAPSHOT_ID_SEPARATOR, snapshot)
}

/// Split an external snapshot id into (volume, snapshot)
pub fn parse_snapshot_id(id: &str) -> Option<(&str, &str)> {
    let (volume, snapshot) = id.split_once(SNAPSHOT_ID_SEPARATOR)?;
    if volume.is_empty() || snapshot.is_empty() || snapshot.contains(SNAPSHOT_ID_SEPARATOR) {
        return None;
    }
    Some((volume, snapshot))
}

// =============================================================================
// Implementations
// =============================================================================

impl LocalSnapshotSpec {
    /// Copy a volume spec into a snapshot spec
    pub fn from_volume(source_volume: &str, volume: &LocalVolumeSpec) -> Self {
        Self {
            source_volume: source_volume.to_string(),
            owner_node_id: volume.owner_node_id.clone(),
            pool_name: volume.pool_name.clone(),
            capacity_bytes: volume.capacity_bytes,
            properties: volume.properties.clone(),
        }
    }
}

impl LocalSnapshot {
    /// Build a new Pending record on the source volume's host
    pub fn pending(name: &str, namespace: &str, spec: LocalSnapshotSpec) -> Self {
        let mut snap = LocalSnapshot::new(name, spec);
        snap.metadata.namespace = Some(namespace.to_string());
        snap.metadata.labels = Some(BTreeMap::from([
            (NODE_ID_LABEL.to_string(), snap.spec.owner_node_id.clone()),
            (VOLUME_LABEL.to_string(), snap.spec.source_volume.clone()),
        ]));
        snap.status = Some(LocalSnapshotStatus::default());
        snap
    }

    /// External id (`volume@snapshot`)
    pub fn snapshot_id(&self) -> String {
        snapshot_id(&self.spec.source_volume, &self.name_any())
    }

    /// Source volume, as recorded in the link label
    pub fn linked_volume(&self) -> Option<&str> {
        self.labels().get(VOLUME_LABEL).map(String::as_str)
    }

    pub fn ready_to_use(&self) -> bool {
        self.status.as_ref().map(|s| s.ready_to_use).unwrap_or(false)
    }

    pub fn creation_time(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.creation_time)
    }
}

impl Record for LocalSnapshot {
    const KIND: RecordKind = RecordKind::Snapshot;
}

impl IntentRecord for LocalSnapshot {
    fn owner_node_id(&self) -> &str {
        &self.spec.owner_node_id
    }

    fn state(&self) -> RecordState {
        match &self.status {
            Some(s) if s.ready_to_use => RecordState::Ready,
            Some(s) if s.error.is_some() => RecordState::Failed,
            _ => RecordState::Pending,
        }
    }

    fn set_state(&mut self, state: RecordState, message: Option<String>) {
        let status = self.status.get_or_insert_with(LocalSnapshotStatus::default);
        match state {
            RecordState::Ready => {
                status.ready_to_use = true;
                status.error = None;
            }
            RecordState::Failed => {
                status.ready_to_use = false;
                status.error = Some(message.unwrap_or_else(|| "snapshot failed".to_string()));
            }
            RecordState::Pending => {
                status.ready_to_use = false;
                status.error = None;
            }
        }
    }

    fn spec_fingerprint(&self) -> String {
        serde_json::to_string(&self.spec).unwrap_or_default()
    }

    fn adopt_status(&mut self, from: &Self) {
        self.status = from.status.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_id_roundtrip() {
        assert_eq!(snapshot_id("pvc-1", "snap-1"), "pvc-1@snap-1");
        assert_eq!(parse_snapshot_id("pvc-1@snap-1"), Some(("pvc-1", "snap-1")));
    }

    #[test]
    fn test_malformed_snapshot_ids() {
        assert_eq!(parse_snapshot_id("pvc-1"), None);
        assert_eq!(parse_snapshot_id("@snap"), None);
        assert_eq!(parse_snapshot_id("pvc-1@"), None);
        assert_eq!(parse_snapshot_id("a@b@c"), None);
    }

    #[test]
    fn test_state_mapping() {
        let spec = LocalSnapshotSpec::from_volume("pvc-1", &LocalVolumeSpec::new("node-a", "tank", 1 << 20));
        let mut snap = LocalSnapshot::pending("snap-1", "openebs", spec);
        assert_eq!(snap.state(), RecordState::Pending);
        assert_eq!(snap.linked_volume(), Some("pvc-1"));
        assert_eq!(snap.owner_node_id(), "node-a");
        assert_eq!(snap.metadata.labels.as_ref().and_then(|l| l.get(NODE_ID_LABEL)).map(String::as_str), Some("node-a"));

        snap.set_state(RecordState::Failed, None);
        assert_eq!(snap.state(), RecordState::Failed);

        snap.set_state(RecordState::Ready, None);
        assert_eq!(snap.state(), RecordState::Ready);
        assert!(snap.ready_to_use());
        assert_eq!(snap.snapshot_id(), "pvc-1@snap-1");
    }
}
