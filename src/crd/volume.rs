//! LocalVolume CRD
//!
//! Intent record for one host-local volume. Written by the orchestrator,
//! converged by the agent on the owning host.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{IntentRecord, Record, RecordKind, RecordState, NODE_ID_LABEL, POOL_LABEL};

// =============================================================================
// LocalVolume CRD
// =============================================================================

/// LocalVolume describes a volume that must exist on exactly one host's pool.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "LocalVolume",
    plural = "localvolumes",
    shortname = "lv",
    status = "LocalVolumeStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.ownerNodeId"}"#,
    printcolumn = r#"{"name": "Pool", "type": "string", "jsonPath": ".spec.poolName"}"#,
    printcolumn = r#"{"name": "Size", "type": "integer", "jsonPath": ".spec.capacityBytes"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeSpec {
    /// Host that owns the volume
    pub owner_node_id: String,

    /// Pool on the owning host
    pub pool_name: String,

    /// Provisioned size in bytes
    pub capacity_bytes: u64,

    /// Snapshot this volume is cloned from (`volume@snapshot`)
    #[serde(default)]
    pub snap_name: Option<String>,

    /// Volume this volume is cloned from
    #[serde(default)]
    pub source_volume: Option<String>,

    /// Engine properties
    #[serde(default)]
    pub properties: VolumeProperties,
}

/// Where the initial content of a volume comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSource {
    /// Snapshot id in `volume@snapshot` form
    Snapshot(String),
    /// Name of another volume
    Volume(String),
}

impl std::fmt::Display for ContentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentSource::Snapshot(id) => write!(f, "snapshot:{}", id),
            ContentSource::Volume(name) => write!(f, "volume:{}", name),
        }
    }
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Storage engine properties of a volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeProperties {
    #[serde(default)]
    pub compression: Option<String>,

    #[serde(default)]
    pub dedup: Option<String>,

    #[serde(default)]
    pub encryption: Option<String>,

    #[serde(default)]
    pub key_format: Option<String>,

    #[serde(default)]
    pub key_location: Option<String>,

    /// Record size, datasets only
    #[serde(default)]
    pub record_size: Option<String>,

    /// Block size, block volumes only
    #[serde(default)]
    pub vol_block_size: Option<String>,

    /// Thin provisioning flag
    #[serde(default)]
    pub thin_provision: bool,

    /// Filesystem type; `zfs` means a native dataset
    #[serde(default)]
    pub fs_type: Option<String>,

    /// `quota` or `refquota`
    #[serde(default)]
    pub quota_type: Option<String>,

    /// Whether the volume may be mounted by several workloads
    #[serde(default)]
    pub shared: bool,
}

/// A single in-place property edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub name: &'static str,
    pub value: String,
}

impl VolumeProperties {
    /// Whether the volume is a native dataset rather than a block volume
    pub fn is_dataset(&self) -> bool {
        matches!(self.fs_type.as_deref(), Some("zfs"))
    }

    /// Properties that may be changed on an existing volume and differ from
    /// what the host reports. Everything else is fixed at creation.
    pub fn editable_changes(&self, on_host: &VolumeProperties) -> Vec<PropertyChange> {
        let mut changes = Vec::new();

        let mut diff = |name: &'static str, want: &Option<String>, have: &Option<String>| {
            if let Some(value) = want {
                if Some(value) != have.as_ref() {
                    changes.push(PropertyChange {
                        name,
                        value: value.clone(),
                    });
                }
            }
        };

        diff("compression", &self.compression, &on_host.compression);
        diff("dedup", &self.dedup, &on_host.dedup);
        if self.is_dataset() {
            diff("recordsize", &self.record_size, &on_host.record_size);
        }

        changes
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status of the LocalVolume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeStatus {
    #[serde(default)]
    pub state: RecordState,

    /// Reason for the last failure
    #[serde(default)]
    pub message: Option<String>,
}

// =============================================================================
// Implementations
// =============================================================================

impl LocalVolumeSpec {
    /// Spec for a freshly scheduled volume
    pub fn new(owner: impl Into<String>, pool: impl Into<String>, capacity_bytes: u64) -> Self {
        Self {
            owner_node_id: owner.into(),
            pool_name: pool.into(),
            capacity_bytes,
            snap_name: None,
            source_volume: None,
            properties: VolumeProperties::default(),
        }
    }

    /// Content reference, if this volume is a clone
    pub fn content_source(&self) -> Option<ContentSource> {
        match (&self.snap_name, &self.source_volume) {
            (Some(snap), _) => Some(ContentSource::Snapshot(snap.clone())),
            (None, Some(vol)) => Some(ContentSource::Volume(vol.clone())),
            (None, None) => None,
        }
    }

    /// Set the content reference; the two kinds are mutually exclusive
    pub fn set_content_source(&mut self, source: Option<ContentSource>) {
        self.snap_name = None;
        self.source_volume = None;
        match source {
            Some(ContentSource::Snapshot(id)) => self.snap_name = Some(id),
            Some(ContentSource::Volume(name)) => self.source_volume = Some(name),
            None => {}
        }
    }
}

impl LocalVolume {
    /// Build a new Pending record addressed to its owner
    pub fn pending(name: &str, namespace: &str, spec: LocalVolumeSpec) -> Self {
        let mut vol = LocalVolume::new(name, spec);
        vol.metadata.namespace = Some(namespace.to_string());
        vol.metadata.labels = Some(BTreeMap::from([
            (NODE_ID_LABEL.to_string(), vol.spec.owner_node_id.clone()),
            (POOL_LABEL.to_string(), vol.spec.pool_name.clone()),
        ]));
        vol.status = Some(LocalVolumeStatus::default());
        vol
    }

    /// Provisioned size in bytes
    pub fn capacity_bytes(&self) -> u64 {
        self.spec.capacity_bytes
    }

    /// Check if volume is ready
    pub fn is_ready(&self) -> bool {
        self.state() == RecordState::Ready
    }
}

impl Record for LocalVolume {
    const KIND: RecordKind = RecordKind::Volume;
}

impl IntentRecord for LocalVolume {
    fn owner_node_id(&self) -> &str {
        &self.spec.owner_node_id
    }

    fn state(&self) -> RecordState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    fn set_state(&mut self, state: RecordState, message: Option<String>) {
        let status = self.status.get_or_insert_with(LocalVolumeStatus::default);
        status.state = state;
        status.message = message;
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
    use kube::ResourceExt;

    #[test]
    fn test_content_source_exclusive() {
        let mut spec = LocalVolumeSpec::new("node-a", "tank", 1 << 20);
        assert_eq!(spec.content_source(), None);

        spec.set_content_source(Some(ContentSource::Snapshot("pvc-1@snap-1".into())));
        assert_eq!(
            spec.content_source(),
            Some(ContentSource::Snapshot("pvc-1@snap-1".into()))
        );

        spec.set_content_source(Some(ContentSource::Volume("pvc-1".into())));
        assert_eq!(spec.snap_name, None);
        assert_eq!(spec.content_source(), Some(ContentSource::Volume("pvc-1".into())));
    }

    #[test]
    fn test_pending_labels() {
        let vol = LocalVolume::pending("pvc-1", "openebs", LocalVolumeSpec::new("node-a", "tank", 1 << 20));
        assert_eq!(vol.labels().get(NODE_ID_LABEL).map(String::as_str), Some("node-a"));
        assert_eq!(vol.labels().get(POOL_LABEL).map(String::as_str), Some("tank"));
        assert_eq!(vol.state(), RecordState::Pending);
        assert_eq!(vol.namespace().as_deref(), Some("openebs"));
    }

    #[test]
    fn test_editable_changes() {
        let desired = VolumeProperties {
            compression: Some("lz4".into()),
            dedup: Some("on".into()),
            record_size: Some("128k".into()),
            encryption: Some("on".into()),
            fs_type: Some("zfs".into()),
            ..Default::default()
        };
        let host = VolumeProperties {
            compression: Some("off".into()),
            dedup: Some("on".into()),
            record_size: Some("4k".into()),
            fs_type: Some("zfs".into()),
            ..Default::default()
        };

        let changes = desired.editable_changes(&host);
        let names: Vec<_> = changes.iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["compression", "recordsize"]);
    }

    #[test]
    fn test_record_size_ignored_for_block_volumes() {
        let desired = VolumeProperties {
            record_size: Some("128k".into()),
            fs_type: Some("ext4".into()),
            ..Default::default()
        };
        assert!(desired.editable_changes(&VolumeProperties::default()).is_empty());
    }
}
