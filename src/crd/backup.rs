//! LocalBackup and LocalRestore CRDs
//!
//! A backup streams a snapshot of a volume to a remote destination; a restore
//! receives such a stream into a volume. Both are executed by the agent on
//! the host that owns the volume.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{IntentRecord, Record, RecordKind, RecordState, NODE_ID_LABEL, VOLUME_LABEL};

// =============================================================================
// LocalBackup CRD
// =============================================================================

/// LocalBackup sends a snapshot of a volume to `backupDest`.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "LocalBackup",
    plural = "localbackups",
    shortname = "lbkp",
    status = "TransferStatus",
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.ownerNodeId"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LocalBackupSpec {
    /// Volume being backed up
    pub volume_name: String,

    /// Host owning the volume
    pub owner_node_id: String,

    /// Pool of the volume
    pub pool_name: String,

    /// Snapshot taken for this backup
    pub snap_name: String,

    /// Base snapshot for an incremental stream
    #[serde(default)]
    pub prev_snap_name: Option<String>,

    /// Remote endpoint receiving the stream (`host:port`)
    pub backup_dest: String,
}

// =============================================================================
// LocalRestore CRD
// =============================================================================

/// LocalRestore receives a backup stream into a volume.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "LocalRestore",
    plural = "localrestores",
    shortname = "lrst",
    status = "TransferStatus",
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.ownerNodeId"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LocalRestoreSpec {
    /// Volume receiving the data
    pub volume_name: String,

    /// Host owning the volume
    pub owner_node_id: String,

    /// Pool of the target volume
    pub pool_name: String,

    /// Remote endpoint serving the stream (`host:port`)
    pub restore_src: String,
}

// =============================================================================
// Status
// =============================================================================

/// Status shared by backups and restores
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    #[serde(default)]
    pub state: RecordState,

    #[serde(default)]
    pub message: Option<String>,
}

// =============================================================================
// Implementations
// =============================================================================

impl LocalBackup {
    /// Build a new Pending backup record
    pub fn pending(name: &str, namespace: &str, spec: LocalBackupSpec) -> Self {
        let mut bkp = LocalBackup::new(name, spec);
        bkp.metadata.namespace = Some(namespace.to_string());
        bkp.metadata.labels = Some(BTreeMap::from([
            (NODE_ID_LABEL.to_string(), bkp.spec.owner_node_id.clone()),
            (VOLUME_LABEL.to_string(), bkp.spec.volume_name.clone()),
        ]));
        bkp.status = Some(TransferStatus::default());
        bkp
    }
}

impl LocalRestore {
    /// Build a new Pending restore record
    pub fn pending(name: &str, namespace: &str, spec: LocalRestoreSpec) -> Self {
        let mut rst = LocalRestore::new(name, spec);
        rst.metadata.namespace = Some(namespace.to_string());
        rst.metadata.labels = Some(BTreeMap::from([
            (NODE_ID_LABEL.to_string(), rst.spec.owner_node_id.clone()),
            (VOLUME_LABEL.to_string(), rst.spec.volume_name.clone()),
        ]));
        rst.status = Some(TransferStatus::default());
        rst
    }
}

fn transfer_state(status: &Option<TransferStatus>) -> RecordState {
    status.as_ref().map(|s| s.state).unwrap_or_default()
}

fn set_transfer_state(status: &mut Option<TransferStatus>, state: RecordState, message: Option<String>) {
    let status = status.get_or_insert_with(TransferStatus::default);
    status.state = state;
    status.message = message;
}

impl Record for LocalBackup {
    const KIND: RecordKind = RecordKind::Backup;
}

impl IntentRecord for LocalBackup {
    fn owner_node_id(&self) -> &str {
        &self.spec.owner_node_id
    }

    fn state(&self) -> RecordState {
        transfer_state(&self.status)
    }

    fn set_state(&mut self, state: RecordState, message: Option<String>) {
        set_transfer_state(&mut self.status, state, message)
    }

    fn spec_fingerprint(&self) -> String {
        serde_json::to_string(&self.spec).unwrap_or_default()
    }

    fn adopt_status(&mut self, from: &Self) {
        self.status = from.status.clone();
    }
}

impl Record for LocalRestore {
    const KIND: RecordKind = RecordKind::Restore;
}

impl IntentRecord for LocalRestore {
    fn owner_node_id(&self) -> &str {
        &self.spec.owner_node_id
    }

    fn state(&self) -> RecordState {
        transfer_state(&self.status)
    }

    fn set_state(&mut self, state: RecordState, message: Option<String>) {
        set_transfer_state(&mut self.status, state, message)
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
    fn test_transfer_records_carry_owner_and_volume() {
        let backup = LocalBackup::pending(
            "bkp-1",
            "openebs",
            LocalBackupSpec {
                volume_name: "pvc-1".into(),
                owner_node_id: "node-a".into(),
                pool_name: "tank".into(),
                snap_name: "bkp-1".into(),
                prev_snap_name: None,
                backup_dest: "10.0.0.9:9010".into(),
            },
        );
        assert_eq!(backup.state(), RecordState::Pending);
        assert_eq!(backup.labels().get(NODE_ID_LABEL).map(String::as_str), Some("node-a"));
        assert_eq!(backup.labels().get(VOLUME_LABEL).map(String::as_str), Some("pvc-1"));

        let restore = LocalRestore::pending(
            "rst-1",
            "openebs",
            LocalRestoreSpec {
                volume_name: "pvc-2".into(),
                owner_node_id: "node-b".into(),
                pool_name: "tank".into(),
                restore_src: "10.0.0.9:9010".into(),
            },
        );
        assert_eq!(restore.owner_node_id(), "node-b");
        assert_eq!(restore.labels().get(VOLUME_LABEL).map(String::as_str), Some("pvc-2"));
        assert_eq!(restore.namespace().as_deref(), Some("openebs"));
    }
}
