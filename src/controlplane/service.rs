//! Controller Service
//!
//! RPC-shaped entry points of the control plane. Each call validates its
//! request, delegates to the [`Orchestrator`] and records its outcome. The
//! wire protocol carrying these calls lives outside this crate.

use crate::controlplane::orchestrator::{Orchestrator, ProvisionRequest};
use crate::controlplane::params::{CapacityRange, SnapshotParams, VolumeParams};
use crate::controlplane::scheduler::TopologySegment;
use crate::crd::{ContentSource, DateTime, Utc, NODE_ID_LABEL};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

// =============================================================================
// Messages
// =============================================================================

/// Topology the volume must be accessible from
#[derive(Debug, Clone, Default)]
pub struct TopologyRequirement {
    /// Segments the volume must be reachable from
    pub requisite: Vec<TopologySegment>,
    /// Segments in preference order
    pub preferred: Vec<TopologySegment>,
}

impl TopologyRequirement {
    /// Segments in the order they should be tried: preferred first, then
    /// the remaining requisite ones
    pub fn ordered_segments(&self) -> Vec<TopologySegment> {
        let mut segments = self.preferred.clone();
        for segment in &self.requisite {
            if !segments.contains(segment) {
                segments.push(segment.clone());
            }
        }
        segments
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub capacity_range: CapacityRange,
    pub accessibility: TopologyRequirement,
    pub parameters: HashMap<String, String>,
    pub content_source: Option<ContentSource>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVolumeResponse {
    pub volume_id: String,
    pub capacity_bytes: u64,
    /// Segment naming the owning host
    pub accessible_topology: TopologySegment,
    pub content_source: Option<ContentSource>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSnapshotRequest {
    pub source_volume_id: String,
    pub name: String,
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSnapshotResponse {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub size_bytes: u64,
    pub creation_time: Option<DateTime<Utc>>,
    pub ready_to_use: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpandVolumeResponse {
    pub capacity_bytes: u64,
    pub node_expansion_required: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GetCapacityRequest {
    pub accessible_topology: Option<TopologySegment>,
    pub parameters: HashMap<String, String>,
}

// =============================================================================
// Controller Service
// =============================================================================

/// Controller entry points
pub struct ControllerService {
    orchestrator: Arc<Orchestrator>,
    metrics: Arc<Metrics>,
}

impl ControllerService {
    pub fn new(orchestrator: Arc<Orchestrator>, metrics: Arc<Metrics>) -> Self {
        Self {
            orchestrator,
            metrics,
        }
    }

    fn observe<T>(&self, operation: &str, started: Instant, result: Result<T>) -> Result<T> {
        self.metrics.record_operation(operation, started.elapsed(), &result);
        if let Err(e) = &result {
            debug!(operation = %operation, error = %e, "Controller call failed");
        }
        result
    }

    /// Provision a volume on one host
    pub async fn create_volume(&self, request: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        let started = Instant::now();
        let result = self.do_create_volume(request).await;
        self.observe("CreateVolume", started, result)
    }

    async fn do_create_volume(&self, request: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        let size = request.capacity_range.resolve()?;
        let params = VolumeParams::parse(&request.parameters)?;
        info!(volume = %request.name, size, pool = %params.pool_name, "CreateVolume");

        let volume = self
            .orchestrator
            .create_volume(ProvisionRequest {
                name: request.name,
                size_bytes: size,
                constraint: request.accessibility.ordered_segments(),
                params,
                content_source: request.content_source,
            })
            .await?;

        let mut accessible_topology = BTreeMap::new();
        accessible_topology.insert(NODE_ID_LABEL.to_string(), volume.owner_node_id.clone());

        Ok(CreateVolumeResponse {
            volume_id: volume.name,
            capacity_bytes: volume.capacity_bytes,
            accessible_topology,
            content_source: volume.content_source,
        })
    }

    /// Request deletion of a volume
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let started = Instant::now();
        let result = if volume_id.is_empty() {
            Err(Error::InvalidArgument("volume id is required".into()))
        } else {
            self.orchestrator.delete_volume(volume_id).await
        };
        self.observe("DeleteVolume", started, result)
    }

    /// Snapshot a volume
    pub async fn create_snapshot(&self, request: CreateSnapshotRequest) -> Result<CreateSnapshotResponse> {
        let started = Instant::now();
        let result: Result<CreateSnapshotResponse> = async {
            let params = SnapshotParams::parse(&request.parameters)?;
            let info = self
                .orchestrator
                .create_snapshot(&request.source_volume_id, &request.name, params.wait)
                .await?;
            Ok(CreateSnapshotResponse {
                snapshot_id: info.snapshot_id,
                source_volume_id: info.source_volume,
                size_bytes: info.size_bytes,
                creation_time: info.creation_time,
                ready_to_use: info.ready_to_use,
            })
        }
        .await;
        self.observe("CreateSnapshot", started, result)
    }

    /// Request deletion of a snapshot; always succeeds for malformed ids
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.orchestrator.delete_snapshot(snapshot_id).await;
        self.observe("DeleteSnapshot", started, result)
    }

    /// Grow a volume
    pub async fn expand_volume(&self, volume_id: &str, capacity_range: CapacityRange) -> Result<ExpandVolumeResponse> {
        let started = Instant::now();
        let result: Result<ExpandVolumeResponse> = async {
            if volume_id.is_empty() {
                return Err(Error::InvalidArgument("volume id is required".into()));
            }
            let size = capacity_range.resolve()?;
            let expanded = self.orchestrator.expand_volume(volume_id, size).await?;
            Ok(ExpandVolumeResponse {
                capacity_bytes: expanded.capacity_bytes,
                node_expansion_required: expanded.node_expansion_required,
            })
        }
        .await;
        self.observe("ControllerExpandVolume", started, result)
    }

    /// Largest free space of the pool on a matching host
    pub async fn get_capacity(&self, request: GetCapacityRequest) -> Result<u64> {
        let started = Instant::now();
        let result: Result<u64> = async {
            let params = VolumeParams::parse(&request.parameters)?;
            let constraint: Vec<TopologySegment> = request.accessible_topology.into_iter().collect();
            self.orchestrator
                .available_capacity(&params.pool_name, &constraint)
                .await
        }
        .await;
        self.observe("GetCapacity", started, result)
    }
}
