//! Control Plane Module
//!
//! The central side of the provisioning protocol: scheduling, per-resource
//! locking, and the orchestrator that writes intent records and waits for
//! the owning hosts to converge them.

pub mod locks;
pub mod orchestrator;
pub mod params;
pub mod scheduler;
pub mod service;

pub use locks::*;
pub use orchestrator::*;
pub use params::*;
pub use scheduler::*;
pub use service::{
    ControllerService, CreateSnapshotRequest, CreateVolumeRequest, CreateSnapshotResponse, CreateVolumeResponse,
    ExpandVolumeResponse, GetCapacityRequest, TopologyRequirement,
};
