//! LocalPV Provisioner - Host-Local Volume Control Plane
//!
//! Provisions volumes that live on exactly one host's storage pool. The
//! control plane never talks to hosts: it writes intent records to a shared
//! resource store and waits for the agent on the owning host to converge
//! them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            Controller Service                               │
//! │       CreateVolume  DeleteVolume  CreateSnapshot  DeleteSnapshot  ...       │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │    Scheduler    │  │  Lock Registry  │  │  Provisioning Orchestrator  │  │
//! │  └─────────────────┘  └─────────────────┘  └──────────────┬──────────────┘  │
//! ├────────────────────────────────────────────────────────────┼────────────────┤
//! │                 Resource Store (intent records, CAS)       │                │
//! ├────────────────────────────────────────────────────────────┼────────────────┤
//! │                              Host Agents                   ▼                │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │  Reconcilers (per kind)     │  │  Node Reporter                      │   │
//! │  │  queue + workers            │  │  pools -> StorageNode               │   │
//! │  └──────────────┬──────────────┘  └─────────────────────────────────────┘   │
//! │                 ▼                                                           │
//! │          Storage Engine                                                     │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Scheduler, locks, orchestrator and controller service
//! - [`agent`]: Per-host reconcilers, work queue and node reporter
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Store and storage engine ports
//! - [`store`]: Record store adapters
//! - [`metrics`]: Prometheus collectors
//! - [`error`]: Error types and handling

pub mod agent;
pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod store;

// Re-export commonly used types
pub use agent::{
    Agent, AgentConfig, AgentStores, Converge, NodeReporter, QueueConfig, Reconciler,
    ReconcilerConfig, SimulatedEngine, WorkQueue,
};

pub use controlplane::{
    CapacityRange, ControllerService, LockRegistry, Orchestrator, OrchestratorConfig,
    Scheduler, SchedulingAlgorithm, Stores,
};

pub use crd::{
    IntentRecord, LocalBackup, LocalRestore, LocalSnapshot, LocalVolume, Record, RecordKind,
    RecordState, StorageNode,
};

pub use domain::ports::{RecordStore, StorageEngine, WatchEvent};

pub use error::{Error, ErrorAction, ErrorKind, Result};

pub use metrics::Metrics;

pub use store::{KubeStore, MemoryStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
