//! Record Store Adapters
//!
//! Implementations of the [`RecordStore`](crate::domain::ports::RecordStore)
//! port:
//! - MemoryStore: in-process store with API-server semantics
//! - KubeStore: custom resources on a Kubernetes API server
//!
//! plus the compare-and-set retry helper shared by every writer.

mod kubernetes;
mod memory;
pub mod retry;

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;
pub use retry::{modify, WriteTarget};
