//! Error types for the LocalPV provisioner
//!
//! Provides structured error types for the orchestrator, the per-host
//! reconcilers and the resource store adapters. Every error maps onto one
//! of the caller-visible [`ErrorKind`]s.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}: {reason}")]
    Conflict {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("Operation already in progress for {kind}/{name}: {reason}")]
    InProgress {
        kind: String,
        name: String,
        reason: String,
    },

    // =========================================================================
    // Provisioning Errors
    // =========================================================================
    #[error("Scheduling failed for volume {volume}: {reason}")]
    SchedulingFailed { volume: String, reason: String },

    #[error("Sync failed for {kind}/{name} on node {node}: {reason}")]
    SyncFailed {
        kind: String,
        name: String,
        node: String,
        reason: String,
    },

    #[error("Timed out after {waited:?} waiting for {kind}/{name}")]
    Timeout {
        kind: String,
        name: String,
        waited: Duration,
    },

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error("Version conflict on {kind}/{name}: expected resourceVersion {expected}")]
    VersionConflict {
        kind: String,
        name: String,
        expected: String,
    },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Watch stream error: {0}")]
    Watch(String),

    // =========================================================================
    // Storage Engine Errors
    // =========================================================================
    #[error("Storage engine operation failed: {operation} on {target}: {reason}")]
    EngineOperationFailed {
        operation: String,
        target: String,
        reason: String,
    },

    #[error("Insufficient capacity in pool {pool}: requested {requested} bytes, available {available} bytes")]
    InsufficientCapacity {
        pool: String,
        requested: u64,
        available: u64,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller-visible classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or contradictory request fields; never retried
    InvalidArgument,
    /// Same key exists with different parameters
    Conflict,
    /// Referenced resource is absent
    NotFound,
    /// No candidate host available
    SchedulingFailed,
    /// Host-side operation failed; retried internally
    SyncFailed,
    /// Bounded wait exceeded; the operation may still complete
    Timeout,
    /// Another operation on the same key has not finished yet
    InProgress,
    /// Store or transport level failure
    Unavailable,
    /// Bug or misconfiguration
    Internal,
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Shorthand for a missing resource
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Shorthand for an operation that must be retried later
    pub fn in_progress(
        kind: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::InProgress {
            kind: kind.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Classify this error for the caller
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::ResourceNotFound { .. } => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::InProgress { .. } | Error::VersionConflict { .. } => ErrorKind::InProgress,
            Error::SchedulingFailed { .. } | Error::InsufficientCapacity { .. } => {
                ErrorKind::SchedulingFailed
            }
            Error::SyncFailed { .. } | Error::EngineOperationFailed { .. } => ErrorKind::SyncFailed,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Kube(_) | Error::Watch(_) | Error::Io(_) | Error::ShuttingDown(_) => {
                ErrorKind::Unavailable
            }
            Error::Internal(_)
            | Error::Configuration(_)
            | Error::JsonParse(_)
            | Error::Yaml(_) => ErrorKind::Internal,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Watch(_)
            | Error::VersionConflict { .. }
            | Error::SyncFailed { .. }
            | Error::EngineOperationFailed { .. } => ErrorAction::RequeueWithBackoff,

            // In-progress operations - wait
            Error::InProgress { .. } => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            // Timeout - the host may still be working
            Error::Timeout { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Resource issues - medium retry
            Error::InsufficientCapacity { .. } | Error::SchedulingFailed { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::InvalidArgument(_)
            | Error::Conflict { .. }
            | Error::ShuttingDown(_)
            | Error::JsonParse(_)
            | Error::Yaml(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Watch(_) | Error::VersionConflict { .. }
        )
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::in_progress("LocalVolume", "pvc-1", "still pending");
        assert_eq!(err.action(), ErrorAction::RequeueAfter(Duration::from_secs(5)));

        let err = Error::InvalidArgument("missing poolname".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::SchedulingFailed {
            volume: "pvc-1".into(),
            reason: "no hosts".into(),
        };
        assert_eq!(err.action(), ErrorAction::RequeueAfter(Duration::from_secs(60)));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::not_found("LocalVolume", "v").kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::Timeout {
                kind: "LocalVolume".into(),
                name: "v".into(),
                waited: Duration::from_secs(1),
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            Error::Conflict {
                kind: "LocalSnapshot".into(),
                name: "s".into(),
                reason: "other source".into(),
            }
            .kind(),
            ErrorKind::Conflict
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::VersionConflict {
            kind: "LocalVolume".into(),
            name: "v".into(),
            expected: "7".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }
}
