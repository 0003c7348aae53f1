//! Compare-and-set retries
//!
//! Every record write is read-modify-write against `resourceVersion`. When a
//! write loses the race the record is re-read, the mutation re-applied, and
//! the write retried with exponential backoff.

use crate::crd::Record;
use crate::domain::ports::RecordStore;
use crate::error::{Error, Result};
use backoff::ExponentialBackoff;
use std::time::Duration;
use tracing::debug;

pub use ::backoff::future::retry;
pub use ::backoff::Error as BackoffError;

/// Which part of a record a write replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// Metadata and spec
    Spec,
    /// Status subresource
    Status,
}

/// Backoff policy for version conflicts: short, bounded
pub fn conflict_policy() -> ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(10);
    const MAX_INTERVAL: Duration = Duration::from_millis(500);
    const MAX_ELAPSED: Duration = Duration::from_secs(10);
    ExponentialBackoff {
        current_interval: INITIAL_INTERVAL,
        initial_interval: INITIAL_INTERVAL,
        multiplier: 2.0,
        max_interval: MAX_INTERVAL,
        max_elapsed_time: Some(MAX_ELAPSED),
        ..ExponentialBackoff::default()
    }
}

/// Re-read `name`, apply `mutate`, and write it back, retrying on conflicts
///
/// `mutate` returns false when the record already has the wanted shape, in
/// which case nothing is written. Returns `None` if the record is gone.
pub async fn modify<K, F>(
    store: &dyn RecordStore<K>,
    name: &str,
    target: WriteTarget,
    mutate: F,
) -> Result<Option<K>>
where
    K: Record,
    F: Fn(&mut K) -> Result<bool>,
{
    let mutate = &mutate;
    retry(conflict_policy(), || async move {
        let Some(mut record) = store.get(name).await.map_err(BackoffError::permanent)? else {
            return Ok(None);
        };

        if !mutate(&mut record).map_err(BackoffError::permanent)? {
            return Ok(Some(record));
        }

        let written = match target {
            WriteTarget::Spec => store.update(record).await,
            WriteTarget::Status => store.update_status(record).await,
        };

        match written {
            Ok(record) => Ok(Some(record)),
            Err(Error::ResourceNotFound { .. }) => Ok(None),
            Err(e @ Error::VersionConflict { .. }) => {
                debug!(kind = %K::KIND, name = %name, "Write lost a version race, retrying");
                Err(BackoffError::transient(e))
            }
            Err(e) => Err(BackoffError::permanent(e)),
        }
    })
    .await
}
