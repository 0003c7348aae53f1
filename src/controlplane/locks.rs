//! Lock Registry
//!
//! In-process mutual exclusion keyed by volume or snapshot name. The
//! orchestrator holds a key for the whole duration of an operation so that
//! concurrent requests for the same name serialize instead of racing.
//!
//! This is not a distributed lock. Two orchestrator replicas can still race
//! on one record; that is settled by the store's resourceVersion checks.
//!
//! There is no timeout: a holder that never finishes blocks its key until
//! the process restarts.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

// =============================================================================
// Lock Registry
// =============================================================================

/// Registry of held resource keys
#[derive(Debug, Default)]
pub struct LockRegistry {
    /// Keys currently held
    held: Mutex<HashSet<String>>,
    /// Woken on every release; waiters race to re-check
    released: Notify,
    /// Set once the registry stops handing out keys
    closed: AtomicBool,
}

impl LockRegistry {
    /// Create a new registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait until `key` is free, then hold it until the guard is dropped
    pub async fn acquire(&self, key: &str) -> Result<KeyGuard<'_>> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            {
                let mut held = self.held.lock();
                if self.closed.load(Ordering::Acquire) {
                    return Err(Error::ShuttingDown(format!(
                        "lock registry closed, refusing {}",
                        key
                    )));
                }
                if held.insert(key.to_string()) {
                    trace!(key = %key, "Lock acquired");
                    return Ok(KeyGuard {
                        registry: self,
                        key: key.to_string(),
                    });
                }
            }

            trace!(key = %key, "Lock busy, waiting");
            notified.await;
        }
    }

    /// Acquire two keys in the given order; equal keys are held once
    pub async fn acquire_both(&self, first: &str, second: &str) -> Result<PairGuard<'_>> {
        let first_guard = self.acquire(first).await?;
        let second_guard = if second == first {
            None
        } else {
            Some(self.acquire(second).await?)
        };
        Ok(PairGuard {
            _first: first_guard,
            _second: second_guard,
        })
    }

    /// Check whether a key is currently held
    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }

    /// Number of held keys
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Refuse further acquisitions; current holders keep their keys
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.released.notify_waiters();
        debug!("Lock registry closed");
    }

    /// Wait until every held key has been released
    pub async fn drain(&self) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.held.lock().is_empty() {
                debug!("Lock registry drained");
                return;
            }
            notified.await;
        }
    }

    fn release(&self, key: &str) {
        self.held.lock().remove(key);
        trace!(key = %key, "Lock released");
        self.released.notify_waiters();
    }
}

// =============================================================================
// Guards
// =============================================================================

/// Holds one key; releases it on drop
#[derive(Debug)]
pub struct KeyGuard<'a> {
    registry: &'a LockRegistry,
    key: String,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

/// Holds two keys; releases both on drop
#[derive(Debug)]
pub struct PairGuard<'a> {
    _first: KeyGuard<'a>,
    _second: Option<KeyGuard<'a>>,
}
