//! Work Queue
//!
//! A keyed work queue feeding the reconciler workers. A key is queued at
//! most once however often it is added, and is handed to at most one worker
//! at a time: adding a key that is being processed marks it dirty, and it
//! is queued again when its worker calls [`WorkQueue::done`].
//!
//! Failed keys are re-added after a per-key exponential delay that resets
//! on [`WorkQueue::forget`].

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

// =============================================================================
// Configuration
// =============================================================================

/// Delays for rate-limited re-adds
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound of the delay
    pub max_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

// =============================================================================
// Work Queue
// =============================================================================

#[derive(Debug, Default)]
struct QueueState {
    /// Keys waiting for a worker, in arrival order
    queue: VecDeque<String>,
    /// Keys that need processing (queued, or re-added while processing)
    dirty: HashSet<String>,
    /// Keys currently held by a worker
    processing: HashSet<String>,
    shutting_down: bool,
}

/// Failure history of one key
#[derive(Debug)]
struct KeyBackoff {
    failures: u32,
    backoff: ExponentialBackoff,
}

/// Deduplicating, per-key exclusive work queue
#[derive(Debug)]
pub struct WorkQueue {
    name: String,
    config: QueueConfig,
    state: Mutex<QueueState>,
    available: Notify,
    /// Consecutive failures per key
    failures: DashMap<String, KeyBackoff>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            config,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            failures: DashMap::new(),
        })
    }

    /// Queue a key unless it is already waiting
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();
        if state.shutting_down || !state.dirty.insert(key.to_string()) {
            return;
        }
        if state.processing.contains(key) {
            trace!(queue = %self.name, key = %key, "Key busy, deferred until done");
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.available.notify_one();
    }

    /// Wait for the next key; `None` once the queue is shut down and empty
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release a key taken with [`get`](Self::get)
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.available.notify_one();
        }
    }

    /// Re-add a key after its backoff delay; returns the delay
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) -> Duration {
        let delay = self.next_delay(key);
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
        delay
    }

    /// Per-key policy: doubles from the base delay up to the cap, no jitter,
    /// never gives up
    fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.config.base_delay,
            initial_interval: self.config.base_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.config.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Count a failure of `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut entry = self.failures.entry(key.to_string()).or_insert_with(|| KeyBackoff {
            failures: 0,
            backoff: self.policy(),
        });
        entry.failures = entry.failures.saturating_add(1);
        entry.backoff.next_backoff().unwrap_or(self.config.max_delay)
    }

    /// Reset the failure count of a key
    pub fn forget(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Number of failures recorded for a key since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).map(|f| f.failures).unwrap_or(0)
    }

    /// Stop accepting keys and wake every waiting worker
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.available.notify_waiters();
        debug!(queue = %self.name, "Work queue shut down");
    }

    /// Keys waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
