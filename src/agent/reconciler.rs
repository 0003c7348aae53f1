//! Reconciler
//!
//! Generic convergence loop run by the agent on every host, one instance per
//! record kind. It watches the store, keeps the records owned by the local
//! host, and drives each through its lifecycle:
//!
//! ```text
//!   no finalizer, or not Ready   apply    ->  finalizer, then Ready
//!                                 failure  ->  Failed, retried with backoff
//!   finalizer + Ready             reconfigure, only after a spec edit
//!   deletionTimestamp set         teardown ->  finalizer removed
//! ```
//!
//! The finalizer is written before the Ready status, so a crash between the
//! two writes leaves a record that is applied again on restart. Engines make
//! that repeat a no-op.

use crate::agent::queue::{QueueConfig, WorkQueue};
use crate::crd::{IntentRecord, RecordState, NODE_ID_LABEL};
use crate::domain::ports::{RecordStore, WatchEvent};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::store::{modify, WriteTarget};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// Pause before re-opening a watch that ended
const WATCH_RESTART_DELAY: Duration = Duration::from_secs(1);

// =============================================================================
// Converge Trait
// =============================================================================

/// Host-side actions for one record kind
#[async_trait]
pub trait Converge<K: IntentRecord>: Send + Sync + 'static {
    /// Create the host resource. May fill status fields of `record`, which
    /// are written back together with the Ready state. Must be idempotent.
    async fn apply(&self, record: &mut K) -> Result<()>;

    /// Bring an existing host resource in line with an edited spec
    async fn reconfigure(&self, _record: &K) -> Result<()> {
        Ok(())
    }

    /// Remove the host resource; removing an absent one succeeds
    async fn teardown(&self, record: &K) -> Result<()>;
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Host this reconciler acts for
    pub node_id: String,
    /// Number of concurrent workers
    pub workers: usize,
    /// Interval of the full relist
    pub resync_interval: Duration,
    /// Requeue delays
    pub queue: QueueConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            workers: 4,
            resync_interval: Duration::from_secs(60),
            queue: QueueConfig::default(),
        }
    }
}

/// Apply `change` and report whether it altered the record; unchanged
/// records are not written back and raise no watch event
fn changed<K: IntentRecord>(record: &mut K, change: impl FnOnce(&mut K)) -> Result<bool> {
    let before = serde_json::to_value(&*record)?;
    change(record);
    Ok(serde_json::to_value(&*record)? != before)
}

// =============================================================================
// Reconciler
// =============================================================================

/// Watches one record kind and converges the locally owned records
pub struct Reconciler<K: IntentRecord> {
    config: ReconcilerConfig,
    store: Arc<dyn RecordStore<K>>,
    handler: Arc<dyn Converge<K>>,
    queue: Arc<WorkQueue>,
    /// Spec fingerprint last applied or reconfigured, by record name
    applied: DashMap<String, String>,
    /// resourceVersion of the last write this reconciler made, by record name
    own_writes: DashMap<String, String>,
    metrics: Option<Arc<Metrics>>,
}

impl<K: IntentRecord> Reconciler<K> {
    pub fn new(
        config: ReconcilerConfig,
        store: Arc<dyn RecordStore<K>>,
        handler: Arc<dyn Converge<K>>,
        metrics: Option<Arc<Metrics>>,
    ) -> Arc<Self> {
        let queue = WorkQueue::new(format!("{}/{}", K::KIND, config.node_id), config.queue.clone());
        Arc::new(Self {
            config,
            store,
            handler,
            queue,
            applied: DashMap::new(),
            own_writes: DashMap::new(),
            metrics,
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    fn owns(&self, record: &K) -> bool {
        record.owner_node_id() == self.config.node_id
    }

    /// Queue a record if this host owns it
    fn enqueue(&self, record: &K) {
        if self.owns(record) {
            self.queue.add(&record.name_any());
        } else {
            trace!(kind = %K::KIND, name = %record.name_any(), owner = %record.owner_node_id(), "Ignoring record of another host");
        }
    }

    /// Whether the record is the version produced by this reconciler's own
    /// last write
    fn is_own_write(&self, record: &K) -> bool {
        let Some(version) = record.resource_version() else {
            return false;
        };
        self.own_writes
            .get(&record.name_any())
            .is_some_and(|own| *own == version)
    }

    fn handle_event(&self, event: WatchEvent<K>) {
        match event {
            // Retries of a failed apply are paced by the queue's backoff
            WatchEvent::Applied(record) if self.is_own_write(&record) => {
                trace!(kind = %K::KIND, name = %record.name_any(), "Skipping event of own write");
            }
            WatchEvent::Applied(record) | WatchEvent::Deleted(record) => self.enqueue(&record),
            WatchEvent::Restarted(records) => records.iter().for_each(|r| self.enqueue(r)),
        }
    }

    /// Queue every record labelled with the local host
    async fn resync(&self) -> Result<()> {
        let mut selector = BTreeMap::new();
        selector.insert(NODE_ID_LABEL.to_string(), self.config.node_id.clone());
        let records = self.store.list(&selector).await?;
        trace!(kind = %K::KIND, count = records.len(), "Resync");
        records.iter().for_each(|r| self.enqueue(r));
        Ok(())
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Converge one record by name
    #[instrument(skip(self), fields(kind = %K::KIND, node = %self.config.node_id))]
    pub async fn sync(&self, name: &str) -> Result<()> {
        let Some(record) = self.store.get(name).await? else {
            self.applied.remove(name);
            self.own_writes.remove(name);
            return Ok(());
        };
        if !self.owns(&record) {
            return Ok(());
        }

        if record.is_deleting() {
            if record.has_finalizer() {
                return self.finalize(&record).await;
            }
            return Ok(());
        }

        if !record.has_finalizer() || record.state() != RecordState::Ready {
            return self.converge(record).await;
        }

        self.reconfigure(&record).await
    }

    /// [`modify`] that remembers the version it wrote
    async fn write<F>(&self, name: &str, target: WriteTarget, mutate: F) -> Result<Option<K>>
    where
        F: Fn(&mut K) -> Result<bool>,
    {
        let wrote = AtomicBool::new(false);
        let current = modify(self.store.as_ref(), name, target, |r: &mut K| {
            let write = mutate(r)?;
            wrote.store(write, Ordering::Relaxed);
            Ok(write)
        })
        .await?;

        if wrote.load(Ordering::Relaxed) {
            if let Some(version) = current.as_ref().and_then(|r| r.resource_version()) {
                self.own_writes.insert(name.to_string(), version);
            }
        }
        Ok(current)
    }

    /// Whether `current` is still the record this host applied
    ///
    /// A record deleted and recreated under the same name carries a new uid,
    /// and may be addressed to another host.
    fn is_same(&self, uid: &Option<String>, current: &K) -> bool {
        current.uid() == *uid && self.owns(current)
    }

    async fn converge(&self, record: K) -> Result<()> {
        let name = record.name_any();
        let uid = record.uid();
        let mut applied = record;

        if let Err(e) = self.handler.apply(&mut applied).await {
            warn!(kind = %K::KIND, name = %name, error = %e, "Apply failed");
            let message = e.to_string();
            self.write(&name, WriteTarget::Status, |r: &mut K| {
                if !self.is_same(&uid, r) {
                    return Ok(false);
                }
                changed(r, |r| r.set_state(RecordState::Failed, Some(message.clone())))
            })
            .await?;
            return Err(e);
        }

        let finalized = self.write(&name, WriteTarget::Spec, |r: &mut K| {
            Ok(self.is_same(&uid, r) && !r.is_deleting() && r.add_finalizer())
        })
        .await?;

        let record = match finalized {
            Some(r) if !self.is_same(&uid, &r) => {
                warn!(
                    kind = %K::KIND,
                    name = %name,
                    owner = %r.owner_node_id(),
                    "Record replaced after apply, tearing down host resource"
                );
                return self.handler.teardown(&applied).await;
            }
            Some(r) if r.has_finalizer() => r,
            Some(_) => {
                debug!(kind = %K::KIND, name = %name, "Deleted while applying, leaving teardown to the next pass");
                return Ok(());
            }
            None => {
                warn!(kind = %K::KIND, name = %name, "Record vanished after apply, tearing down host resource");
                return self.handler.teardown(&applied).await;
            }
        };

        self.write(&name, WriteTarget::Status, |r: &mut K| {
            if !self.is_same(&uid, r) {
                return Ok(false);
            }
            changed(r, |r| {
                r.adopt_status(&applied);
                r.set_state(RecordState::Ready, None);
            })
        })
        .await?;

        self.applied.insert(name.clone(), record.spec_fingerprint());
        info!(kind = %K::KIND, name = %name, "Ready");
        Ok(())
    }

    async fn reconfigure(&self, record: &K) -> Result<()> {
        let name = record.name_any();
        let fingerprint = record.spec_fingerprint();
        if self.applied.get(&name).is_some_and(|f| *f == fingerprint) {
            return Ok(());
        }

        self.handler.reconfigure(record).await?;
        debug!(kind = %K::KIND, name = %name, "Reconfigured");
        self.applied.insert(name, fingerprint);
        Ok(())
    }

    async fn finalize(&self, record: &K) -> Result<()> {
        let name = record.name_any();
        let uid = record.uid();
        self.handler.teardown(record).await?;

        self.write(&name, WriteTarget::Spec, |r: &mut K| {
            Ok(self.is_same(&uid, r) && r.remove_finalizer())
        })
        .await?;
        self.applied.remove(&name);
        self.own_writes.remove(&name);
        info!(kind = %K::KIND, name = %name, "Torn down, finalizer removed");
        Ok(())
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Sync one key and decide whether it comes back
    pub async fn process(&self, key: &str) {
        if key.is_empty() || key.contains('/') {
            error!(kind = %K::KIND, key = %key, "Dropping malformed key");
            self.queue.forget(key);
            return;
        }

        let result = self.sync(key).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_reconcile(&K::KIND.to_string(), result.is_ok());
        }

        match result {
            Ok(()) => self.queue.forget(key),
            Err(e) if !e.is_retryable() => {
                error!(kind = %K::KIND, name = %key, error = %e, "Giving up on record");
                self.queue.forget(key);
            }
            Err(e) => {
                let delay = self.queue.add_rate_limited(key);
                debug!(kind = %K::KIND, name = %key, error = %e, ?delay, "Requeued");
                if let Some(metrics) = &self.metrics {
                    let kind = K::KIND.to_string();
                    metrics.requeues.with_label_values(&[kind.as_str()]).inc();
                }
            }
        }
    }

    async fn worker(self: Arc<Self>, id: usize) {
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        trace!(kind = %K::KIND, worker = id, "Worker stopped");
    }

    /// Watch and converge until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(kind = %K::KIND, node = %self.config.node_id, workers = self.config.workers, "Starting reconciler");

        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|id| tokio::spawn(Arc::clone(&self).worker(id)))
            .collect();

        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events = self.store.watch();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = resync.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!(kind = %K::KIND, error = %e, "Resync failed");
                    }
                }
                event = events.next() => match event {
                    Some(Ok(event)) => self.handle_event(event),
                    Some(Err(e)) => warn!(kind = %K::KIND, error = %e, "Watch error"),
                    None => {
                        warn!(kind = %K::KIND, "Watch ended, restarting");
                        tokio::time::sleep(WATCH_RESTART_DELAY).await;
                        events = self.store.watch();
                    }
                },
            }
        }

        self.queue.shut_down();
        futures::future::join_all(workers).await;
        info!(kind = %K::KIND, node = %self.config.node_id, "Reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LocalVolume, LocalVolumeSpec};
    use crate::error::Error;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeHandler {
        applies: AtomicUsize,
        reconfigures: AtomicUsize,
        teardowns: AtomicUsize,
        failing_applies: AtomicUsize,
        failing_teardowns: AtomicUsize,
        /// Delete the record from under the reconciler during apply
        vanish: Option<Arc<MemoryStore<LocalVolume>>>,
        /// Once, during apply, recreate the record under the same name for
        /// the given host
        replace: parking_lot::Mutex<Option<(Arc<MemoryStore<LocalVolume>>, &'static str)>>,
        deleted: AtomicBool,
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl Converge<LocalVolume> for FakeHandler {
        async fn apply(&self, record: &mut LocalVolume) -> Result<()> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            if take(&self.failing_applies) {
                return Err(Error::EngineOperationFailed {
                    operation: "create".into(),
                    target: record.name_any(),
                    reason: "pool is full".into(),
                });
            }
            if let Some(store) = &self.vanish {
                store.delete(&record.name_any()).await?;
            }
            let replace = self.replace.lock().take();
            if let Some((store, owner)) = replace {
                let name = record.name_any();
                store.delete(&name).await?;
                store
                    .create(LocalVolume::pending(&name, "openebs", LocalVolumeSpec::new(owner, "tank", 1 << 20)))
                    .await?;
            }
            Ok(())
        }

        async fn reconfigure(&self, _record: &LocalVolume) -> Result<()> {
            self.reconfigures.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn teardown(&self, record: &LocalVolume) -> Result<()> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            if take(&self.failing_teardowns) {
                return Err(Error::EngineOperationFailed {
                    operation: "destroy".into(),
                    target: record.name_any(),
                    reason: "dataset is busy".into(),
                });
            }
            self.deleted.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> ReconcilerConfig {
        ReconcilerConfig {
            node_id: "node-a".into(),
            workers: 2,
            resync_interval: Duration::from_secs(60),
            queue: QueueConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(20),
            },
        }
    }

    fn setup(handler: FakeHandler) -> (Arc<MemoryStore<LocalVolume>>, Arc<FakeHandler>, Arc<Reconciler<LocalVolume>>) {
        let store = Arc::new(MemoryStore::new("openebs"));
        let handler = Arc::new(handler);
        let reconciler = Reconciler::new(config(), store.clone(), handler.clone(), None);
        (store, handler, reconciler)
    }

    async fn create(store: &MemoryStore<LocalVolume>, name: &str, owner: &str) -> LocalVolume {
        store
            .create(LocalVolume::pending(name, "openebs", LocalVolumeSpec::new(owner, "tank", 1 << 20)))
            .await
            .unwrap()
    }

    async fn get(store: &MemoryStore<LocalVolume>, name: &str) -> Option<LocalVolume> {
        store.get(name).await.unwrap()
    }

    #[tokio::test]
    async fn test_ignores_records_of_other_hosts() {
        let (store, handler, reconciler) = setup(FakeHandler::default());
        let created = create(&store, "pvc-1", "node-b").await;

        reconciler.sync("pvc-1").await.unwrap();

        assert_eq!(handler.applies.load(Ordering::SeqCst), 0);
        let stored = get(&store, "pvc-1").await.unwrap();
        assert_eq!(stored.resource_version(), created.resource_version());
    }

    #[tokio::test]
    async fn test_apply_sets_finalizer_and_ready() {
        let (store, handler, reconciler) = setup(FakeHandler::default());
        create(&store, "pvc-1", "node-a").await;

        reconciler.sync("pvc-1").await.unwrap();

        let stored = get(&store, "pvc-1").await.unwrap();
        assert!(stored.has_finalizer());
        assert_eq!(stored.state(), RecordState::Ready);
        assert_eq!(handler.applies.load(Ordering::SeqCst), 1);

        // Converged records are left alone
        reconciler.sync("pvc-1").await.unwrap();
        assert_eq!(handler.applies.load(Ordering::SeqCst), 1);
        assert_eq!(handler.reconfigures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_record_reassigned_during_apply_is_left_alone() {
        let store = Arc::new(MemoryStore::new("openebs"));
        let handler = Arc::new(FakeHandler {
            replace: parking_lot::Mutex::new(Some((store.clone(), "node-b"))),
            ..Default::default()
        });
        let reconciler = Reconciler::new(config(), store.clone(), handler.clone(), None);
        create(&store, "pvc-1", "node-a").await;

        reconciler.sync("pvc-1").await.unwrap();

        let stored = get(&store, "pvc-1").await.unwrap();
        assert_eq!(stored.owner_node_id(), "node-b");
        assert!(!stored.has_finalizer());
        assert_eq!(stored.state(), RecordState::Pending);
        assert_eq!(handler.teardowns.load(Ordering::SeqCst), 1);

        // The replacement now belongs to node-b
        reconciler.sync("pvc-1").await.unwrap();
        assert_eq!(handler.applies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_record_recreated_for_same_host_is_applied_afresh() {
        let store = Arc::new(MemoryStore::new("openebs"));
        let handler = Arc::new(FakeHandler {
            replace: parking_lot::Mutex::new(Some((store.clone(), "node-a"))),
            ..Default::default()
        });
        let reconciler = Reconciler::new(config(), store.clone(), handler.clone(), None);
        let original = create(&store, "pvc-1", "node-a").await;

        reconciler.sync("pvc-1").await.unwrap();
        let stored = get(&store, "pvc-1").await.unwrap();
        assert_ne!(stored.uid(), original.uid());
        assert!(!stored.has_finalizer());
        assert_eq!(handler.teardowns.load(Ordering::SeqCst), 1);

        reconciler.sync("pvc-1").await.unwrap();
        let stored = get(&store, "pvc-1").await.unwrap();
        assert!(stored.has_finalizer());
        assert_eq!(stored.state(), RecordState::Ready);
        assert_eq!(handler.applies.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_apply_marks_failed_then_recovers() {
        let handler = FakeHandler::default();
        handler.failing_applies.store(1, Ordering::SeqCst);
        let (store, handler, reconciler) = setup(handler);
        create(&store, "pvc-1", "node-a").await;

        let err = reconciler.sync("pvc-1").await.unwrap_err();
        assert_matches!(err, Error::EngineOperationFailed { .. });
        let stored = get(&store, "pvc-1").await.unwrap();
        assert_eq!(stored.state(), RecordState::Failed);
        assert!(!stored.has_finalizer());
        assert_eq!(stored.status.unwrap().message.as_deref().map(|m| m.contains("pool is full")), Some(true));

        reconciler.sync("pvc-1").await.unwrap();
        let stored = get(&store, "pvc-1").await.unwrap();
        assert_eq!(stored.state(), RecordState::Ready);
        assert_eq!(stored.status.unwrap().message, None);
        assert_eq!(handler.applies.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_status_write_does_not_bypass_backoff() {
        let handler = Arc::new(FakeHandler::default());
        handler.failing_applies.store(1, Ordering::SeqCst);
        let store = Arc::new(MemoryStore::new("openebs"));
        let slow = ReconcilerConfig {
            queue: QueueConfig {
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(60),
            },
            ..config()
        };
        let reconciler = Reconciler::new(slow, store.clone(), handler.clone(), None);
        let queue = reconciler.queue().clone();

        let mut events = store.watch();
        create(&store, "pvc-1", "node-a").await;
        while let Ok(Some(Ok(event))) = tokio::time::timeout(Duration::from_millis(20), events.next()).await {
            reconciler.handle_event(event);
        }

        let key = queue.get().await.unwrap();
        reconciler.process(&key).await;
        assert_eq!(get(&store, "pvc-1").await.unwrap().state(), RecordState::Failed);

        // The Failed write is observed while the key is still being processed
        while let Ok(Some(Ok(event))) = tokio::time::timeout(Duration::from_millis(20), events.next()).await {
            reconciler.handle_event(event);
        }
        queue.done(&key);

        assert!(queue.is_empty());
        assert_eq!(queue.num_requeues("pvc-1"), 1);
        assert_eq!(handler.applies.load(Ordering::SeqCst), 1);

        // Edits by anyone else still wake the key
        let mut vol = get(&store, "pvc-1").await.unwrap();
        vol.spec.capacity_bytes *= 2;
        store.update(vol).await.unwrap();
        while let Ok(Some(Ok(event))) = tokio::time::timeout(Duration::from_millis(20), events.next()).await {
            reconciler.handle_event(event);
        }
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_finalizer_without_ready_is_applied_again() {
        let (store, handler, reconciler) = setup(FakeHandler::default());
        let mut vol = create(&store, "pvc-1", "node-a").await;
        vol.add_finalizer();
        store.update(vol).await.unwrap();

        reconciler.sync("pvc-1").await.unwrap();

        assert_eq!(handler.applies.load(Ordering::SeqCst), 1);
        assert_eq!(get(&store, "pvc-1").await.unwrap().state(), RecordState::Ready);
    }

    #[tokio::test]
    async fn test_spec_edit_triggers_one_reconfigure() {
        let (store, handler, reconciler) = setup(FakeHandler::default());
        create(&store, "pvc-1", "node-a").await;
        reconciler.sync("pvc-1").await.unwrap();

        let mut vol = get(&store, "pvc-1").await.unwrap();
        vol.spec.properties.compression = Some("lz4".into());
        store.update(vol).await.unwrap();

        reconciler.sync("pvc-1").await.unwrap();
        reconciler.sync("pvc-1").await.unwrap();
        assert_eq!(handler.reconfigures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finalizer_cleared_only_after_teardown() {
        let handler = FakeHandler::default();
        handler.failing_teardowns.store(1, Ordering::SeqCst);
        let (store, handler, reconciler) = setup(handler);
        create(&store, "pvc-1", "node-a").await;
        reconciler.sync("pvc-1").await.unwrap();

        store.delete("pvc-1").await.unwrap();
        assert!(reconciler.sync("pvc-1").await.is_err());
        let stored = get(&store, "pvc-1").await.unwrap();
        assert!(stored.is_deleting());
        assert!(stored.has_finalizer());

        reconciler.sync("pvc-1").await.unwrap();
        assert!(get(&store, "pvc-1").await.is_none());
        assert_eq!(handler.teardowns.load(Ordering::SeqCst), 2);
        assert!(handler.deleted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_vanished_record_is_torn_down() {
        let store = Arc::new(MemoryStore::new("openebs"));
        let handler = Arc::new(FakeHandler {
            vanish: Some(store.clone()),
            ..Default::default()
        });
        let reconciler = Reconciler::new(config(), store.clone(), handler.clone(), None);
        create(&store, "pvc-1", "node-a").await;

        reconciler.sync("pvc-1").await.unwrap();

        assert!(get(&store, "pvc-1").await.is_none());
        assert_eq!(handler.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_key_dropped() {
        let (_store, handler, reconciler) = setup(FakeHandler::default());
        reconciler.process("openebs/pvc-1").await;
        reconciler.process("").await;
        assert_eq!(handler.applies.load(Ordering::SeqCst), 0);
        assert!(reconciler.queue().is_empty());
    }

    #[tokio::test]
    async fn test_run_converges_and_retries() {
        let handler = FakeHandler::default();
        handler.failing_applies.store(2, Ordering::SeqCst);
        let (store, handler, reconciler) = setup(handler);
        create(&store, "pvc-1", "node-a").await;
        create(&store, "pvc-2", "node-b").await;

        let cancel = CancellationToken::new();
        let running = tokio::spawn(reconciler.clone().run(cancel.clone()));

        let ready = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if get(&store, "pvc-1").await.is_some_and(|v| v.state() == RecordState::Ready) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(ready.is_ok());
        assert_eq!(handler.applies.load(Ordering::SeqCst), 3);
        assert_eq!(get(&store, "pvc-2").await.unwrap().state(), RecordState::Pending);

        store.delete("pvc-1").await.unwrap();
        let gone = tokio::time::timeout(Duration::from_secs(5), async {
            while get(&store, "pvc-1").await.is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(gone.is_ok());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
    }
}
