//! Facade the UI talks to: cached reads, queued writes, drain on recovery.

use crate::bus::{Notification, NotificationBus};
use crate::config::SyncSettings;
use crate::connectivity::{ConnectivityMonitor, HealthProbe};
use crate::errors::AppResult;
use crate::models::{ChangeStatus, Collection, ConnectivityState, Entity, Operation, PendingChange, RetryPolicy};
use crate::queue::MutationQueue;
use crate::remote::{RemoteBackend, RemoteError, RemoteResult};
use crate::retry::RetryExecutor;
use crate::snapshot::{RecentPinValues, SnapshotCache};
use crate::store::{MemoryBackend, PersistentStore, SqliteBackend, StorageBackend};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSource {
    Live,
    Cache,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome<T> {
    pub items: Vec<T>,
    pub source: DataSource,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Applied(serde_json::Value),
    /// Saved locally; replayed by the next drain pass.
    Queued { change_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    /// A transient failure ended the pass early; later entries were left untouched.
    pub stopped: bool,
    /// Another pass was already running.
    pub skipped: bool,
    pub pruned: usize,
    pub remaining: usize,
}

#[derive(Clone)]
pub struct DataLayer {
    settings: SyncSettings,
    bus: NotificationBus,
    store: PersistentStore,
    remote: Arc<dyn RemoteBackend>,
    monitor: ConnectivityMonitor,
    retry: RetryExecutor,
    snapshots: SnapshotCache,
    queue: MutationQueue,
    recent_pins: RecentPinValues,
    drain_lock: Arc<tokio::sync::Mutex<()>>,
    drain_requested: Arc<AtomicBool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for DataLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLayer")
            .field("state", &self.monitor.state())
            .field("store", &self.store)
            .finish()
    }
}

impl DataLayer {
    pub fn new(
        settings: SyncSettings,
        storage: Arc<dyn StorageBackend>,
        remote: Arc<dyn RemoteBackend>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let bus = NotificationBus::new();
        let store = PersistentStore::new(storage, settings.key_prefix.clone(), settings.quota_eviction_target);
        let monitor = ConnectivityMonitor::new(probe, bus.clone(), &settings);
        let retry = RetryExecutor::new(bus.clone(), settings.remote_timeout());
        let snapshots = SnapshotCache::new(store.clone(), settings.freshness());
        let queue = MutationQueue::new(store.clone(), bus.clone(), settings.queue_capacity);
        let recent_pins = RecentPinValues::new(store.clone(), settings.recent_pin_values_cap);
        Self {
            settings,
            bus,
            store,
            remote,
            monitor,
            retry,
            snapshots,
            queue,
            recent_pins,
            drain_lock: Arc::new(tokio::sync::Mutex::new(())),
            drain_requested: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn in_memory(settings: SyncSettings, remote: Arc<dyn RemoteBackend>, probe: Arc<dyn HealthProbe>) -> Self {
        let storage = Arc::new(MemoryBackend::new(settings.storage_quota_bytes));
        Self::new(settings, storage, remote, probe)
    }

    /// Durable layer backed by a SQLite file at `db_path`.
    pub fn open(
        settings: SyncSettings,
        db_path: &Path,
        remote: Arc<dyn RemoteBackend>,
        probe: Arc<dyn HealthProbe>,
    ) -> AppResult<Self> {
        let storage = Arc::new(SqliteBackend::new(db_path, settings.storage_quota_bytes)?);
        Ok(Self::new(settings, storage, remote, probe))
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn snapshots(&self) -> &SnapshotCache {
        &self.snapshots
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn recent_pin_values(&self) -> &RecentPinValues {
        &self.recent_pins
    }

    pub fn state(&self) -> ConnectivityState {
        self.monitor.state()
    }

    fn from_cache<T: DeserializeOwned>(&self, collection: Collection) -> ReadOutcome<T> {
        ReadOutcome {
            items: self.snapshots.get_cached(collection),
            source: DataSource::Cache,
            stale: !self.snapshots.is_fresh(),
        }
    }

    /// Cached snapshot for an optimistic first paint, before any live fetch.
    pub fn cached_first_paint<T: DeserializeOwned>(&self, collection: Collection) -> ReadOutcome<T> {
        self.from_cache(collection)
    }

    async fn fetch_collection(&self, collection: Collection) -> AppResult<Option<Vec<serde_json::Value>>> {
        let remote = self.remote.clone();
        let label = format!("read {}", collection.as_str());
        let fetched = self
            .retry
            .execute(&label, self.settings.retry, move || {
                let remote = remote.clone();
                async move { remote.read_collection(collection).await }
            })
            .await?;
        Ok(fetched)
    }

    /// Live fetch when online, cached snapshot otherwise or when the fetch could not complete.
    ///
    /// The snapshot is replaced only once every record decodes as `T`.
    pub async fn read<T: DeserializeOwned>(&self, collection: Collection) -> AppResult<ReadOutcome<T>> {
        if !self.state().is_online() {
            return Ok(self.from_cache(collection));
        }

        match self.fetch_collection(collection).await? {
            Some(records) => {
                let items = records.iter().map(|record| T::deserialize(record)).collect::<Result<Vec<T>, _>>()?;
                self.snapshots.store(collection, &records);
                Ok(ReadOutcome {
                    items,
                    source: DataSource::Live,
                    stale: false,
                })
            }
            None => {
                tracing::info!(collection = collection.as_str(), "live read unavailable, serving cache");
                Ok(self.from_cache(collection))
            }
        }
    }

    async fn send(
        &self,
        policy: RetryPolicy,
        operation: Operation,
        entity: Entity,
        payload: &serde_json::Value,
    ) -> RemoteResult<Option<serde_json::Value>> {
        let remote = self.remote.clone();
        let payload = payload.clone();
        let label = format!("{} {}", operation.as_str(), entity.as_str());
        let result = self
            .retry
            .execute(&label, policy, move || {
                let remote = remote.clone();
                let payload = payload.clone();
                async move { remote.write_record(operation, entity, payload).await }
            })
            .await?;
        Ok(result)
    }

    fn remember_pin_value(&self, operation: Operation, entity: Entity, payload: &serde_json::Value) {
        if entity != Entity::Pin || operation == Operation::Delete {
            return;
        }
        let (Some(pin_id), Some(value)) = (payload.get("id").and_then(|id| id.as_str()), payload.get("value")) else {
            return;
        };
        self.recent_pins.record(pin_id, value.clone());
    }

    fn has_backlog(&self) -> bool {
        !self.queue.list_by_status(Some(ChangeStatus::Pending)).is_empty()
    }

    /// Applies a write live when possible, otherwise queues it.
    ///
    /// While older changes are still pending the write is queued behind them
    /// and a drain pass runs, so replay order matches the order of intent.
    /// Fatal rejections are returned unchanged and never queued.
    pub async fn write(
        &self,
        operation: Operation,
        entity: Entity,
        payload: serde_json::Value,
    ) -> Result<WriteOutcome, RemoteError> {
        if !self.state().is_online() {
            let queued = self.queue.enqueue(operation, entity, payload);
            return Ok(WriteOutcome::Queued {
                change_id: queued.change.id,
            });
        }

        if self.has_backlog() {
            let queued = self.queue.enqueue(operation, entity, payload);
            self.drain().await;
            return Ok(WriteOutcome::Queued {
                change_id: queued.change.id,
            });
        }

        match self.send(self.settings.retry, operation, entity, &payload).await? {
            Some(value) => {
                self.remember_pin_value(operation, entity, &payload);
                Ok(WriteOutcome::Applied(value))
            }
            None => {
                let queued = self.queue.enqueue(operation, entity, payload);
                Ok(WriteOutcome::Queued {
                    change_id: queued.change.id,
                })
            }
        }
    }

    /// Single attempt, never queued. `Ok(None)` means ask the user to retry.
    pub async fn write_strict(
        &self,
        operation: Operation,
        entity: Entity,
        payload: serde_json::Value,
    ) -> RemoteResult<Option<serde_json::Value>> {
        if !self.state().is_online() {
            tracing::info!(operation = operation.as_str(), entity = entity.as_str(), "strict write refused while not online");
            return Ok(None);
        }
        let policy = RetryPolicy::fail_fast();
        let result = self.send(policy, operation, entity, &payload).await?;
        if result.is_some() {
            self.remember_pin_value(operation, entity, &payload);
        }
        Ok(result)
    }

    /// Replays pending changes in insertion order. One pass at a time.
    ///
    /// A call that finds a pass running leaves a rerun request behind, so
    /// changes queued mid-pass are replayed before the running pass returns.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let mut attempted: HashSet<String> = HashSet::new();
        let mut ran = false;
        self.drain_requested.store(true, Ordering::SeqCst);

        loop {
            let Ok(pass) = self.drain_lock.try_lock() else {
                if !ran {
                    tracing::debug!("drain pass already running, rerun requested");
                    report.skipped = true;
                    return report;
                }
                break;
            };
            ran = true;
            while self.drain_requested.swap(false, Ordering::SeqCst) {
                self.drain_pending(&mut report, &mut attempted).await;
                if report.stopped {
                    break;
                }
            }
            if !report.stopped {
                report.pruned += self.queue.prune();
            }
            drop(pass);
            if report.stopped || !self.drain_requested.load(Ordering::SeqCst) {
                break;
            }
        }

        report.remaining = self.queue.list_by_status(Some(ChangeStatus::Pending)).len();
        tracing::info!(
            attempted = report.attempted,
            completed = report.completed,
            failed = report.failed,
            stopped = report.stopped,
            remaining = report.remaining,
            "drain pass finished"
        );
        report
    }

    async fn drain_pending(&self, report: &mut DrainReport, attempted: &mut HashSet<String>) {
        let pending: Vec<PendingChange> = self.queue.list_by_status(Some(ChangeStatus::Pending));
        for change in pending {
            if !attempted.insert(change.id.clone()) {
                continue;
            }
            if !self.state().is_online() {
                report.stopped = true;
                return;
            }
            report.attempted += 1;
            match self.send(self.settings.retry, change.operation, change.entity, &change.payload).await {
                Ok(Some(_)) => {
                    self.queue.mark_completed(&change.id);
                    self.remember_pin_value(change.operation, change.entity, &change.payload);
                    report.completed += 1;
                }
                Ok(None) => {
                    tracing::warn!(change_id = %change.id, "drain stopped on transient failure");
                    report.stopped = true;
                    return;
                }
                Err(error) => {
                    tracing::warn!(change_id = %change.id, error = %error, "queued change rejected");
                    self.queue.mark_error(&change.id, error.message.clone());
                    report.failed += 1;
                }
            }
        }
    }

    /// Realtime change for `collection`: re-fetch that collection alone.
    ///
    /// Returns the number of records now cached. The snapshot is replaced
    /// only by a completed re-fetch; while not online, or when the re-fetch
    /// runs out of attempts, the last known-good snapshot stays in place.
    pub async fn on_remote_change(&self, collection: Collection) -> AppResult<usize> {
        if !self.state().is_online() {
            tracing::debug!(collection = collection.as_str(), "remote change deferred until online");
            return Ok(self.snapshots.get_cached::<serde_json::Value>(collection).len());
        }
        match self.fetch_collection(collection).await? {
            Some(records) => {
                self.snapshots.store(collection, &records);
                Ok(records.len())
            }
            None => {
                tracing::info!(collection = collection.as_str(), "remote change re-fetch unavailable, keeping snapshot");
                Ok(self.snapshots.get_cached::<serde_json::Value>(collection).len())
            }
        }
    }

    /// Clears snapshots, last-sync time, recent pin values and the queue.
    pub fn reset(&self) {
        self.snapshots.clear();
        self.recent_pins.clear();
        self.queue.clear();
        tracing::info!("local data reset");
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts the monitor and the listener that drains on every recovery.
    pub fn start(&self) {
        let mut tasks = self.lock_tasks();
        if !tasks.is_empty() {
            return;
        }
        self.monitor.start();

        let layer = self.clone();
        let mut receiver = self.bus.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if envelope.notification == Notification::ConnectivityChanged(ConnectivityState::Online) {
                            layer.drain().await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "recovery listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    pub fn stop(&self) {
        for handle in self.lock_tasks().drain(..) {
            handle.abort();
        }
        self.monitor.stop();
    }
}
