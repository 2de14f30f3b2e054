use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::cache::{LocalCache, Payload};
use super::key::{Priority, SyncableKey};
use super::loader::{AvailabilityLoader, LoadError, LoaderConfig};
use super::payload::{PayloadDir, PayloadError};
use super::status::{StatusPublisher, SyncEvent, SyncProgress, SyncStatus};
use super::store::{RemoteError, RemoteStore};
use super::tracker::{Batch, ChangeTracker, PendingEntry};

pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Upper bound on keys per batch and on concurrent uploads.
    pub batch_size: usize,
    /// Upload attempts for immediate keys. Deferred keys get one per cycle.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub sync_interval: Duration,
    pub loader: LoaderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(30), false),
            sync_interval: Duration::from_secs(30),
            loader: LoaderConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote unavailable for {key} after {attempts} attempt(s): {source}")]
    TransientRemote {
        key: SyncableKey,
        attempts: u32,
        #[source]
        source: RemoteError,
    },
    #[error("remote rejected {key}: {source}")]
    RejectedRemote {
        key: SyncableKey,
        #[source]
        source: RemoteError,
    },
    #[error("unusable local payload for {key}: {source}")]
    PermanentPayload {
        key: SyncableKey,
        #[source]
        source: PayloadError,
    },
}

impl SyncError {
    pub fn key(&self) -> &SyncableKey {
        match self {
            SyncError::TransientRemote { key, .. }
            | SyncError::RejectedRemote { key, .. }
            | SyncError::PermanentPayload { key, .. } => key,
        }
    }

    /// Permanent failures leave the PendingSet; everything else is requeued.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SyncError::PermanentPayload { .. })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("payload root is unusable: {0}")]
    Fatal(#[source] PayloadError),
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),
}

#[derive(Debug)]
pub struct FailedKey {
    pub priority: Priority,
    pub error: SyncError,
}

impl FailedKey {
    pub fn key(&self) -> &SyncableKey {
        self.error.key()
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<SyncableKey>,
    pub failed: Vec<FailedKey>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_keys(&self) -> Vec<SyncableKey> {
        self.failed.iter().map(|failed| failed.key().clone()).collect()
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }
}

/// Scheduler started by [`SyncEngine::start`].
pub struct EngineHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the trigger loop. A batch already running is finished first.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "sync scheduler ended abnormally");
        }
    }
}

/// Hands a batch's unsettled keys back to the tracker when the batch is
/// dropped, including when its future is cancelled mid-flight.
struct InFlightBatch<'a> {
    tracker: &'a std::sync::Mutex<ChangeTracker>,
    keys: Vec<SyncableKey>,
}

impl Drop for InFlightBatch<'_> {
    fn drop(&mut self) {
        lock_tracker(self.tracker).release(self.keys.drain(..));
    }
}

fn lock_tracker(tracker: &std::sync::Mutex<ChangeTracker>) -> MutexGuard<'_, ChangeTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    payloads: PayloadDir,
    cache: Arc<LocalCache>,
    loader: AvailabilityLoader,
    tracker: std::sync::Mutex<ChangeTracker>,
    batch_lock: Mutex<()>,
    immediate: Notify,
    status: StatusPublisher,
    config: EngineConfig,
}

impl SyncEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, payloads: PayloadDir, config: EngineConfig) -> Self {
        let cache = Arc::new(LocalCache::new());
        let loader =
            AvailabilityLoader::new(remote.clone(), payloads.clone(), cache.clone(), config.loader);
        Self {
            remote,
            payloads,
            cache,
            loader,
            tracker: std::sync::Mutex::new(ChangeTracker::new(config.batch_size)),
            batch_lock: Mutex::new(()),
            immediate: Notify::new(),
            status: StatusPublisher::default(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn payloads(&self) -> &PayloadDir {
        &self.payloads
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    fn tracker(&self) -> MutexGuard<'_, ChangeTracker> {
        lock_tracker(&self.tracker)
    }

    /// Returns `true` when the key asks for the immediate trigger.
    pub async fn mark_changed(&self, key: SyncableKey, priority: Priority) -> bool {
        let changed = self.tracker().mark_changed(key.clone(), priority);
        debug!(key = %key, priority = priority.as_str(), changed, "key marked");
        if priority != Priority::Immediate {
            return false;
        }
        if self.tracker().in_flight_len() < self.config.batch_size.max(1) {
            self.immediate.notify_one();
        }
        true
    }

    /// Local-first write: file, then cache, then PendingSet.
    pub async fn save(
        &self,
        key: SyncableKey,
        payload: impl Into<Payload>,
        priority: Priority,
    ) -> Result<bool, EngineError> {
        let payload = payload.into();
        {
            let _guard = self.cache.lock_key(&key).await;
            self.payloads.write(&key, &payload).await?;
            self.cache.put(key.clone(), payload).await;
        }
        Ok(self.mark_changed(key, priority).await)
    }

    pub async fn delete(&self, key: &SyncableKey) -> Result<(), EngineError> {
        {
            let _guard = self.cache.lock_key(key).await;
            self.payloads.remove(key).await?;
            self.cache.evict(key).await;
        }
        self.tracker().forget(key);
        Ok(())
    }

    pub async fn evict(&self, key: &SyncableKey) {
        let _guard = self.cache.lock_key(key).await;
        if self.cache.evict(key).await.is_some() {
            debug!(key = %key, "cache entry evicted");
        }
    }

    /// The key's file was changed outside the engine. Drops the cached copy
    /// and marks the key deferred, unless the remote store itself just
    /// wrote the file. Returns `true` when the key was marked.
    pub async fn local_change(&self, key: SyncableKey) -> bool {
        self.evict(&key).await;
        if self.remote.recently_materialized(&key).await {
            debug!(key = %key, "materialized payload not re-uploaded");
            return false;
        }
        self.mark_changed(key, Priority::Deferred).await;
        true
    }

    pub async fn load(&self, key: &SyncableKey) -> Result<Option<Payload>, LoadError> {
        self.loader.load(key).await
    }

    pub fn current_status(&self) -> SyncStatus {
        self.status.current()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.status.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.watch()
    }

    /// Keys not yet confirmed synced, including those in a running batch.
    pub async fn pending_len(&self) -> usize {
        self.tracker().len()
    }

    pub async fn pending_snapshot(&self) -> Vec<PendingEntry> {
        self.tracker().snapshot()
    }

    pub async fn restore_pending(&self, entries: Vec<PendingEntry>) {
        let count = entries.len();
        self.tracker().requeue(entries);
        if count > 0 {
            info!(count, "pending keys restored");
        }
    }

    /// Syncs a batch taken by the caller. Waits for any running batch.
    pub async fn sync_batch(&self, batch: Batch) -> BatchReport {
        let _guard = self.batch_lock.lock().await;
        self.run_batch(batch).await
    }

    /// Takes the next batch from the PendingSet and syncs it.
    pub async fn sync_next(&self) -> Option<BatchReport> {
        let _guard = self.batch_lock.lock().await;
        let batch = self.tracker().next_batch()?;
        Some(self.run_batch(batch).await)
    }

    /// One pass over everything pending when called. Every key ends synced,
    /// pending again or reported as permanently failed; failures are not
    /// retried within the pass. Cancelling the future leaves unsynced keys
    /// pending.
    pub async fn force_sync_all(&self) -> Result<BatchReport, EngineError> {
        info!("forced sync requested");
        self.drain_all().await
    }

    async fn drain_all(&self) -> Result<BatchReport, EngineError> {
        if let Err(err) = self.payloads.ensure_accessible().await {
            error!(error = %err, "payload root unavailable");
            self.status.set_status(SyncStatus::Error {
                message: err.to_string(),
            });
            self.status.emit(SyncEvent::SyncFailed {
                reason: err.to_string(),
            });
            return Err(EngineError::Fatal(err));
        }

        let _guard = self.batch_lock.lock().await;
        let mut remaining: HashSet<SyncableKey> = self
            .tracker()
            .snapshot()
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        let mut report = BatchReport::default();
        loop {
            let next = self.tracker().take_batch(|key| remaining.contains(key));
            let Some(batch) = next else {
                break;
            };
            for key in batch.keys() {
                remaining.remove(key);
            }
            report.merge(self.run_batch(batch).await);
        }
        Ok(report)
    }

    /// Starts the immediate and periodic triggers.
    pub fn start(self: &Arc<Self>) -> EngineHandle {
        let token = CancellationToken::new();
        let engine = self.clone();
        let cancelled = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.sync_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            info!(
                interval_secs = engine.config.sync_interval.as_secs(),
                batch_size = engine.config.batch_size,
                "sync scheduler started"
            );
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = engine.immediate.notified() => engine.dispatch_immediate().await,
                    _ = ticker.tick() => {
                        if let Err(err) = engine.drain_all().await {
                            error!(error = %err, "periodic sync failed");
                        }
                    }
                }
            }
            info!("sync scheduler stopped");
        });
        EngineHandle { token, task }
    }

    async fn dispatch_immediate(&self) {
        while self.sync_next().await.is_some() {
            if !self.tracker().has_immediate() {
                break;
            }
        }
    }

    async fn run_batch(&self, batch: Batch) -> BatchReport {
        let total = batch.len();
        if total == 0 {
            return BatchReport::default();
        }
        info!(batch_size = total, "batch start");
        let _in_flight = InFlightBatch {
            tracker: &self.tracker,
            keys: batch.keys().cloned().collect(),
        };
        self.status.set_status(SyncStatus::Syncing {
            progress: SyncProgress {
                completed: 0,
                total,
            },
        });
        self.status.emit(SyncEvent::SyncStarted { keys: total });

        let completed = AtomicUsize::new(0);
        let units = batch.entries().iter().map(|entry| {
            let completed = &completed;
            async move {
                let result = self.sync_key(entry).await;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                self.status.set_status(SyncStatus::Syncing {
                    progress: SyncProgress {
                        completed: done,
                        total,
                    },
                });
                (entry, result)
            }
        });
        let results = join_all(units).await;

        let mut report = BatchReport::default();
        {
            let mut tracker = self.tracker();
            for (entry, result) in results {
                match result {
                    Ok(()) => {
                        tracker.settle(&entry.key);
                        report.succeeded.push(entry.key.clone());
                    }
                    Err(err) => {
                        if err.is_permanent() {
                            warn!(key = %entry.key, error = %err, "key dropped");
                            tracker.settle(&entry.key);
                        } else {
                            warn!(key = %entry.key, error = %err, "key requeued");
                            tracker.requeue([entry.clone()]);
                        }
                        report.failed.push(FailedKey {
                            priority: entry.priority,
                            error: err,
                        });
                    }
                }
            }
        }
        self.publish_outcome(&report);
        report
    }

    fn publish_outcome(&self, report: &BatchReport) {
        let synced = report.succeeded.len();
        if report.failed.is_empty() {
            info!(synced, "batch done");
            self.status.set_status(SyncStatus::Idle);
            self.status.emit(SyncEvent::SyncCompleted { synced });
        } else if synced > 0 {
            let failed = report.failed_keys();
            warn!(synced, failed = failed.len(), "batch partially failed");
            self.status.set_status(SyncStatus::PartialFailure {
                failed: failed.clone(),
            });
            self.status.emit(SyncEvent::SyncPartialFailure { failed });
        } else {
            let reason = report
                .failed
                .first()
                .map(|failed| failed.error.to_string())
                .unwrap_or_default();
            error!(failed = report.failed.len(), reason = %reason, "batch failed");
            self.status.set_status(SyncStatus::Error {
                message: reason.clone(),
            });
            self.status.emit(SyncEvent::SyncFailed { reason });
        }
    }

    async fn sync_key(&self, entry: &PendingEntry) -> Result<(), SyncError> {
        let key = &entry.key;
        let bytes = self
            .payloads
            .read(key)
            .await
            .map_err(|source| SyncError::PermanentPayload {
                key: key.clone(),
                source,
            })?;

        let max_attempts = if entry.priority.is_retry_eligible() {
            self.config.max_attempts.max(1)
        } else {
            1
        };
        let mut attempt = 1;
        loop {
            match self.remote.upload(key, &bytes).await {
                Ok(()) => {
                    debug!(key = %key, attempt, "key synced");
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.retry_delay(&err, attempt);
                    debug!(
                        key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "upload retry scheduled"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    return Err(SyncError::TransientRemote {
                        key: key.clone(),
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    return Err(SyncError::RejectedRemote {
                        key: key.clone(),
                        source: err,
                    });
                }
            }
        }
    }
}

impl SyncEngine {
    /// A server `Retry-After` wins over the computed backoff but never
    /// exceeds the backoff cap, since the batch lock is held meanwhile.
    fn retry_delay(&self, err: &RemoteError, attempt: u32) -> Duration {
        match err.retry_after_secs() {
            Some(secs) => Duration::from_secs(secs).min(self.config.backoff.max()),
            None => self.config.backoff.delay(attempt),
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
