//! Core sync engine that reconciles the local and remote replicas.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use draftsync_common::{validate_key, Error, Record, Result};
use draftsync_storage::{ConnectivityMonitor, LocalStore, RemoteStore, DEFAULT_NAMESPACE};

use crate::conflict::{
    compare, ConflictEntry, ConflictResolver, ConflictStrategy, Merger, ResolutionOutcome, Verdict,
};
use crate::queue::{MutationQueue, QueuedMutation};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::scheduler::{SyncMode, SyncScheduler};
use crate::state::{PassTally, SyncReport, SyncState, SyncStatus, CANCELLED_MESSAGE};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Namespace separating engine-managed records in the local store.
    pub namespace: String,
    /// Retry policy for remote calls.
    pub retry: RetryConfig,
    /// When the scheduler starts passes.
    pub sync_mode: SyncMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            retry: RetryConfig::disabled(),
            sync_mode: SyncMode::OnReconnect,
        }
    }
}

/// Where an application write ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored locally and acknowledged by the remote.
    Pushed,
    /// Stored locally and queued for the next pass.
    Queued,
}

/// Main sync engine coordinating both replicas.
///
/// Application writes land in the local store first and are pushed right
/// away when possible. Anything that could not be pushed waits in the
/// [`MutationQueue`] until [`SyncEngine::reconcile`] replays it.
pub struct SyncEngine<L: LocalStore + ?Sized, R: RemoteStore + ?Sized> {
    local: Arc<L>,
    remote: Arc<R>,
    queue: Arc<MutationQueue>,
    connectivity: ConnectivityMonitor,
    retry_executor: RetryExecutor,
    conflict_resolver: ConflictResolver,
    /// Written for the duration of a pass or a resolution; read while an
    /// application write is pushed.
    pass_lock: RwLock<()>,
    cancel: CancellationToken,
    scheduler: OnceLock<SyncScheduler>,
    state: watch::Sender<SyncState>,
    config: SyncConfig,
}

impl<L: LocalStore + ?Sized, R: RemoteStore + ?Sized> SyncEngine<L, R> {
    /// Create a new sync engine.
    pub fn new(
        local: Arc<L>,
        remote: Arc<R>,
        queue: MutationQueue,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Self {
        info!(
            "Sync engine created for namespace {} against {} remote",
            config.namespace,
            remote.name()
        );

        Self {
            local,
            remote,
            queue: Arc::new(queue),
            connectivity,
            retry_executor: RetryExecutor::new(config.retry.clone()),
            conflict_resolver: ConflictResolver::default(),
            pass_lock: RwLock::new(()),
            cancel: CancellationToken::new(),
            scheduler: OnceLock::new(),
            state: watch::Sender::new(SyncState::new()),
            config,
        }
    }

    /// Use `merger` for [`ConflictStrategy::Merge`].
    pub fn with_merger(mut self, merger: Arc<dyn Merger>) -> Self {
        self.conflict_resolver = ConflictResolver::new(merger);
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Connectivity monitor shared with the remote client.
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Read a live record. Tombstones read as absent.
    pub fn get(&self, key: &str) -> Result<Option<Record>> {
        Ok(self.local.get(key)?.filter(|record| !record.deleted))
    }

    /// Live records whose key starts with `prefix`.
    pub fn list(&self, prefix: &str) -> Result<BTreeMap<String, Record>> {
        let mut records = self.local.list_all(prefix)?;
        records.retain(|_, record| !record.deleted);
        Ok(records)
    }

    /// Write `value` under `key` and try to push it.
    ///
    /// The local write always happens first; only a local storage failure is
    /// returned as an error. While a pass runs the push waits for it. A write
    /// that has to be queued asks a running scheduler for a follow-up pass.
    pub async fn put(&self, key: &str, value: serde_json::Value) -> Result<WriteOutcome> {
        let record = self.local.put(key, value)?;
        self.push_or_enqueue(record).await
    }

    /// Delete `key` by writing a tombstone, then try to push it.
    pub async fn delete(&self, key: &str) -> Result<WriteOutcome> {
        let record = self.local.delete(key)?;
        self.push_or_enqueue(record).await
    }

    async fn push_or_enqueue(&self, record: Record) -> Result<WriteOutcome> {
        if !self.connectivity.is_online() {
            debug!("Offline, queueing {}", record.key);
            return self.enqueue(&record).await;
        }

        // A running pass may push an older snapshot of this key; wait it out.
        let pushed = {
            let _pass = self.pass_lock.read().await;
            self.push(&record).await
        };

        match pushed {
            Ok(()) => Ok(WriteOutcome::Pushed),
            Err(err) => {
                if matches!(err, Error::Auth(_)) {
                    error!("Push of {} rejected: {}", record.key, err);
                } else {
                    warn!("Push of {} failed, queueing: {}", record.key, err);
                }
                let outcome = self.enqueue(&record).await?;
                self.request_follow_up();
                Ok(outcome)
            }
        }
    }

    /// Ask a running scheduler for a pass to replay what was just queued.
    fn request_follow_up(&self) {
        if let Some(scheduler) = self.scheduler.get() {
            scheduler.request_follow_up();
        }
    }

    async fn enqueue(&self, record: &Record) -> Result<WriteOutcome> {
        self.queue
            .enqueue(QueuedMutation::from_record(record))
            .await?;
        Ok(WriteOutcome::Queued)
    }

    async fn push(&self, record: &Record) -> Result<()> {
        self.retry_executor
            .execute(|| self.remote.put(record))
            .await
    }

    /// Mutations still waiting for the remote, oldest first.
    pub async fn pending_mutations(&self) -> Vec<QueuedMutation> {
        self.queue.snapshot().await
    }

    /// Current activity.
    pub fn status(&self) -> SyncStatus {
        self.state.borrow().status
    }

    /// Report of the most recent pass.
    pub fn last_report(&self) -> Option<SyncReport> {
        self.state.borrow().last_report.clone()
    }

    /// Observe status changes and finished passes.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Token that aborts the current pass and every later one.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Abort the in-flight pass between items and stop the scheduler.
    pub fn cancel(&self) {
        info!("Sync engine cancelled");
        self.cancel.cancel();
    }

    /// Run one reconciliation pass.
    ///
    /// Never fails: every problem is described by the returned report. If a
    /// pass is already running, this waits for it and then runs its own.
    pub async fn reconcile(&self) -> SyncReport {
        let _pass = self.pass_lock.write().await;

        if !self.connectivity.is_online() {
            debug!("Skipping sync pass while offline");
            let report = SyncReport::offline();
            self.finish_pass(&report);
            return report;
        }

        info!("Starting sync pass");
        let start = Instant::now();
        self.state.send_modify(|state| state.status = SyncStatus::Syncing);

        let mut tally = PassTally::default();
        let abort = self.run_pass(&mut tally).await;
        let report = tally.finish(abort, start.elapsed());

        if report.success {
            info!(
                "Sync pass completed: {} replayed, {} pushed, {} pulled, {} conflicts in {:?}",
                report.replayed,
                report.pushed,
                report.pulled,
                report.conflicts.len(),
                report.duration
            );
        } else {
            warn!(
                "Sync pass finished with errors: {}",
                report.error_message.as_deref().unwrap_or_default()
            );
        }

        self.finish_pass(&report);
        report
    }

    fn finish_pass(&self, report: &SyncReport) {
        self.state.send_modify(|state| {
            state.status = SyncStatus::Idle;
            state.last_report = Some(report.clone());
            state.last_sync = Some(chrono::Utc::now());
        });
    }

    /// Replay then reconcile. Returns the reason the pass was aborted, if any.
    async fn run_pass(&self, tally: &mut PassTally) -> Option<String> {
        if let Some(abort) = self.replay_queue(tally).await {
            return Some(abort);
        }
        self.reconcile_keys(tally).await
    }

    /// Push every queued mutation, stopping at the first failure.
    ///
    /// A mutation whose key already has a remote copy at least as new is
    /// dropped; the key is then settled by comparison like any other.
    async fn replay_queue(&self, tally: &mut PassTally) -> Option<String> {
        let drained = match self.queue.drain().await {
            Ok(drained) => drained,
            Err(e) => return Some(format!("Failed to drain mutation queue: {}", e)),
        };
        if drained.is_empty() {
            return None;
        }
        debug!("Replaying {} queued mutations", drained.len());

        let mut remaining = drained.into_iter();
        while let Some(mutation) = remaining.next() {
            if self.cancel.is_cancelled() {
                self.requeue_all(std::iter::once(mutation).chain(remaining))
                    .await;
                return Some(CANCELLED_MESSAGE.to_string());
            }

            match self.replay(&mutation).await {
                Ok(pushed) => {
                    if let Err(e) = self.queue.confirm(&mutation.id).await {
                        warn!("Failed to confirm mutation for {}: {}", mutation.key, e);
                    }
                    if pushed {
                        tally.replayed += 1;
                    }
                }
                Err(err) => {
                    let message = format!("Replay of {} failed: {}", mutation.key, err);
                    self.requeue_all(std::iter::once(mutation).chain(remaining))
                        .await;
                    if matches!(err, Error::Auth(_)) {
                        error!("{}", message);
                        return Some(message);
                    }
                    warn!("{}", message);
                    tally.record_failure(message);
                    break;
                }
            }
        }

        None
    }

    /// Push `mutation` unless the remote is not older. Returns whether it was pushed.
    async fn replay(&self, mutation: &QueuedMutation) -> Result<bool> {
        let current = self
            .retry_executor
            .execute(|| self.remote.get(&mutation.key))
            .await?;
        if let Some(current) = current {
            if current.last_modified >= mutation.last_modified {
                debug!(
                    "Remote copy of {} @ {} is not older than queued write @ {}, skipping",
                    mutation.key, current.last_modified, mutation.last_modified
                );
                return Ok(false);
            }
        }

        self.push(&mutation.to_record()).await?;
        Ok(true)
    }

    async fn requeue_all(&self, mutations: impl Iterator<Item = QueuedMutation>) {
        for mutation in mutations {
            let key = mutation.key.clone();
            if let Err(e) = self.queue.requeue(mutation).await {
                error!("Failed to requeue mutation for {}: {}", key, e);
            }
        }
    }

    /// Compare both key sets and converge every key.
    async fn reconcile_keys(&self, tally: &mut PassTally) -> Option<String> {
        let (remote_records, local_records) = tokio::join!(
            self.retry_executor.execute(|| self.remote.list_all()),
            async { self.local.list_all("") }
        );
        let remote_records = match remote_records {
            Ok(records) => records,
            Err(e) => return Some(format!("Failed to list remote records: {}", e)),
        };
        let local_records = match local_records {
            Ok(records) => records,
            Err(e) => return Some(format!("Failed to list local records: {}", e)),
        };

        let keys: BTreeSet<&String> = local_records.keys().chain(remote_records.keys()).collect();
        debug!(
            "Reconciling {} keys ({} local, {} remote)",
            keys.len(),
            local_records.len(),
            remote_records.len()
        );

        for key in keys {
            if self.cancel.is_cancelled() {
                return Some(CANCELLED_MESSAGE.to_string());
            }

            let verdict = match (local_records.get(key), remote_records.get(key)) {
                (Some(_), None) => Verdict::Push,
                (None, Some(_)) => Verdict::Pull,
                (Some(local), Some(remote)) => compare(local, remote),
                (None, None) => continue,
            };

            match verdict {
                Verdict::InSync => {}
                Verdict::Push => {
                    if let Some(record) = local_records.get(key) {
                        if let Some(abort) = self.push_during_pass(record, tally).await {
                            return Some(abort);
                        }
                    }
                }
                Verdict::Pull => {
                    if let Some(record) = remote_records.get(key) {
                        self.pull(record, tally);
                    }
                }
                Verdict::Conflict => {
                    if let (Some(local), Some(remote)) =
                        (local_records.get(key), remote_records.get(key))
                    {
                        info!("Conflict detected for {}", key);
                        tally.conflicts.push(ConflictEntry {
                            key: key.clone(),
                            local_value: local.value.clone(),
                            remote_value: remote.value.clone(),
                        });
                    }
                }
            }
        }

        None
    }

    async fn push_during_pass(&self, record: &Record, tally: &mut PassTally) -> Option<String> {
        match self.push(record).await {
            Ok(()) => {
                debug!("Pushed {}", record.key);
                tally.pushed += 1;
                None
            }
            Err(err) => {
                let message = format!("Push of {} failed: {}", record.key, err);
                if let Err(e) = self.enqueue(record).await {
                    error!("Failed to queue {}: {}", record.key, e);
                }
                if matches!(err, Error::Auth(_)) {
                    error!("{}", message);
                    return Some(message);
                }
                warn!("{}", message);
                tally.record_failure(message);
                None
            }
        }
    }

    fn pull(&self, record: &Record, tally: &mut PassTally) {
        match self.local.apply_remote(record) {
            Ok(true) => {
                debug!("Pulled {}", record.key);
                tally.pulled += 1;
            }
            // A newer local write landed while the pass was running.
            Ok(false) => debug!("Kept newer local copy of {}", record.key),
            Err(e) => {
                let message = format!("Pull of {} failed: {}", record.key, e);
                warn!("{}", message);
                tally.record_failure(message);
            }
        }
    }

    /// Resolve a conflict on `key` with `strategy`.
    ///
    /// Waits for any running pass so the two never interleave.
    ///
    /// # Errors
    /// - `InvalidInput` if the key is empty
    /// - `NotFound` if neither replica has the key
    /// - `Resolution` if a replica could not be read or written
    pub async fn resolve(&self, key: &str, strategy: ConflictStrategy) -> Result<ResolutionOutcome> {
        validate_key(key)?;
        let _pass = self.pass_lock.write().await;

        self.conflict_resolver
            .resolve(
                key,
                strategy,
                &*self.local,
                &*self.remote,
                &self.queue,
                &self.retry_executor,
            )
            .await
    }
}

impl<L, R> SyncEngine<L, R>
where
    L: LocalStore + ?Sized + 'static,
    R: RemoteStore + ?Sized + 'static,
{
    /// Start the background scheduler for the configured mode.
    ///
    /// The scheduler stops when the engine is cancelled or
    /// [`SyncScheduler::shutdown`] is called.
    pub fn start_scheduler(self: &Arc<Self>) -> (SyncScheduler, JoinHandle<()>) {
        let (scheduler, handle) =
            SyncScheduler::new(self.config.sync_mode.clone(), self.cancel.child_token());
        if self.scheduler.set(scheduler.clone()).is_err() {
            warn!("Scheduler already started; follow-up passes go to the first one");
        }
        let connectivity = self.connectivity.subscribe();
        let engine = Arc::clone(self);

        let task = tokio::spawn(handle.run(connectivity, move |trigger| {
            let engine = Arc::clone(&engine);
            async move {
                debug!("Sync triggered: {:?}", trigger);
                engine.reconcile().await
            }
        }));

        (scheduler, task)
    }
}
