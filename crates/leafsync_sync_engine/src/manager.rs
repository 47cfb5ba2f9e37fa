//! The sync manager: scheduling, passes, backoff.

use crate::config::SyncConfig;
use crate::cursor::CursorStore;
use crate::error::{SyncError, SyncResult};
use crate::remote::{PushAck, PushRecord, RemoteClient};
use crate::state::{SyncState, SyncStats, SyncStatus};
use leafsync_core::{
    ChangeOrigin, EventNotifier, MergeOutcome, RecordId, RecordStore, Resolution, Subscription,
    SyncEvent, SyncFailure, SyncOutcome, Timestamp,
};
use leafsync_storage::Storage;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How a pass ended, as seen by [`SyncManager::sync_now`] callers.
#[derive(Debug, Clone)]
struct PassReport {
    pass: u64,
    result: Result<Arc<SyncOutcome>, PassError>,
}

#[derive(Debug, Clone)]
struct PassError {
    reason: String,
    retryable: bool,
    cancelled: bool,
}

#[derive(Debug)]
struct StatusCell {
    state: SyncState,
    last_success_at: Option<Timestamp>,
    last_outcome: Option<Arc<SyncOutcome>>,
    consecutive_failures: u32,
    retry_at: Option<Instant>,
    stats: SyncStats,
}

/// Sync bookkeeping for one registered collection.
struct CollectionSync {
    store: Arc<RecordStore>,
    running: AtomicBool,
    rerun: AtomicBool,
    debounce_armed: AtomicBool,
    passes_started: AtomicU64,
    status: Mutex<StatusCell>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    completions: watch::Sender<Option<PassReport>>,
}

impl CollectionSync {
    fn new(store: Arc<RecordStore>) -> Self {
        let (completions, _) = watch::channel(None);
        Self {
            store,
            running: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            debounce_armed: AtomicBool::new(false),
            passes_started: AtomicU64::new(0),
            status: Mutex::new(StatusCell {
                state: SyncState::Idle,
                last_success_at: None,
                last_outcome: None,
                consecutive_failures: 0,
                retry_at: None,
                stats: SyncStats::default(),
            }),
            retry_task: Mutex::new(None),
            completions,
        }
    }

    fn name(&self) -> &str {
        self.store.collection()
    }

    fn set_state(&self, state: SyncState) {
        self.status.lock().state = state;
    }

    fn state(&self) -> SyncState {
        self.status.lock().state.clone()
    }

    fn cancel_retry(&self) {
        if let Some(task) = self.retry_task.lock().take() {
            task.abort();
        }
        self.status.lock().retry_at = None;
    }
}

struct Inner {
    config: SyncConfig,
    remote: Arc<dyn RemoteClient>,
    cursors: CursorStore,
    notifier: EventNotifier,
    collections: RwLock<HashMap<String, Arc<CollectionSync>>>,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Keeps registered collections in sync with a remote store.
///
/// Passes run on spawned tasks, at most one per collection at a time.
/// They start from:
/// - the periodic timer,
/// - the write debounce, a fixed window opened by the first local write,
/// - [`trigger_sync`](Self::trigger_sync), [`sync_now`](Self::sync_now)
///   and [`trigger_all`](Self::trigger_all),
/// - the backoff timer after a transient failure.
///
/// A trigger arriving while a pass runs schedules exactly one more pass.
///
/// Cloning is cheap; clones control the same manager.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl SyncManager {
    /// Creates a manager.
    ///
    /// `storage` holds the pull cursors under `sync/cursors/`; it's usually
    /// the same storage the record stores use. Nothing runs until
    /// [`start`](Self::start) or an explicit trigger.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if `config` is invalid.
    pub fn new(
        config: SyncConfig,
        remote: Arc<dyn RemoteClient>,
        storage: Arc<dyn Storage>,
        notifier: EventNotifier,
    ) -> SyncResult<Self> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                remote,
                cursors: CursorStore::new(storage),
                notifier,
                collections: RwLock::new(HashMap::new()),
                shutdown,
                background: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Adds a collection. Its store should publish to the manager's notifier
    /// for write debouncing to see it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the collection is already registered
    /// or the store writes under a different device id than the manager.
    pub fn register(&self, store: Arc<RecordStore>) -> SyncResult<()> {
        let name = store.collection().to_string();
        let device_id = self.inner.config.device_id.as_str();
        if store.device_id() != device_id {
            return Err(SyncError::Config(format!(
                "collection {name} writes as device {:?}, manager is {device_id:?}",
                store.device_id()
            )));
        }
        let mut collections = self.inner.collections.write();
        if collections.contains_key(&name) {
            return Err(SyncError::Config(format!(
                "collection {name} is already registered"
            )));
        }
        debug!(collection = %name, "registered collection");
        collections.insert(name, Arc::new(CollectionSync::new(store)));
        Ok(())
    }

    /// Names of the registered collections, sorted.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Starts the periodic timer and the write debounce.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut background = self.inner.background.lock();
        if !background.is_empty() {
            return;
        }
        if let Some(period) = self.inner.config.periodic_interval() {
            background.push(tokio::spawn(Arc::clone(&self.inner).periodic(period)));
        }
        // Subscribe before returning so writes made right after start are seen.
        let events = self.inner.notifier.subscribe();
        background.push(tokio::spawn(Arc::clone(&self.inner).watch_writes(events)));
        info!(
            collections = self.inner.collections.read().len(),
            periodic_secs = self.inner.config.periodic_interval_secs,
            debounce_ms = self.inner.config.debounce_millis,
            "sync manager started"
        );
    }

    /// Requests a pass for `collection` without waiting for it.
    ///
    /// Failures of the pass are published as [`SyncEvent::SyncFailed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the collection isn't registered or the manager
    /// has shut down.
    pub fn trigger_sync(&self, collection: &str) -> SyncResult<()> {
        let sync = self.inner.collection(collection)?;
        self.inner.schedule(&sync)
    }

    /// Requests a pass for every registered collection, as when the app
    /// returns to the foreground.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cancelled`] if the manager has shut down.
    pub fn trigger_all(&self) -> SyncResult<()> {
        let all: Vec<_> = self.inner.collections.read().values().cloned().collect();
        for sync in all {
            self.inner.schedule(&sync)?;
        }
        Ok(())
    }

    /// Runs a pass that includes every change made before the call and
    /// returns its outcome.
    ///
    /// If a pass is already running, waits for the follow-up pass it
    /// schedules.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::PassFailed`] if the pass fails,
    /// [`SyncError::Cancelled`] if the manager shuts down first, or an
    /// error from [`trigger_sync`](Self::trigger_sync).
    pub async fn sync_now(&self, collection: &str) -> SyncResult<Arc<SyncOutcome>> {
        let sync = self.inner.collection(collection)?;
        let mut completions = sync.completions.subscribe();
        let after = sync.passes_started.load(Ordering::SeqCst);
        self.inner.schedule(&sync)?;

        let report = loop {
            {
                let latest = completions.borrow_and_update();
                if let Some(report) = latest.as_ref().filter(|r| r.pass > after) {
                    break report.clone();
                }
            }
            completions
                .changed()
                .await
                .map_err(|_| SyncError::Cancelled)?;
        };

        match report.result {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.cancelled => Err(SyncError::Cancelled),
            Err(err) => Err(SyncError::PassFailed {
                pass: report.pass,
                reason: err.reason,
                retryable: err.retryable,
            }),
        }
    }

    /// Returns the sync status of `collection`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownCollection`] if it isn't registered.
    pub fn status(&self, collection: &str) -> SyncResult<SyncStatus> {
        let sync = self.inner.collection(collection)?;
        let status = sync.status.lock();
        Ok(SyncStatus {
            state: status.state.clone(),
            last_success_at: status.last_success_at,
            last_outcome: status.last_outcome.clone(),
            consecutive_failures: status.consecutive_failures,
            next_retry_in: status
                .retry_at
                .map(|at| at.saturating_duration_since(Instant::now())),
            stats: status.stats.clone(),
        })
    }

    /// Stops all timers and running passes.
    ///
    /// Running passes stop at their next suspension point; whatever they
    /// already applied stays applied. Waits for the timer tasks to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let collections: Vec<_> = self.inner.collections.read().values().cloned().collect();
        for sync in collections {
            sync.cancel_retry();
        }
        let background: Vec<_> = self.inner.background.lock().drain(..).collect();
        for task in background {
            // A cancelled or panicked timer task has nothing left to clean up.
            let _ = task.await;
        }
        info!("sync manager stopped");
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("device_id", &self.inner.config.device_id)
            .field("collections", &self.collections())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn collection(&self, name: &str) -> SyncResult<Arc<CollectionSync>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownCollection(name.to_string()))
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Starts a pass, or marks a rerun if one is running.
    fn schedule(self: &Arc<Self>, sync: &Arc<CollectionSync>) -> SyncResult<()> {
        if self.is_shut_down() {
            return Err(SyncError::Cancelled);
        }
        if sync
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(collection = sync.name(), "pass running, rerun requested");
            sync.rerun.store(true, Ordering::SeqCst);
            return Ok(());
        }
        tokio::spawn(Arc::clone(self).run(Arc::clone(sync)));
        Ok(())
    }

    /// Runs passes for `sync` until no rerun is pending. The caller has set
    /// the running flag.
    async fn run(self: Arc<Self>, sync: Arc<CollectionSync>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            sync.rerun.store(false, Ordering::SeqCst);
            sync.cancel_retry();
            let pass = sync.passes_started.fetch_add(1, Ordering::SeqCst) + 1;

            let result = tokio::select! {
                result = self.run_pass(&sync, pass) => Some(result),
                () = stopped(&mut shutdown) => None,
            };

            match result {
                Some(result) => self.finish_pass(&sync, pass, result),
                None => {
                    debug!(collection = sync.name(), pass, "pass cancelled by shutdown");
                    sync.set_state(SyncState::Idle);
                    sync.completions.send_replace(Some(PassReport {
                        pass,
                        result: Err(PassError {
                            reason: SyncError::Cancelled.to_string(),
                            retryable: false,
                            cancelled: true,
                        }),
                    }));
                    sync.running.store(false, Ordering::SeqCst);
                    return;
                }
            }

            sync.running.store(false, Ordering::SeqCst);
            // A trigger that raced with clearing the flag has already
            // spawned its own pass; only reclaim the flag for a rerun.
            if !sync.rerun.swap(false, Ordering::SeqCst) || self.is_shut_down() {
                return;
            }
            if sync
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            debug!(collection = sync.name(), "starting requested rerun");
        }
    }

    async fn run_pass(&self, sync: &CollectionSync, pass: u64) -> SyncResult<SyncOutcome> {
        let started = Instant::now();
        let name = sync.name();
        let mut outcome = SyncOutcome::new(name, pass, Timestamp::now());
        debug!(collection = name, pass, "sync pass started");

        self.pull(sync, &mut outcome).await?;
        self.push(sync, &mut outcome).await?;

        let purged = sync
            .store
            .purge_tombstones(self.config.tombstone_retention())
            .await?;
        if purged > 0 {
            debug!(collection = name, purged, "purged tombstones after pass");
        }

        outcome.duration = started.elapsed();
        Ok(outcome)
    }

    async fn pull(&self, sync: &CollectionSync, outcome: &mut SyncOutcome) -> SyncResult<()> {
        let name = sync.name();
        let policy = self.config.conflict_policy;
        let mut cursor = self.cursors.get(name).await?;

        loop {
            sync.set_state(SyncState::Pulling);
            let batch = self
                .call(
                    self.remote
                        .pull(name, cursor.as_ref(), self.config.pull_batch_size),
                )
                .await?;
            debug!(
                collection = name,
                records = batch.records.len(),
                has_more = batch.has_more,
                "pulled batch"
            );

            sync.set_state(SyncState::Resolving);
            for remote in &batch.records {
                let merged = sync
                    .store
                    .merge_remote(remote, |local, theirs| policy.resolve(local, theirs))
                    .await?;
                match merged {
                    MergeOutcome::Applied(_) => outcome.pulled += 1,
                    MergeOutcome::Skipped => {}
                    MergeOutcome::Resolved { conflict, .. } => {
                        if conflict.resolution == Resolution::RemoteWins {
                            outcome.pulled += 1;
                        }
                        outcome.conflicts.push(conflict);
                    }
                }
            }

            // Only a fully applied batch moves the cursor.
            if let Some(next) = batch.cursor {
                self.cursors.set(name, &next).await?;
                cursor = Some(next);
            }
            if !batch.has_more {
                return Ok(());
            }
        }
    }

    async fn push(&self, sync: &CollectionSync, outcome: &mut SyncOutcome) -> SyncResult<()> {
        let name = sync.name();
        let policy = self.config.conflict_policy;
        let mut rejected: HashSet<RecordId> = HashSet::new();

        for round in 1..=self.config.max_push_rounds {
            sync.set_state(SyncState::Pushing);
            let pending: Vec<_> = sync
                .store
                .pending()
                .into_iter()
                .filter(|r| !rejected.contains(&r.id))
                .collect();
            if pending.is_empty() {
                return Ok(());
            }

            let mut repush = false;
            for chunk in pending.chunks(self.config.push_batch_size) {
                let pushed_versions: HashMap<RecordId, u64> = chunk
                    .iter()
                    .map(|r| (r.id.clone(), r.local_version))
                    .collect();
                let batch: Vec<PushRecord> = chunk.iter().map(PushRecord::from_record).collect();
                let acks = self.call(self.remote.push(name, batch)).await?;
                debug!(collection = name, round, acks = acks.len(), "pushed batch");

                for ack in acks {
                    let Some(&local_version) = pushed_versions.get(ack.id()) else {
                        return Err(SyncError::Protocol(format!(
                            "acknowledgement for {} which wasn't pushed",
                            ack.id()
                        )));
                    };
                    match ack {
                        PushAck::Accepted { id, version } => {
                            sync.store.mark_pushed(&id, local_version, version).await?;
                            outcome.pushed += 1;
                        }
                        PushAck::Conflict { current, .. } => {
                            sync.set_state(SyncState::Resolving);
                            let merged = sync
                                .store
                                .merge_remote(&current, |local, theirs| policy.resolve(local, theirs))
                                .await?;
                            match merged {
                                MergeOutcome::Resolved { conflict, .. } => {
                                    match conflict.resolution {
                                        Resolution::LocalWins => repush = true,
                                        Resolution::RemoteWins => outcome.pulled += 1,
                                    }
                                    outcome.conflicts.push(conflict);
                                }
                                MergeOutcome::Applied(_) => outcome.pulled += 1,
                                MergeOutcome::Skipped => {}
                            }
                        }
                        PushAck::Rejected { id, reason } => {
                            warn!(collection = name, %id, %reason, "remote rejected record");
                            outcome.failures.push(SyncFailure::record(id.clone(), reason));
                            rejected.insert(id);
                        }
                    }
                }
            }

            if !repush {
                return Ok(());
            }
        }

        let still_pending = sync
            .store
            .pending()
            .iter()
            .filter(|r| !rejected.contains(&r.id))
            .count();
        if still_pending > 0 {
            warn!(
                collection = name,
                still_pending,
                rounds = self.config.max_push_rounds,
                "push rounds exhausted"
            );
            outcome.failures.push(SyncFailure::pass(format!(
                "{still_pending} records still conflicting after {} push rounds",
                self.config.max_push_rounds
            )));
        }
        Ok(())
    }

    async fn call<T>(&self, request: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        tokio::time::timeout(self.config.request_timeout(), request)
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    fn finish_pass(self: &Arc<Self>, sync: &Arc<CollectionSync>, pass: u64, result: SyncResult<SyncOutcome>) {
        let name = sync.name().to_string();
        match result {
            Ok(outcome) => {
                let outcome = Arc::new(outcome);
                {
                    let mut status = sync.status.lock();
                    status.state = SyncState::Idle;
                    status.last_success_at = Some(Timestamp::now());
                    status.last_outcome = Some(Arc::clone(&outcome));
                    status.consecutive_failures = 0;
                    status.retry_at = None;
                    status.stats.record_success(&outcome);
                }
                info!(
                    collection = %name,
                    pass,
                    pulled = outcome.pulled,
                    pushed = outcome.pushed,
                    conflicts = outcome.conflicts.len(),
                    failures = outcome.failures.len(),
                    duration_ms = outcome.duration.as_millis() as u64,
                    "sync pass completed"
                );
                self.notifier
                    .publish(SyncEvent::SyncCompleted(Arc::clone(&outcome)));
                sync.completions.send_replace(Some(PassReport {
                    pass,
                    result: Ok(outcome),
                }));
            }
            Err(err) => {
                let fatal = !err.is_retryable();
                let reason = err.to_string();
                let retry_in = {
                    let mut status = sync.status.lock();
                    status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                    status.stats.failed_passes += 1;
                    status.state = SyncState::Failed {
                        reason: reason.clone(),
                        fatal,
                    };
                    let retry_in = (!fatal).then(|| {
                        self.config
                            .retry()
                            .delay_for_attempt(status.consecutive_failures)
                    });
                    status.retry_at = retry_in.map(|delay| Instant::now() + delay);
                    retry_in
                };
                warn!(
                    collection = %name,
                    pass,
                    error = %err,
                    fatal,
                    retry_in_ms = retry_in.map(|d| d.as_millis() as u64),
                    "sync pass failed"
                );
                if let Some(delay) = retry_in {
                    self.schedule_retry(sync, delay);
                }
                self.notifier.publish(SyncEvent::SyncFailed {
                    collection: name,
                    pass,
                    reason: reason.clone(),
                    fatal,
                    retry_in,
                });
                sync.completions.send_replace(Some(PassReport {
                    pass,
                    result: Err(PassError {
                        reason,
                        retryable: !fatal,
                        cancelled: false,
                    }),
                }));
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, sync: &Arc<CollectionSync>, delay: Duration) {
        let inner = Arc::clone(self);
        let target = Arc::clone(sync);
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = stopped(&mut shutdown) => return,
            }
            // Detach before scheduling so the new pass doesn't abort this task.
            target.retry_task.lock().take();
            {
                let mut status = target.status.lock();
                status.retry_at = None;
                if matches!(status.state, SyncState::Failed { .. }) {
                    status.state = SyncState::Idle;
                }
            }
            debug!(collection = target.name(), "retrying after backoff");
            if let Err(err) = inner.schedule(&target) {
                debug!(collection = target.name(), error = %err, "retry not scheduled");
            }
        });
        if let Some(previous) = sync.retry_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Starts a pass for every idle collection on each tick.
    async fn periodic(self: Arc<Self>, period: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = stopped(&mut shutdown) => return,
            }
            let all: Vec<_> = self.collections.read().values().cloned().collect();
            for sync in all {
                if sync.state().accepts_background_sync() {
                    debug!(collection = sync.name(), "periodic sync");
                    // Only fails once shut down, which the select observes next.
                    let _ = self.schedule(&sync);
                }
            }
        }
    }

    /// Debounces local writes into passes.
    async fn watch_writes(self: Arc<Self>, mut events: Subscription) {
        let mut shutdown = self.shutdown.subscribe();
        let mut missed = 0;
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                () = stopped(&mut shutdown) => return,
            };
            let Some(event) = event else {
                return;
            };

            if events.missed() > missed {
                missed = events.missed();
                warn!(missed, "change events lost, debouncing every collection");
                let all: Vec<_> = self.collections.read().values().cloned().collect();
                for sync in all {
                    self.debounce(&sync);
                }
            }

            if let SyncEvent::RecordChanged {
                collection,
                origin: ChangeOrigin::Local,
                ..
            } = event
            {
                if let Ok(sync) = self.collection(&collection) {
                    self.debounce(&sync);
                }
            }
        }
    }

    /// Arms the debounce window of `sync` unless it's already open.
    fn debounce(self: &Arc<Self>, sync: &Arc<CollectionSync>) {
        if sync
            .debounce_armed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let inner = Arc::clone(self);
        let target = Arc::clone(sync);
        let window = self.config.debounce();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(window) => {}
                () = stopped(&mut shutdown) => return,
            }
            target.debounce_armed.store(false, Ordering::SeqCst);
            if target.state().accepts_background_sync() || target.state().is_active() {
                debug!(collection = target.name(), "debounced sync");
                // Only fails once shut down.
                let _ = inner.schedule(&target);
            }
        });
    }
}

/// Resolves once shutdown has been signalled.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
