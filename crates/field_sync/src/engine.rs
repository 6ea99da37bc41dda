//! Sync engine: the mutation path and the reconciliation cycle.
//!
//! A cycle has two phases:
//!
//! 1. **Drain**: send queued write intents to the remote service, oldest
//!    first, and fold each outcome back into the cache and the queue.
//! 2. **Reconcile**: fetch records changed since the cursor (or everything on
//!    a full resync) and store them without touching records that hold
//!    local changes.
//!
//! A failed reconcile does not undo the drain. Only one cycle runs at a
//! time; a second caller gets [`SyncError::AlreadySyncing`] instead of
//! waiting.

use crate::cache::LocalCache;
use crate::config::SyncConfig;
use crate::cursor::SyncCursor;
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::{self, ConflictView, Resolution, WriteOutcome};
use crate::queue::{ActionId, ActionKind, ActionQueue, PendingAction, RetryDecision};
use crate::realtime::ChannelEvent;
use crate::record::{CachedRecord, JobRecord, JobStatus, NewJob, RecordId, RecordPatch, SyncStatus};
use crate::remote::{RemoteError, RemoteService};
use crate::store::{self, LocalStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// What a cycle should fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleMode {
    /// Fetch changes since the cursor, upgraded to a full resync when due.
    Delta,
    /// Fetch everything regardless of the cursor.
    ForceFull,
}

/// A write the server refused, or that could not be delivered within the
/// retry budget and has no cached record to flag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedWrite {
    pub action: ActionId,
    pub record_id: Option<RecordId>,
    pub reason: String,
}

/// Result of one cycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub actions_applied: usize,
    pub actions_failed: usize,
    pub records_synced: usize,
    /// Records that entered `conflict` during this cycle.
    pub conflicts: Vec<RecordId>,
    pub rejected: Vec<RejectedWrite>,
    pub full_resync: bool,
    /// Set when the drain stopped early on a network failure.
    pub transient_error: Option<String>,
    /// Set when the reconcile phase failed.
    pub reconcile_error: Option<String>,
}

impl SyncReport {
    /// The error to surface for this cycle, if any.
    pub fn error(&self) -> Option<&str> {
        self.reconcile_error
            .as_deref()
            .or(self.transient_error.as_deref())
    }
}

/// Snapshot for status displays.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub is_syncing: bool,
    pub pending_actions: usize,
    pub conflicts: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_report: Option<SyncReport>,
}

/// Clears the in-flight flag when a cycle ends, including by cancellation.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The offline-first sync engine.
pub struct SyncEngine<S: LocalStore, R: RemoteService> {
    store: Arc<S>,
    cache: LocalCache<S>,
    queue: ActionQueue<S>,
    cursor: SyncCursor<S>,
    remote: Arc<R>,
    config: SyncConfig,
    is_syncing: AtomicBool,
    last_error: RwLock<Option<String>>,
    last_report: RwLock<Option<SyncReport>>,
}

impl<S: LocalStore, R: RemoteService> SyncEngine<S, R> {
    /// Create an engine over an opened store, bringing the store's schema up
    /// to date first.
    pub fn new(store: Arc<S>, remote: Arc<R>, config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        store::run_migrations(store.as_ref())?;

        Ok(Self {
            cache: LocalCache::new(Arc::clone(&store)),
            queue: ActionQueue::with_max_retries(Arc::clone(&store), config.max_retries),
            cursor: SyncCursor::with_full_resync_every(Arc::clone(&store), config.full_resync_every),
            store,
            remote,
            config,
            is_syncing: AtomicBool::new(false),
            last_error: RwLock::new(None),
            last_report: RwLock::new(None),
        })
    }

    pub fn cache(&self) -> &LocalCache<S> {
        &self.cache
    }

    pub fn queue(&self) -> &ActionQueue<S> {
        &self.queue
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    // ========== Mutation path ==========

    /// Cached records, optionally limited to one lifecycle state, most
    /// recently updated first.
    pub fn records(&self, status: Option<JobStatus>) -> SyncResult<Vec<CachedRecord>> {
        Ok(self.cache.get(status)?)
    }

    pub fn record(&self, id: &RecordId) -> SyncResult<Option<CachedRecord>> {
        Ok(self.cache.get_by_id(id)?)
    }

    /// Queue a job for creation. The job appears in the cache once the
    /// server has created it.
    pub fn create_record(&self, job: NewJob) -> SyncResult<PendingAction> {
        job.validate().map_err(SyncError::Validation)?;
        Ok(self.queue.enqueue(ActionKind::CreateRecord(job))?)
    }

    /// Move a job to a new lifecycle state.
    ///
    /// The transition is checked locally, applied to the cache as `pending`
    /// and queued with the version token the cache holds right now.
    pub fn transition_lifecycle(&self, id: &RecordId, to: JobStatus) -> SyncResult<CachedRecord> {
        let cached = self
            .cache
            .get_by_id(id)?
            .ok_or_else(|| SyncError::RecordNotFound(id.clone()))?;
        if cached.is_conflict() {
            return Err(SyncError::RecordInConflict(id.clone()));
        }
        lifecycle::validate_transition(cached.record.status, to)?;
        let version = cached
            .record
            .version
            .clone()
            .ok_or_else(|| SyncError::MissingVersionToken(id.clone()))?;

        self.queue.enqueue(ActionKind::UpdateLifecycleState {
            record_id: id.clone(),
            status: to,
            version,
        })?;
        self.cache
            .apply_optimistic_mutation(id, &RecordPatch::status(to))?
            .ok_or_else(|| SyncError::RecordNotFound(id.clone()))
    }

    /// Move a job one step forward along its primary path.
    pub fn advance_lifecycle(&self, id: &RecordId) -> SyncResult<CachedRecord> {
        let cached = self
            .cache
            .get_by_id(id)?
            .ok_or_else(|| SyncError::RecordNotFound(id.clone()))?;
        let from = cached.record.status;
        let to = lifecycle::next_status(from).ok_or(SyncError::InvalidTransition { from, to: from })?;
        self.transition_lifecycle(id, to)
    }

    // ========== Conflicts ==========

    /// Records waiting for a user decision.
    pub fn conflicts(&self) -> SyncResult<Vec<CachedRecord>> {
        Ok(self.cache.conflicts()?)
    }

    /// Local and server values of a conflicting record. The server side is
    /// `None` when it cannot be fetched right now.
    pub async fn conflict_view(&self, id: &RecordId) -> SyncResult<ConflictView> {
        let local = self.conflicting(id)?;
        let server = match self.fetch_record(id).await {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Could not fetch server copy of {}: {}", id, e);
                None
            }
        };
        Ok(ConflictView { local, server })
    }

    /// Apply the user's decision on a conflicting record and return the
    /// cached copy afterwards.
    ///
    /// Accepting the server copy works offline: the record is marked
    /// `synced` and the next full resync replaces it.
    pub async fn resolve_conflict(
        &self,
        id: &RecordId,
        resolution: Resolution,
    ) -> SyncResult<Option<CachedRecord>> {
        self.conflicting(id)?;

        match resolution {
            Resolution::AcceptServer => match self.fetch_record(id).await {
                Ok(record) => {
                    self.cache.upsert(vec![record], false)?;
                }
                Err(RemoteError::NotFound(_)) => {
                    self.cache.remove(id)?;
                }
                Err(e) => {
                    tracing::warn!("Accepting server copy of {} without fetching it: {}", id, e);
                    self.cache.mark_status(id, SyncStatus::Synced)?;
                }
            },
            Resolution::RetryMine => {
                // Release the record so the fetch may replace it. Delta
                // fetches never return a record that was skipped while it
                // held local changes, so only a full fetch brings the fresh
                // token.
                self.cache.mark_status(id, SyncStatus::Synced)?;
                let outcome = self.run_cycle(CycleMode::ForceFull).await;
                let fetched = matches!(&outcome, Ok(report) if report.reconcile_error.is_none());
                if !fetched {
                    self.cache.mark_status(id, SyncStatus::Conflict)?;
                }
                outcome?;
            }
        }

        tracing::info!("Resolved conflict on {} with {:?}", id, resolution);
        Ok(self.cache.get_by_id(id)?)
    }

    fn conflicting(&self, id: &RecordId) -> SyncResult<CachedRecord> {
        let cached = self
            .cache
            .get_by_id(id)?
            .ok_or_else(|| SyncError::RecordNotFound(id.clone()))?;
        if !cached.is_conflict() {
            return Err(SyncError::NoConflict(id.clone()));
        }
        Ok(cached)
    }

    async fn fetch_record(&self, id: &RecordId) -> Result<JobRecord, RemoteError> {
        with_deadline(self.config.read_timeout(), self.remote.fetch_record(id)).await
    }

    // ========== Notifications ==========

    /// Fold a real-time notification into the cache.
    ///
    /// Returns `true` if a cycle should follow.
    pub fn apply_notification(&self, event: &ChannelEvent) -> SyncResult<bool> {
        if event.is_removal() {
            self.cache.remove(&event.record.id)?;
            tracing::debug!("Removed {} on notification", event.record.id);
            Ok(false)
        } else {
            self.cache.upsert(vec![event.record.clone()], true)?;
            Ok(true)
        }
    }

    // ========== Cycle ==========

    /// Run one drain + reconcile cycle.
    pub async fn run_cycle(&self, mode: CycleMode) -> SyncResult<SyncReport> {
        if self.is_syncing.swap(true, Ordering::SeqCst) {
            tracing::debug!("Sync cycle already in progress, skipping");
            return Err(SyncError::AlreadySyncing);
        }
        let _in_flight = InFlight(&self.is_syncing);

        tracing::debug!("Starting sync cycle ({:?})", mode);
        let result = self.cycle(mode).await;

        match &result {
            Ok(report) => {
                *self.last_error.write().await = report.error().map(str::to_string);
                *self.last_report.write().await = Some(report.clone());
                tracing::info!(
                    "Sync cycle finished: {} applied, {} failed, {} synced, {} conflicts{}",
                    report.actions_applied,
                    report.actions_failed,
                    report.records_synced,
                    report.conflicts.len(),
                    if report.full_resync { " (full resync)" } else { "" }
                );
            }
            Err(e) => {
                tracing::error!("Sync cycle failed: {}", e);
                *self.last_error.write().await = Some(e.to_string());
            }
        }
        result
    }

    async fn cycle(&self, mode: CycleMode) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();
        self.drain(&mut report).await?;

        match self.reconcile(mode).await {
            Ok((synced, full)) => {
                report.records_synced = synced;
                report.full_resync = full;
            }
            Err(e) => {
                tracing::warn!("Reconcile failed, keeping cached data: {}", e);
                report.reconcile_error = Some(e.to_string());
            }
        }
        Ok(report)
    }

    async fn drain(&self, report: &mut SyncReport) -> SyncResult<()> {
        let mut last = None;
        // Records whose earlier action failed this cycle. Their later actions
        // wait so that per-record order holds.
        let mut held: HashSet<RecordId> = HashSet::new();
        while let Some(action) = self.queue.next_after(last)? {
            last = Some(action.id);
            let record_id = action.kind.record_id().cloned();
            if record_id.as_ref().is_some_and(|id| held.contains(id)) {
                tracing::debug!("Holding action {} behind a failed action", action.id);
                continue;
            }

            let result = with_deadline(self.config.upload_timeout(), self.send(&action.kind)).await;
            match WriteOutcome::classify(result) {
                WriteOutcome::Applied(record) => {
                    self.applied(&action, record)?;
                    report.actions_applied += 1;
                }
                WriteOutcome::Conflict(reason) => {
                    tracing::warn!("Action {} conflicts with the server copy: {}", action.id, reason);
                    self.queue.discard(action.id)?;
                    if let Some(id) = record_id {
                        self.cache.mark_status(&id, SyncStatus::Conflict)?;
                        report.conflicts.push(id);
                    }
                    report.actions_failed += 1;
                }
                WriteOutcome::Rejected(reason) => {
                    tracing::warn!("Action {} rejected: {}", action.id, reason);
                    self.queue.discard(action.id)?;
                    if let Some(id) = &record_id {
                        self.cache.mark_status(id, SyncStatus::Conflict)?;
                    }
                    report.rejected.push(RejectedWrite {
                        action: action.id,
                        record_id,
                        reason,
                    });
                    report.actions_failed += 1;
                }
                WriteOutcome::Transient(reason) => {
                    tracing::info!("Stopping drain at action {}: {}", action.id, reason);
                    report.transient_error = Some(reason);
                    break;
                }
                WriteOutcome::Failed(reason) => {
                    report.actions_failed += 1;
                    if let Some(id) = &record_id {
                        held.insert(id.clone());
                    }
                    if let RetryDecision::Exhausted { .. } = self.queue.record_failure(action.id, &reason)? {
                        match record_id {
                            Some(id) => {
                                self.cache.mark_status(&id, SyncStatus::Conflict)?;
                                report.conflicts.push(id);
                            }
                            None => report.rejected.push(RejectedWrite {
                                action: action.id,
                                record_id: None,
                                reason,
                            }),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn send(&self, kind: &ActionKind) -> Result<JobRecord, RemoteError> {
        match kind {
            ActionKind::CreateRecord(job) => self.remote.create_record(job).await,
            ActionKind::UpdateLifecycleState {
                record_id,
                status,
                version,
            } => self.remote.update_lifecycle_state(record_id, *status, version).await,
        }
    }

    fn applied(&self, action: &PendingAction, record: JobRecord) -> SyncResult<()> {
        self.queue.dequeue(action.id)?;

        if let ActionKind::UpdateLifecycleState { record_id, version, .. } = &action.kind {
            if let Some(fresh) = &record.version {
                self.queue.rebase(record_id, version, fresh)?;
            }
            if self.queue.has_actions_for(record_id)? {
                // Later local changes are still queued: keep them visible and
                // only take the new token.
                if let Some(fresh) = record.version.clone() {
                    self.cache.set_version(record_id, fresh)?;
                }
                return Ok(());
            }
        }

        self.cache.upsert(vec![record], false)?;
        Ok(())
    }

    async fn reconcile(&self, mode: CycleMode) -> SyncResult<(usize, bool)> {
        let last_sync = self.cursor.last_sync()?;
        let cycle = self.cursor.next_cycle()?;
        let full = mode == CycleMode::ForceFull || self.cursor.is_full_resync_due(last_sync, cycle);
        let since = if full { None } else { last_sync };

        let response = with_deadline(self.config.read_timeout(), self.remote.delta_fetch(since)).await?;

        if full {
            // Drop the cursor first so an interrupted resync is retried in full.
            self.cursor.reset()?;
            let purged = self.cache.purge_synced()?;
            tracing::debug!("Full resync purged {} synced records", purged);
        }
        let synced = self.cache.upsert(response.records, true)?;
        self.cursor.advance(response.sync_timestamp)?;
        Ok((synced, full))
    }

    // ========== Housekeeping ==========

    /// Drop every cached record, queued action and sync marker.
    pub fn clear_local_data(&self) -> SyncResult<()> {
        self.store.clear()?;
        store::run_migrations(self.store.as_ref())?;
        tracing::info!("Cleared local sync data");
        Ok(())
    }

    pub async fn status(&self) -> SyncResult<EngineStatus> {
        Ok(EngineStatus {
            is_syncing: self.is_syncing(),
            pending_actions: self.queue.len()?,
            conflicts: self.cache.conflicts()?.len(),
            last_sync: self.cursor.last_sync()?,
            last_error: self.last_error.read().await.clone(),
            last_report: self.last_report.read().await.clone(),
        })
    }
}

/// Await a remote call, mapping an elapsed deadline to a timeout error.
async fn with_deadline<T>(
    deadline: Duration,
    call: impl std::future::Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    tokio::time::timeout(deadline, call)
        .await
        .unwrap_or(Err(RemoteError::Timeout))
}
