//! Integration tests for offline editing and reconciliation.
//!
//! A scripted job service stands in for the remote side. It enforces the
//! lifecycle table and the concurrency token like the real service, and can
//! be taken offline or made to fail writes.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use field_sync::{
    ActionKind, CachedRecord, ChannelConnection, ChannelEvent, ChannelEventKind, ChannelGrant,
    ChannelTransport, CycleMode, DeltaResponse, EventPayload, FileStore, JobRecord, JobStatus,
    Location, MemoryStore, NewJob, Priority, RecordId, RemoteError, RemoteService, Resolution,
    SessionIdentity, SyncAgent, SyncConfig, SyncEngine, SyncStatus, VersionToken,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ========== Scripted service ==========

struct ServiceState {
    records: BTreeMap<RecordId, JobRecord>,
    clock: DateTime<Utc>,
    next_etag: u64,
    next_id: u64,
    reachable: bool,
    write_error: Option<RemoteError>,
    writes: Vec<String>,
    full_fetches: usize,
    delta_fetches: usize,
}

impl ServiceState {
    fn stamp(&mut self) -> (DateTime<Utc>, VersionToken) {
        self.clock += ChronoDuration::seconds(1);
        self.next_etag += 1;
        (self.clock, VersionToken::new(format!("W/\"{}\"", self.next_etag)))
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.reachable {
            Ok(())
        } else {
            Err(RemoteError::Unreachable("network down".to_string()))
        }
    }
}

struct JobService {
    state: Mutex<ServiceState>,
}

impl JobService {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServiceState {
                records: BTreeMap::new(),
                clock: Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
                next_etag: 0,
                next_id: 1,
                reachable: true,
                write_error: None,
                writes: Vec::new(),
                full_fetches: 0,
                delta_fetches: 0,
            }),
        })
    }

    fn seed(&self, id: &str, status: JobStatus) {
        let mut state = self.state.lock().unwrap();
        let (at, etag) = state.stamp();
        let record = JobRecord {
            id: RecordId::new(id),
            title: format!("Job {}", id),
            description: "Walk-in cooler is warm".to_string(),
            status,
            priority: Priority::Urgent,
            tenant_id: "tenant-7".to_string(),
            vendor_id: "vendor-3".to_string(),
            created_by: "admin-1".to_string(),
            created_by_name: Some("Dispatch".to_string()),
            assigned_to: Some("tech-1".to_string()),
            assigned_to_name: None,
            location: location(),
            created_at: at,
            updated_at: at,
            version: Some(etag),
            thumbnail_url: None,
        };
        state.records.insert(record.id.clone(), record);
    }

    /// Change a record from another device.
    fn touch(&self, id: &str, status: JobStatus) -> JobRecord {
        let mut state = self.state.lock().unwrap();
        let (at, etag) = state.stamp();
        let record = state.records.get_mut(&RecordId::new(id)).unwrap();
        record.status = status;
        record.updated_at = at;
        record.version = Some(etag);
        record.clone()
    }

    fn delete(&self, id: &str) {
        self.state.lock().unwrap().records.remove(&RecordId::new(id));
    }

    fn record(&self, id: &str) -> JobRecord {
        self.state.lock().unwrap().records[&RecordId::new(id)].clone()
    }

    fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    fn fail_writes(&self, error: Option<RemoteError>) {
        self.state.lock().unwrap().write_error = error;
    }

    fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    fn fetches(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.full_fetches, state.delta_fetches)
    }
}

impl RemoteService for JobService {
    async fn create_record(&self, job: &NewJob) -> Result<JobRecord, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.check()?;
        if let Some(error) = state.write_error.clone() {
            return Err(error);
        }
        job.validate().map_err(RemoteError::Validation)?;

        let (at, etag) = state.stamp();
        let id = RecordId::new(format!("job-{}", 100 + state.next_id));
        state.next_id += 1;
        let record = JobRecord {
            id: id.clone(),
            title: job.title.clone(),
            description: job.description.clone(),
            status: JobStatus::Pending,
            priority: job.priority,
            tenant_id: "tenant-7".to_string(),
            vendor_id: job.vendor_id.clone(),
            created_by: "tech-1".to_string(),
            created_by_name: None,
            assigned_to: None,
            assigned_to_name: None,
            location: job.location.clone(),
            created_at: at,
            updated_at: at,
            version: Some(etag),
            thumbnail_url: None,
        };
        state.writes.push(format!("create:{}", job.title));
        state.records.insert(id, record.clone());
        Ok(record)
    }

    async fn update_lifecycle_state(
        &self,
        id: &RecordId,
        status: JobStatus,
        token: &VersionToken,
    ) -> Result<JobRecord, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.check()?;
        if let Some(error) = state.write_error.clone() {
            return Err(error);
        }
        let current = state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::from_status(404, "Job not found"))?;
        if current.version.as_ref() != Some(token) {
            return Err(RemoteError::from_status(409, "Job was modified by another user"));
        }
        if !field_sync::lifecycle::can_transition_to(current.status, status) {
            return Err(RemoteError::from_status(
                422,
                format!("Cannot transition from '{}' to '{}'", current.status, status),
            ));
        }

        let (at, etag) = state.stamp();
        state.writes.push(format!("{}:{}", id, status));
        let record = state.records.get_mut(id).unwrap();
        record.status = status;
        record.updated_at = at;
        record.version = Some(etag);
        Ok(record.clone())
    }

    async fn fetch_record(&self, id: &RecordId) -> Result<JobRecord, RemoteError> {
        let state = self.state.lock().unwrap();
        state.check()?;
        state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::from_status(404, "Job not found"))
    }

    async fn delta_fetch(&self, since: Option<DateTime<Utc>>) -> Result<DeltaResponse, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.check()?;
        match since {
            Some(_) => state.delta_fetches += 1,
            None => state.full_fetches += 1,
        }
        let records = state
            .records
            .values()
            .filter(|r| since.map_or(true, |since| r.updated_at > since))
            .cloned()
            .collect();
        Ok(DeltaResponse {
            records,
            sync_timestamp: state.clock,
        })
    }

    async fn probe(&self) -> bool {
        self.state.lock().unwrap().reachable
    }

    async fn negotiate(&self, _session: &SessionIdentity) -> Result<ChannelGrant, RemoteError> {
        Err(RemoteError::from_status(503, "hub unavailable"))
    }
}

/// Transport for agents that never get a channel.
struct NoChannel;

impl ChannelTransport for NoChannel {
    async fn connect(&self, _grant: &ChannelGrant) -> Result<ChannelConnection, RemoteError> {
        Err(RemoteError::Unreachable("no hub".to_string()))
    }
}

// ========== Helpers ==========

fn location() -> Location {
    Location {
        store_name: "Market 41".to_string(),
        address: "900 Elm Ave".to_string(),
        city: "Dayton".to_string(),
        state: "OH".to_string(),
        zip_code: "45402".to_string(),
    }
}

fn new_job(title: &str) -> NewJob {
    NewJob {
        title: title.to_string(),
        description: "Door does not close".to_string(),
        priority: Priority::Medium,
        vendor_id: "vendor-3".to_string(),
        location: location(),
    }
}

fn id(s: &str) -> RecordId {
    RecordId::new(s)
}

fn file_engine(path: &Path, service: &Arc<JobService>) -> SyncEngine<FileStore, JobService> {
    let store = FileStore::open(path).unwrap();
    SyncEngine::new(Arc::new(store), Arc::clone(service), SyncConfig::default()).unwrap()
}

fn memory_engine(service: &Arc<JobService>) -> SyncEngine<MemoryStore, JobService> {
    SyncEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::clone(service),
        SyncConfig::default(),
    )
    .unwrap()
}

fn describe(kind: &ActionKind) -> String {
    match kind {
        ActionKind::CreateRecord(job) => format!("create:{}", job.title),
        ActionKind::UpdateLifecycleState { record_id, status, .. } => format!("{}:{}", record_id, status),
    }
}

fn snapshot<S: field_sync::LocalStore>(engine: &SyncEngine<S, JobService>) -> Vec<CachedRecord> {
    engine.records(None).unwrap()
}

// ========== Scenarios ==========

#[tokio::test]
async fn test_queue_order_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let service = JobService::new();
    service.seed("job-1", JobStatus::Assigned);
    service.seed("job-2", JobStatus::Assigned);

    {
        let engine = file_engine(dir.path(), &service);
        engine.run_cycle(CycleMode::Delta).await.unwrap();

        service.set_reachable(false);
        engine.transition_lifecycle(&id("job-1"), JobStatus::InProgress).unwrap();
        engine.create_record(new_job("Broken door")).unwrap();
        engine.transition_lifecycle(&id("job-2"), JobStatus::Cancelled).unwrap();
        engine.transition_lifecycle(&id("job-1"), JobStatus::Completed).unwrap();
    }

    let engine = file_engine(dir.path(), &service);
    let queued = engine.queue().peek_all_ordered().unwrap();
    let expected = vec![
        "job-1:in-progress".to_string(),
        "create:Broken door".to_string(),
        "job-2:cancelled".to_string(),
        "job-1:completed".to_string(),
    ];
    assert_eq!(queued.iter().map(|a| describe(&a.kind)).collect::<Vec<_>>(), expected);
    assert!(queued.windows(2).all(|w| w[0].id < w[1].id));

    let cached = engine.record(&id("job-1")).unwrap().unwrap();
    assert_eq!(cached.record.status, JobStatus::Completed);
    assert_eq!(cached.sync_status, SyncStatus::Pending);

    service.set_reachable(true);
    let report = engine.run_cycle(CycleMode::Delta).await.unwrap();
    assert_eq!(report.actions_applied, 4);
    assert_eq!(service.writes(), expected);
    assert!(engine.queue().is_empty().unwrap());
    assert_eq!(engine.records(None).unwrap().len(), 3);
}

#[tokio::test]
async fn test_drained_records_carry_server_token() {
    init_tracing();
    let service = JobService::new();
    service.seed("job-1", JobStatus::Assigned);
    let engine = memory_engine(&service);
    engine.run_cycle(CycleMode::Delta).await.unwrap();

    engine.transition_lifecycle(&id("job-1"), JobStatus::InProgress).unwrap();
    engine.run_cycle(CycleMode::Delta).await.unwrap();

    let cached = engine.record(&id("job-1")).unwrap().unwrap();
    let server = service.record("job-1");
    assert_eq!(cached.sync_status, SyncStatus::Synced);
    assert_eq!(cached.record.version, server.version);
    assert_eq!(cached.record.status, JobStatus::InProgress);

    // The next local change is guarded by the fresh token and goes through.
    engine.transition_lifecycle(&id("job-1"), JobStatus::Completed).unwrap();
    let report = engine.run_cycle(CycleMode::Delta).await.unwrap();
    assert_eq!(report.actions_applied, 1);
    assert!(report.conflicts.is_empty());
}

#[tokio::test]
async fn test_reconcile_never_overwrites_pending() {
    init_tracing();
    let service = JobService::new();
    service.seed("job-1", JobStatus::Assigned);
    let engine = memory_engine(&service);
    engine.run_cycle(CycleMode::Delta).await.unwrap();

    engine.transition_lifecycle(&id("job-1"), JobStatus::InProgress).unwrap();
    service.touch("job-1", JobStatus::Cancelled);
    service.fail_writes(Some(RemoteError::Timeout));

    let report = engine.run_cycle(CycleMode::Delta).await.unwrap();
    assert!(report.transient_error.is_some());
    assert!(report.reconcile_error.is_none());

    let cached = engine.record(&id("job-1")).unwrap().unwrap();
    assert_eq!(cached.sync_status, SyncStatus::Pending);
    assert_eq!(cached.record.status, JobStatus::InProgress);

    // Transient failures do not spend the retry budget.
    let queued = engine.queue().peek_all_ordered().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].retry_count, 0);
}

#[tokio::test]
async fn test_full_resync_purges_synced_and_keeps_pending() {
    init_tracing();
    let service = JobService::new();
    service.seed("job-1", JobStatus::Assigned);
    service.seed("job-2", JobStatus::Assigned);
    service.seed("job-3", JobStatus::Pending);
    let engine = memory_engine(&service);
    engine.run_cycle(CycleMode::Delta).await.unwrap();
    assert_eq!(snapshot(&engine).len(), 3);

    engine.transition_lifecycle(&id("job-2"), JobStatus::InProgress).unwrap();
    service.fail_writes(Some(RemoteError::Timeout));
    service.delete("job-1");
    service.delete("job-2");

    let report = engine.run_cycle(CycleMode::ForceFull).await.unwrap();
    assert!(report.full_resync);

    let ids: Vec<String> = snapshot(&engine).iter().map(|r| r.id().to_string()).collect();
    assert!(!ids.contains(&"job-1".to_string()));
    assert!(ids.contains(&"job-2".to_string()));
    assert!(ids.contains(&"job-3".to_string()));
    assert!(engine.record(&id("job-2")).unwrap().unwrap().is_pending());
}

#[tokio::test]
async fn test_every_fifth_cycle_is_full() {
    init_tracing();
    let service = JobService::new();
    service.seed("job-1", JobStatus::Assigned);
    let engine = memory_engine(&service);

    let mut full = Vec::new();
    for _ in 0..6 {
        full.push(engine.run_cycle(CycleMode::Delta).await.unwrap().full_resync);
    }
    // The first cycle has no cursor; the fifth is due by count.
    assert_eq!(full, vec![true, false, false, false, true, false]);
    assert_eq!(service.fetches(), (2, 4));
}

#[tokio::test]
async fn test_offline_edit_conflicts_with_remote_change() {
    init_tracing();
    let service = JobService::new();
    service.seed("job-1", JobStatus::Assigned);
    let engine = memory_engine(&service);
    engine.run_cycle(CycleMode::Delta).await.unwrap();

    service.set_reachable(false);
    engine.transition_lifecycle(&id("job-1"), JobStatus::InProgress).unwrap();
    let offline = engine.run_cycle(CycleMode::Delta).await.unwrap();
    assert!(offline.transient_error.is_some());
    assert!(offline.reconcile_error.is_some());
    assert_eq!(engine.queue().len().unwrap(), 1);

    // Another device cancels the job while this one is offline.
    service.touch("job-1", JobStatus::Cancelled);
    service.set_reachable(true);

    let report = engine.run_cycle(CycleMode::Delta).await.unwrap();
    assert_eq!(report.conflicts, vec![id("job-1")]);
    assert!(engine.queue().is_empty().unwrap());

    let cached = engine.record(&id("job-1")).unwrap().unwrap();
    assert_eq!(cached.sync_status, SyncStatus::Conflict);
    assert_eq!(cached.record.status, JobStatus::InProgress);

    // Further cycles leave the conflict alone until the user decides.
    engine.run_cycle(CycleMode::ForceFull).await.unwrap();
    assert!(engine.record(&id("job-1")).unwrap().unwrap().is_conflict());
    assert!(matches!(
        engine.transition_lifecycle(&id("job-1"), JobStatus::Completed),
        Err(field_sync::SyncError::RecordInConflict(_))
    ));

    let view = engine.conflict_view(&id("job-1")).await.unwrap();
    assert!(view.status_differs());

    let resolved = engine
        .resolve_conflict(&id("job-1"), Resolution::AcceptServer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.sync_status, SyncStatus::Synced);
    assert_eq!(resolved.record.status, JobStatus::Cancelled);
    assert_eq!(resolved.record.version, service.record("job-1").version);
}

#[tokio::test]
async fn test_rejected_transition_is_flagged() {
    init_tracing();
    let service = JobService::new();
    service.seed("job-1", JobStatus::Assigned);
    let engine = memory_engine(&service);
    engine.run_cycle(CycleMode::Delta).await.unwrap();

    engine.transition_lifecycle(&id("job-1"), JobStatus::InProgress).unwrap();
    service.fail_writes(Some(RemoteError::from_status(422, "Cannot transition")));

    let report = engine.run_cycle(CycleMode::Delta).await.unwrap();
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].record_id, Some(id("job-1")));
    assert!(engine.queue().is_empty().unwrap());
    assert!(engine.record(&id("job-1")).unwrap().unwrap().is_conflict());
}

#[tokio::test]
async fn test_server_errors_exhaust_retry_budget() {
    init_tracing();
    let service = JobService::new();
    service.seed("job-1", JobStatus::Assigned);
    let engine = memory_engine(&service);
    engine.run_cycle(CycleMode::Delta).await.unwrap();

    engine.transition_lifecycle(&id("job-1"), JobStatus::InProgress).unwrap();
    service.fail_writes(Some(RemoteError::from_status(500, "boom")));

    for attempt in 1..=2 {
        let report = engine.run_cycle(CycleMode::Delta).await.unwrap();
        assert!(report.conflicts.is_empty());
        let queued = engine.queue().peek_all_ordered().unwrap();
        assert_eq!(queued[0].retry_count, attempt);
        assert!(engine.record(&id("job-1")).unwrap().unwrap().is_pending());
    }

    let report = engine.run_cycle(CycleMode::Delta).await.unwrap();
    assert_eq!(report.conflicts, vec![id("job-1")]);
    assert!(engine.queue().is_empty().unwrap());
    assert!(engine.record(&id("job-1")).unwrap().unwrap().is_conflict());
}

#[tokio::test]
async fn test_notifications_update_and_remove() {
    init_tracing();
    let service = JobService::new();
    service.seed("job-1", JobStatus::Assigned);
    service.seed("job-2", JobStatus::Assigned);
    let engine = memory_engine(&service);
    engine.run_cycle(CycleMode::Delta).await.unwrap();

    let changed = service.touch("job-1", JobStatus::InProgress);
    let event = ChannelEvent::new(
        ChannelEventKind::RecordStatusChanged,
        EventPayload {
            job: changed,
            previous_status: Some(JobStatus::Assigned),
            triggered_by: Some("tech-2".to_string()),
        },
    );
    assert!(engine.apply_notification(&event).unwrap());
    assert_eq!(
        engine.record(&id("job-1")).unwrap().unwrap().record.status,
        JobStatus::InProgress
    );

    let removed = service.record("job-2");
    service.delete("job-2");
    let event = ChannelEvent::new(
        ChannelEventKind::RecordDeleted,
        EventPayload {
            job: removed,
            previous_status: None,
            triggered_by: None,
        },
    );
    assert!(!engine.apply_notification(&event).unwrap());
    assert!(engine.record(&id("job-2")).unwrap().is_none());
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    init_tracing();
    let service = JobService::new();
    service.seed("job-1", JobStatus::Assigned);
    service.seed("job-2", JobStatus::InProgress);
    let engine = memory_engine(&service);

    engine.run_cycle(CycleMode::Delta).await.unwrap();
    let first = snapshot(&engine);
    engine.run_cycle(CycleMode::Delta).await.unwrap();
    assert_eq!(snapshot(&engine), first);

    let records: Vec<JobRecord> = first.iter().map(|r| r.record.clone()).collect();
    engine.cache().upsert(records.clone(), true).unwrap();
    engine.cache().upsert(records, true).unwrap();
    assert_eq!(snapshot(&engine), first);
}

#[tokio::test(start_paused = true)]
async fn test_probe_debounce_and_single_full_resync() {
    init_tracing();
    let service = JobService::new();
    service.seed("job-1", JobStatus::Assigned);
    let config = SyncConfig::default()
        .with_sync_interval(Duration::from_secs(3600))
        .with_realtime_sync_interval(Duration::from_secs(3600));
    let engine = SyncEngine::new(Arc::new(MemoryStore::new()), Arc::clone(&service), config).unwrap();
    let agent = SyncAgent::start(Arc::new(engine), Arc::new(NoChannel));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(service.fetches(), (1, 0));

    service.set_reachable(false);
    tokio::time::sleep(Duration::from_millis(3500)).await;
    let state = agent.monitor().state();
    assert!(state.is_online);
    assert_eq!(state.consecutive_health_failures, 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!agent.monitor().is_online());

    service.set_reachable(true);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(agent.monitor().is_online());
    assert_eq!(service.fetches(), (2, 0));

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(service.fetches(), (2, 0));
    agent.shutdown().await;
}
