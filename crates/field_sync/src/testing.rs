//! In-process remote service for unit tests.

use crate::lifecycle;
use crate::realtime::{ChannelConnection, ChannelEvent, ChannelGrant, ChannelTransport, SessionIdentity};
use crate::record::{JobRecord, JobStatus, NewJob, RecordId, VersionToken};
use crate::remote::{DeltaResponse, RemoteError, RemoteService};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
pub(crate) struct Calls {
    pub creates: usize,
    pub updates: usize,
    pub full_fetches: usize,
    pub delta_fetches: usize,
    pub fetch_by_id: usize,
    pub probes: usize,
    pub negotiations: usize,
}

struct State {
    records: BTreeMap<RecordId, JobRecord>,
    clock: DateTime<Utc>,
    next_id: u64,
    next_etag: u64,
    write_failures: VecDeque<RemoteError>,
    fetch_failures: VecDeque<RemoteError>,
    reachable: bool,
    calls: Calls,
}

/// A remote service holding records in memory.
///
/// Writes enforce the lifecycle table and the version token. Failures can be
/// scripted per call kind; while unreachable every call fails with
/// [`RemoteError::Unreachable`] and probes report `false`.
pub(crate) struct FakeRemote {
    state: Mutex<State>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                records: BTreeMap::new(),
                clock: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
                next_id: 1,
                next_etag: 100,
                write_failures: VecDeque::new(),
                fetch_failures: VecDeque::new(),
                reachable: true,
                calls: Calls::default(),
            }),
        }
    }

    /// Store a server-side record as is.
    pub fn seed(&self, record: JobRecord) {
        let mut state = self.state.lock().unwrap();
        state.records.insert(record.id.clone(), record);
    }

    /// Change a record as another device would, returning the new copy.
    pub fn touch(&self, id: &str, status: JobStatus) -> JobRecord {
        let mut state = self.state.lock().unwrap();
        let (clock, etag) = state.stamp();
        let record = state.records.get_mut(&RecordId::new(id)).unwrap();
        record.status = status;
        record.updated_at = clock;
        record.version = Some(etag);
        record.clone()
    }

    pub fn delete(&self, id: &str) {
        self.state.lock().unwrap().records.remove(&RecordId::new(id));
    }

    pub fn record(&self, id: &str) -> Option<JobRecord> {
        self.state.lock().unwrap().records.get(&RecordId::new(id)).cloned()
    }

    pub fn fail_next_write(&self, error: RemoteError) {
        self.state.lock().unwrap().write_failures.push_back(error);
    }

    pub fn fail_next_fetch(&self, error: RemoteError) {
        self.state.lock().unwrap().fetch_failures.push_back(error);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    pub fn calls<T>(&self, f: impl FnOnce(&Calls) -> T) -> T {
        f(&self.state.lock().unwrap().calls)
    }

    fn check_reachable(state: &State) -> Result<(), RemoteError> {
        if state.reachable {
            Ok(())
        } else {
            Err(RemoteError::Unreachable("connection refused".to_string()))
        }
    }
}

impl State {
    fn stamp(&mut self) -> (DateTime<Utc>, VersionToken) {
        self.clock += Duration::seconds(1);
        self.next_etag += 1;
        (self.clock, VersionToken::new(format!("etag-{}", self.next_etag)))
    }
}

impl RemoteService for FakeRemote {
    async fn create_record(&self, job: &NewJob) -> Result<JobRecord, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.creates += 1;
        Self::check_reachable(&state)?;
        if let Some(error) = state.write_failures.pop_front() {
            return Err(error);
        }
        job.validate().map_err(RemoteError::Validation)?;

        let (clock, etag) = state.stamp();
        let id = RecordId::new(format!("job-new-{}", state.next_id));
        state.next_id += 1;
        let record = JobRecord {
            id: id.clone(),
            title: job.title.clone(),
            description: job.description.clone(),
            status: JobStatus::Pending,
            priority: job.priority,
            tenant_id: "tenant-1".to_string(),
            vendor_id: job.vendor_id.clone(),
            created_by: "user-1".to_string(),
            created_by_name: None,
            assigned_to: None,
            assigned_to_name: None,
            location: job.location.clone(),
            created_at: clock,
            updated_at: clock,
            version: Some(etag),
            thumbnail_url: None,
        };
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
        state.calls.updates += 1;
        Self::check_reachable(&state)?;
        if let Some(error) = state.write_failures.pop_front() {
            return Err(error);
        }

        let current = state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        if current.version.as_ref() != Some(token) {
            return Err(RemoteError::VersionMismatch(format!("stale token for {}", id)));
        }
        if !lifecycle::can_transition_to(current.status, status) {
            return Err(RemoteError::InvalidTransition(format!(
                "{} -> {}",
                current.status, status
            )));
        }

        let (clock, etag) = state.stamp();
        let record = state.records.get_mut(id).unwrap();
        record.status = status;
        record.updated_at = clock;
        record.version = Some(etag);
        Ok(record.clone())
    }

    async fn fetch_record(&self, id: &RecordId) -> Result<JobRecord, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.fetch_by_id += 1;
        Self::check_reachable(&state)?;
        state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn delta_fetch(&self, since: Option<DateTime<Utc>>) -> Result<DeltaResponse, RemoteError> {
        let mut state = self.state.lock().unwrap();
        match since {
            Some(_) => state.calls.delta_fetches += 1,
            None => state.calls.full_fetches += 1,
        }
        Self::check_reachable(&state)?;
        if let Some(error) = state.fetch_failures.pop_front() {
            return Err(error);
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
        let mut state = self.state.lock().unwrap();
        state.calls.probes += 1;
        state.reachable
    }

    async fn negotiate(&self, session: &SessionIdentity) -> Result<ChannelGrant, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.negotiations += 1;
        Self::check_reachable(&state)?;
        Ok(ChannelGrant {
            url: "wss://hub.example.test/client/?hub=jobs".to_string(),
            access_token: format!("hub-token-{}", session.user_id),
        })
    }
}

/// Channel transport whose connections are driven by the test.
pub(crate) struct FakeTransport {
    failures: Mutex<VecDeque<RemoteError>>,
    senders: Mutex<Vec<mpsc::Sender<ChannelEvent>>>,
    grants: Mutex<Vec<ChannelGrant>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(VecDeque::new()),
            senders: Mutex::new(Vec::new()),
            grants: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_next(&self, count: usize) {
        let mut failures = self.failures.lock().unwrap();
        for _ in 0..count {
            failures.push_back(RemoteError::Unreachable("refused".into()));
        }
    }

    /// Connection attempts so far.
    pub fn connects(&self) -> usize {
        self.grants.lock().unwrap().len()
    }

    /// Sender feeding the most recent connection.
    pub fn latest(&self) -> mpsc::Sender<ChannelEvent> {
        self.senders.lock().unwrap().last().cloned().unwrap()
    }

    /// Drop every open connection from the server side.
    pub fn drop_connections(&self) {
        self.senders.lock().unwrap().clear();
    }
}

impl ChannelTransport for FakeTransport {
    async fn connect(&self, grant: &ChannelGrant) -> Result<ChannelConnection, RemoteError> {
        self.grants.lock().unwrap().push(grant.clone());
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(8);
        self.senders.lock().unwrap().push(tx);
        Ok(ChannelConnection::new(rx))
    }
}
