//! Job lifecycle rules and write-outcome classification.
//!
//! ```text
//! pending ──▶ assigned ──▶ in-progress ──▶ completed
//!    │           │              │
//!    └───────────┴──────────────┴────────▶ cancelled
//! ```
//!
//! Completed and cancelled jobs are terminal. The remote service enforces the
//! same table; checking it locally keeps certain-to-fail updates out of the
//! queue.

use crate::error::{SyncError, SyncResult};
use crate::record::{CachedRecord, JobRecord, JobStatus};
use crate::remote::RemoteError;

/// States a job may move to from `from`.
pub fn allowed_transitions(from: JobStatus) -> &'static [JobStatus] {
    match from {
        JobStatus::Pending => &[JobStatus::Assigned, JobStatus::Cancelled],
        JobStatus::Assigned => &[JobStatus::InProgress, JobStatus::Cancelled],
        JobStatus::InProgress => &[JobStatus::Completed, JobStatus::Cancelled],
        JobStatus::Completed | JobStatus::Cancelled => &[],
    }
}

pub fn can_transition_to(from: JobStatus, to: JobStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

/// The primary forward step from `status`, if any.
///
/// Cancellation is always a side exit and never the primary step.
pub fn next_status(status: JobStatus) -> Option<JobStatus> {
    match status {
        JobStatus::Pending => Some(JobStatus::Assigned),
        JobStatus::Assigned => Some(JobStatus::InProgress),
        JobStatus::InProgress => Some(JobStatus::Completed),
        JobStatus::Completed | JobStatus::Cancelled => None,
    }
}

pub fn is_terminal(status: JobStatus) -> bool {
    allowed_transitions(status).is_empty()
}

/// Check a transition before it is applied locally.
pub fn validate_transition(from: JobStatus, to: JobStatus) -> SyncResult<()> {
    if can_transition_to(from, to) {
        Ok(())
    } else {
        Err(SyncError::InvalidTransition { from, to })
    }
}

/// How a queued write ended when sent to the remote service.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOutcome {
    /// The server accepted the write and returned the authoritative record.
    Applied(JobRecord),
    /// The version token no longer matched the server copy.
    Conflict(String),
    /// The server refused the write; retrying cannot succeed.
    Rejected(String),
    /// The server could not be reached in time; try again next cycle.
    Transient(String),
    /// Any other failure; counts against the retry budget.
    Failed(String),
}

impl WriteOutcome {
    pub fn classify(result: Result<JobRecord, RemoteError>) -> Self {
        match result {
            Ok(record) => WriteOutcome::Applied(record),
            Err(e) if e.is_version_mismatch() => WriteOutcome::Conflict(e.to_string()),
            Err(e) if e.is_rejection() => WriteOutcome::Rejected(e.to_string()),
            Err(e) if e.is_transient() => WriteOutcome::Transient(e.to_string()),
            Err(e) => WriteOutcome::Failed(e.to_string()),
        }
    }
}

/// A user's decision on a conflicting record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Drop the local change and take the server copy.
    AcceptServer,
    /// Fetch the latest server version so the change can be re-applied
    /// against a fresh token.
    RetryMine,
}

/// Local and server values of a conflicting record, for presentation.
#[derive(Clone, Debug, PartialEq)]
pub struct ConflictView {
    pub local: CachedRecord,
    /// `None` when the server copy could not be fetched.
    pub server: Option<JobRecord>,
}

impl ConflictView {
    /// Whether the two sides disagree on the lifecycle state.
    pub fn status_differs(&self) -> bool {
        self.server
            .as_ref()
            .is_some_and(|server| server.status != self.local.record.status)
    }
}
