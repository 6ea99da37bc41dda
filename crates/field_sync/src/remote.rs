//! Contract of the remote job service consumed by the engine.
//!
//! The service itself (HTTP routes, authorization, lifecycle enforcement) lives
//! elsewhere; this module only defines the calls the engine makes and how
//! their failures are classified.

use crate::record::{JobRecord, JobStatus, NewJob, RecordId, VersionToken};
use crate::realtime::{ChannelGrant, SessionIdentity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Response of a delta fetch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaResponse {
    /// Records changed since the requested cursor (all visible records on a full fetch).
    #[serde(rename = "data")]
    pub records: Vec<JobRecord>,
    /// Server time the response was produced; becomes the next cursor.
    pub sync_timestamp: DateTime<Utc>,
}

/// Errors reported by the remote service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The call did not complete within its deadline.
    #[error("Request timed out")]
    Timeout,

    /// The service could not be reached.
    #[error("Service unreachable: {0}")]
    Unreachable(String),

    /// The concurrency token no longer matches the server copy (409).
    #[error("Version conflict: {0}")]
    VersionMismatch(String),

    /// The requested lifecycle transition is not allowed (422).
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The record does not exist or is not visible (404).
    #[error("Record not found: {0}")]
    NotFound(String),

    /// The payload failed server-side validation (400).
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Any other server error.
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },
}

impl RemoteError {
    /// Map an HTTP status and message to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => RemoteError::Validation(message),
            404 => RemoteError::NotFound(message),
            408 | 504 => RemoteError::Timeout,
            409 => RemoteError::VersionMismatch(message),
            422 => RemoteError::InvalidTransition(message),
            _ => RemoteError::Server { status, message },
        }
    }

    /// Failures that are retried on the next cycle without counting against
    /// the retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Timeout | RemoteError::Unreachable(_))
    }

    /// Failures that retrying cannot fix.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RemoteError::InvalidTransition(_) | RemoteError::NotFound(_) | RemoteError::Validation(_)
        )
    }

    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, RemoteError::VersionMismatch(_))
    }
}

/// Remote job service.
///
/// Every call may be cancelled by dropping its future; the engine wraps each
/// one in a timeout and treats an elapsed deadline as [`RemoteError::Timeout`].
#[trait_variant::make(Send)]
pub trait RemoteService: Send + Sync {
    /// Create a job and return the authoritative record.
    async fn create_record(&self, job: &NewJob) -> Result<JobRecord, RemoteError>;

    /// Move a job to `status`, guarded by the concurrency token observed
    /// when the change was made.
    async fn update_lifecycle_state(
        &self,
        id: &RecordId,
        status: JobStatus,
        token: &VersionToken,
    ) -> Result<JobRecord, RemoteError>;

    /// Fetch a single record.
    async fn fetch_record(&self, id: &RecordId) -> Result<JobRecord, RemoteError>;

    /// Fetch records changed since `since`, or every visible record when `None`.
    async fn delta_fetch(&self, since: Option<DateTime<Utc>>) -> Result<DeltaResponse, RemoteError>;

    /// Liveness probe.
    async fn probe(&self) -> bool;

    /// Obtain a real-time channel grant for the session.
    async fn negotiate(&self, session: &SessionIdentity) -> Result<ChannelGrant, RemoteError>;
}
