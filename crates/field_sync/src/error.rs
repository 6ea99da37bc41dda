//! Error types for the sync engine.

use crate::record::{JobStatus, RecordId};
use crate::remote::RemoteError;
use crate::store::StorageError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the engine's public API.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The local store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The remote service failed.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The record is not in the local cache.
    #[error("Record not found in cache: {0}")]
    RecordNotFound(RecordId),

    /// The lifecycle transition is not allowed.
    #[error("Cannot transition from '{from}' to '{to}'")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// The cached record has no concurrency token to guard a write with.
    #[error("Record {0} has no version token")]
    MissingVersionToken(RecordId),

    /// The record has an unresolved conflict and must be resolved first.
    #[error("Record {0} has an unresolved conflict")]
    RecordInConflict(RecordId),

    /// The record is not in conflict.
    #[error("Record {0} is not in conflict")]
    NoConflict(RecordId),

    /// A payload failed local validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Another reconciliation cycle is already running.
    #[error("A sync cycle is already in progress")]
    AlreadySyncing,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the error came from a transient network condition.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Remote(e) if e.is_transient())
    }
}
