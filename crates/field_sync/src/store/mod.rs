//! Durable local state for the sync engine.
//!
//! The `LocalStore` trait provides the three tables the engine persists:
//!
//! - a cache table of records keyed by record ID
//! - an append-only queue table of write intents keyed by a monotonic ID
//! - a key-value metadata table (sync cursor, schema markers)
//!
//! Every method is synchronous and atomic for a single row. Nothing spans
//! rows, so callers must not assume multi-record atomicity.

pub mod file_store;
pub mod memory_store;

use crate::queue::{ActionId, ActionKind, PendingAction};
use crate::record::{CachedRecord, RecordId, SyncStatus};
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use file_store::FileStore;
pub use memory_store::MemoryStore;

/// Current layout version of the persisted state.
pub const SCHEMA_VERSION: u32 = 2;

/// Metadata key holding the schema version marker.
pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A persisted file could not be parsed
    #[error("Corrupt data in {file}: {message}")]
    Corrupt { file: String, message: String },

    /// A lock guarding the store was poisoned by a panicking writer
    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for local storage backends
///
/// Implementations must be safe to share behind an `Arc`; methods take
/// `&self` and use interior locking.
pub trait LocalStore: Send + Sync {
    // ========== Cache table ==========

    /// Insert or replace a record.
    ///
    /// When `skip_pending` is set and the stored copy is `pending` or
    /// `conflict`, nothing is written and `false` is returned. The check and
    /// the write are atomic.
    fn upsert_record(&self, record: CachedRecord, skip_pending: bool) -> StorageResult<bool>;

    /// Insert or replace a batch of records under one lock and one write.
    ///
    /// Applies the same `skip_pending` rule as [`LocalStore::upsert_record`]
    /// to each record. Returns how many were written.
    fn upsert_records(&self, records: Vec<CachedRecord>, skip_pending: bool) -> StorageResult<usize>;

    /// Modify a stored record in place. Returns the updated record, or `None`
    /// if no record with that ID exists.
    fn update_record(
        &self,
        id: &RecordId,
        f: &mut dyn FnMut(&mut CachedRecord),
    ) -> StorageResult<Option<CachedRecord>>;

    /// Get a record by ID.
    fn get_record(&self, id: &RecordId) -> StorageResult<Option<CachedRecord>>;

    /// Get every cached record, in no particular order.
    fn list_records(&self) -> StorageResult<Vec<CachedRecord>>;

    /// Remove a record. Returns whether it existed.
    fn remove_record(&self, id: &RecordId) -> StorageResult<bool>;

    /// Remove every record with the given status. Returns how many were removed.
    fn purge_records(&self, status: SyncStatus) -> StorageResult<usize>;

    // ========== Queue table ==========

    /// Append a write intent, assigning the next monotonic ID.
    fn push_action(&self, kind: ActionKind, created_at: DateTime<Utc>) -> StorageResult<PendingAction>;

    /// All queued actions ordered by ID, oldest first.
    fn list_actions(&self) -> StorageResult<Vec<PendingAction>>;

    /// Modify a queued action in place. Returns the updated action, or `None`
    /// if it is no longer queued.
    fn update_action(
        &self,
        id: ActionId,
        f: &mut dyn FnMut(&mut PendingAction),
    ) -> StorageResult<Option<PendingAction>>;

    /// Remove a queued action. Returns whether it existed.
    fn remove_action(&self, id: ActionId) -> StorageResult<bool>;

    // ========== Metadata table ==========

    fn get_meta(&self, key: &str) -> StorageResult<Option<String>>;

    fn set_meta(&self, key: &str, value: &str) -> StorageResult<()>;

    fn remove_meta(&self, key: &str) -> StorageResult<()>;

    /// Drop every record, queued action and metadata entry.
    fn clear(&self) -> StorageResult<()>;
}

/// Bring persisted state up to [`SCHEMA_VERSION`].
///
/// Older layouts may be missing fields that only a full fetch fills in, so an
/// upgrade drops the sync cursor and the next cycle runs a full resync.
/// Returns `true` if a migration ran.
pub fn run_migrations<S: LocalStore + ?Sized>(store: &S) -> StorageResult<bool> {
    let current = store
        .get_meta(SCHEMA_VERSION_KEY)?
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);

    if current >= SCHEMA_VERSION {
        return Ok(false);
    }

    tracing::info!(
        "Migrating local store from schema v{} to v{}",
        current,
        SCHEMA_VERSION
    );
    store.remove_meta(crate::cursor::LAST_SYNC_KEY)?;
    store.set_meta(SCHEMA_VERSION_KEY, &SCHEMA_VERSION.to_string())?;
    Ok(true)
}
