//! Sync cursor persisted in the metadata table.
//!
//! The cursor is the server timestamp of the last successful fetch plus a
//! counter of reconciliation cycles. The counter decides when a delta cycle
//! is upgraded to a full resync.

use crate::store::{LocalStore, StorageResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Metadata key of the last successful fetch timestamp.
pub const LAST_SYNC_KEY: &str = "lastSyncTimestamp";

/// Metadata key of the reconciliation cycle counter.
pub const CYCLE_COUNT_KEY: &str = "syncCycleCount";

/// Default number of cycles between full resyncs.
pub const FULL_RESYNC_EVERY: u64 = 5;

/// Persisted reconciliation cursor.
pub struct SyncCursor<S: LocalStore> {
    store: Arc<S>,
    full_resync_every: u64,
}

impl<S: LocalStore> SyncCursor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_full_resync_every(store, FULL_RESYNC_EVERY)
    }

    pub fn with_full_resync_every(store: Arc<S>, every: u64) -> Self {
        Self {
            store,
            full_resync_every: every.max(1),
        }
    }

    /// Timestamp of the last successful fetch, if any.
    ///
    /// An unparseable value is treated as absent, which makes the next cycle
    /// a full resync.
    pub fn last_sync(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let Some(raw) = self.store.get_meta(LAST_SYNC_KEY)? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
            Err(e) => {
                tracing::warn!("Ignoring unreadable sync cursor {:?}: {}", raw, e);
                Ok(None)
            }
        }
    }

    /// Advance the cursor to a server-reported timestamp.
    pub fn advance(&self, timestamp: DateTime<Utc>) -> StorageResult<()> {
        self.store.set_meta(LAST_SYNC_KEY, &timestamp.to_rfc3339())
    }

    /// Forget the last fetch so the next cycle fetches everything.
    pub fn reset(&self) -> StorageResult<()> {
        self.store.remove_meta(LAST_SYNC_KEY)
    }

    pub fn cycle_count(&self) -> StorageResult<u64> {
        Ok(self
            .store
            .get_meta(CYCLE_COUNT_KEY)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Count a reconciliation cycle and return the new count.
    pub fn next_cycle(&self) -> StorageResult<u64> {
        let count = self.cycle_count()? + 1;
        self.store.set_meta(CYCLE_COUNT_KEY, &count.to_string())?;
        Ok(count)
    }

    /// Whether a cycle with the given count must fetch everything.
    pub fn is_full_resync_due(&self, last_sync: Option<DateTime<Utc>>, cycle: u64) -> bool {
        last_sync.is_none() || cycle % self.full_resync_every == 0
    }
}
