//! Local cache store: the latest known copy of every record.
//!
//! Every record carries a sync status. A `pending` record holds a local change
//! the server has not acknowledged yet; a `conflict` record holds one the
//! server refused. Neither is replaced by incoming sync payloads while
//! `skip_pending` is set.

use crate::record::{CachedRecord, JobRecord, JobStatus, RecordId, RecordPatch, SyncStatus, VersionToken};
use crate::store::{LocalStore, StorageResult};
use chrono::Utc;
use std::sync::Arc;

/// Cache over a [`LocalStore`].
pub struct LocalCache<S: LocalStore> {
    store: Arc<S>,
}

impl<S: LocalStore> Clone for LocalCache<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LocalStore> LocalCache<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Store server records as `synced`.
    ///
    /// With `skip_pending`, a record whose cached copy is `pending` or
    /// `conflict` is left alone. Returns how many records were written.
    pub fn upsert(&self, records: Vec<JobRecord>, skip_pending: bool) -> StorageResult<usize> {
        let records = records.into_iter().map(CachedRecord::synced).collect();
        self.store.upsert_records(records, skip_pending)
    }

    /// All cached records, optionally limited to one lifecycle state, most
    /// recently updated first.
    pub fn get(&self, status: Option<JobStatus>) -> StorageResult<Vec<CachedRecord>> {
        let mut records: Vec<CachedRecord> = self
            .store
            .list_records()?
            .into_iter()
            .filter(|r| status.map_or(true, |s| r.record.status == s))
            .collect();
        records.sort_by(|a, b| {
            b.record
                .updated_at
                .cmp(&a.record.updated_at)
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(records)
    }

    pub fn get_by_id(&self, id: &RecordId) -> StorageResult<Option<CachedRecord>> {
        self.store.get_record(id)
    }

    /// Apply a local change ahead of the server: set the fields, bump
    /// `updated_at` to now and mark the record `pending`.
    pub fn apply_optimistic_mutation(
        &self,
        id: &RecordId,
        patch: &RecordPatch,
    ) -> StorageResult<Option<CachedRecord>> {
        let now = Utc::now();
        self.store.update_record(id, &mut |cached| {
            patch.apply_to(&mut cached.record);
            cached.record.updated_at = now;
            cached.sync_status = SyncStatus::Pending;
        })
    }

    pub fn remove(&self, id: &RecordId) -> StorageResult<bool> {
        self.store.remove_record(id)
    }

    /// Set the sync status of a record. Returns `false` if it is not cached.
    pub fn mark_status(&self, id: &RecordId, status: SyncStatus) -> StorageResult<bool> {
        Ok(self
            .store
            .update_record(id, &mut |cached| cached.sync_status = status)?
            .is_some())
    }

    /// Replace the version token of a cached record, leaving its fields and
    /// sync status alone.
    pub fn set_version(&self, id: &RecordId, version: VersionToken) -> StorageResult<bool> {
        Ok(self
            .store
            .update_record(id, &mut |cached| cached.record.version = Some(version.clone()))?
            .is_some())
    }

    /// Drop every `synced` record ahead of a full resync.
    pub fn purge_synced(&self) -> StorageResult<usize> {
        self.store.purge_records(SyncStatus::Synced)
    }

    /// Records currently in conflict, most recently updated first.
    pub fn conflicts(&self) -> StorageResult<Vec<CachedRecord>> {
        Ok(self
            .get(None)?
            .into_iter()
            .filter(CachedRecord::is_conflict)
            .collect())
    }
}
