//! In-memory local store.
//!
//! `MemoryStore` keeps all three tables in memory behind a single `RwLock`.
//! Nothing survives a restart, so it is meant for tests, development and
//! hosts that bring their own persistence.

use crate::queue::{ActionId, ActionKind, PendingAction};
use crate::record::{CachedRecord, RecordId, SyncStatus};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{LocalStore, StorageError, StorageResult};

/// The three tables.
#[derive(Default)]
pub(crate) struct Tables {
    pub(crate) records: HashMap<RecordId, CachedRecord>,
    pub(crate) actions: BTreeMap<ActionId, PendingAction>,
    pub(crate) meta: BTreeMap<String, String>,
    pub(crate) next_action_id: u64,
}

impl Tables {
    pub(crate) fn upsert_record(&mut self, record: CachedRecord, skip_pending: bool) -> bool {
        if skip_pending {
            if let Some(existing) = self.records.get(record.id()) {
                if existing.has_local_changes() {
                    return false;
                }
            }
        }
        self.records.insert(record.id().clone(), record);
        true
    }

    pub(crate) fn push_action(&mut self, kind: ActionKind, created_at: DateTime<Utc>) -> PendingAction {
        // IDs start at 1 and never repeat, even after the queue empties.
        self.next_action_id = self.next_action_id.max(1);
        let id = ActionId(self.next_action_id);
        self.next_action_id += 1;

        let action = PendingAction {
            id,
            kind,
            created_at,
            retry_count: 0,
            last_error: None,
        };
        self.actions.insert(id, action.clone());
        action
    }

    pub(crate) fn purge_records(&mut self, status: SyncStatus) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.sync_status != status);
        before - self.records.len()
    }
}

/// In-memory implementation of `LocalStore`
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| StorageError::LockPoisoned)
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| StorageError::LockPoisoned)
    }
}

impl LocalStore for MemoryStore {
    fn upsert_record(&self, record: CachedRecord, skip_pending: bool) -> StorageResult<bool> {
        Ok(self.write()?.upsert_record(record, skip_pending))
    }

    fn upsert_records(&self, records: Vec<CachedRecord>, skip_pending: bool) -> StorageResult<usize> {
        let mut tables = self.write()?;
        let mut written = 0;
        for record in records {
            if tables.upsert_record(record, skip_pending) {
                written += 1;
            }
        }
        Ok(written)
    }

    fn update_record(
        &self,
        id: &RecordId,
        f: &mut dyn FnMut(&mut CachedRecord),
    ) -> StorageResult<Option<CachedRecord>> {
        let mut tables = self.write()?;
        Ok(tables.records.get_mut(id).map(|record| {
            f(record);
            record.clone()
        }))
    }

    fn get_record(&self, id: &RecordId) -> StorageResult<Option<CachedRecord>> {
        Ok(self.read()?.records.get(id).cloned())
    }

    fn list_records(&self) -> StorageResult<Vec<CachedRecord>> {
        Ok(self.read()?.records.values().cloned().collect())
    }

    fn remove_record(&self, id: &RecordId) -> StorageResult<bool> {
        Ok(self.write()?.records.remove(id).is_some())
    }

    fn purge_records(&self, status: SyncStatus) -> StorageResult<usize> {
        Ok(self.write()?.purge_records(status))
    }

    fn push_action(&self, kind: ActionKind, created_at: DateTime<Utc>) -> StorageResult<PendingAction> {
        Ok(self.write()?.push_action(kind, created_at))
    }

    fn list_actions(&self) -> StorageResult<Vec<PendingAction>> {
        Ok(self.read()?.actions.values().cloned().collect())
    }

    fn update_action(
        &self,
        id: ActionId,
        f: &mut dyn FnMut(&mut PendingAction),
    ) -> StorageResult<Option<PendingAction>> {
        let mut tables = self.write()?;
        Ok(tables.actions.get_mut(&id).map(|action| {
            f(action);
            action.clone()
        }))
    }

    fn remove_action(&self, id: ActionId) -> StorageResult<bool> {
        Ok(self.write()?.actions.remove(&id).is_some())
    }

    fn get_meta(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.read()?.meta.get(key).cloned())
    }

    fn set_meta(&self, key: &str, value: &str) -> StorageResult<()> {
        self.write()?.meta.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_meta(&self, key: &str) -> StorageResult<()> {
        self.write()?.meta.remove(key);
        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        let mut tables = self.write()?;
        let next_action_id = tables.next_action_id;
        *tables = Tables::default();
        tables.next_action_id = next_action_id;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::job;
    use crate::record::JobStatus;

    #[test]
    fn test_upsert_respects_pending() {
        let store = MemoryStore::new();
        let mut pending = CachedRecord::synced(job("job-1", JobStatus::InProgress, "e1", 0));
        pending.sync_status = SyncStatus::Pending;
        store.upsert_record(pending, false).unwrap();

        let incoming = CachedRecord::synced(job("job-1", JobStatus::Assigned, "e2", 5));
        assert!(!store.upsert_record(incoming.clone(), true).unwrap());
        let stored = store.get_record(&RecordId::new("job-1")).unwrap().unwrap();
        assert_eq!(stored.record.status, JobStatus::InProgress);

        assert!(store.upsert_record(incoming, false).unwrap());
        let stored = store.get_record(&RecordId::new("job-1")).unwrap().unwrap();
        assert_eq!(stored.record.status, JobStatus::Assigned);
    }

    #[test]
    fn test_purge_by_status() {
        let store = MemoryStore::new();
        store
            .upsert_record(CachedRecord::synced(job("a", JobStatus::Pending, "e", 0)), false)
            .unwrap();
        let mut conflict = CachedRecord::synced(job("b", JobStatus::Pending, "e", 0));
        conflict.sync_status = SyncStatus::Conflict;
        store.upsert_record(conflict, false).unwrap();

        assert_eq!(store.purge_records(SyncStatus::Synced).unwrap(), 1);
        assert_eq!(store.list_records().unwrap().len(), 1);
        assert!(store.get_record(&RecordId::new("b")).unwrap().is_some());
    }

    #[test]
    fn test_action_ids_survive_clear() {
        let store = MemoryStore::new();
        let first = store
            .push_action(
                ActionKind::UpdateLifecycleState {
                    record_id: RecordId::new("a"),
                    status: JobStatus::Assigned,
                    version: crate::record::VersionToken::new("e"),
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(first.id, ActionId(1));

        store.clear().unwrap();
        assert!(store.list_actions().unwrap().is_empty());

        let second = store
            .push_action(
                ActionKind::CreateRecord(crate::record::fixtures::new_job("x")),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(second.id, ActionId(2));
    }

    #[test]
    fn test_meta_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get_meta("k").unwrap().is_none());
        store.set_meta("k", "v").unwrap();
        assert_eq!(store.get_meta("k").unwrap().as_deref(), Some("v"));
        store.remove_meta("k").unwrap();
        assert!(store.get_meta("k").unwrap().is_none());
    }
}
