//! File-based local store.
//!
//! `FileStore` keeps the three tables in memory and writes every change
//! through to disk before it becomes visible.
//!
//! # Directory Structure
//!
//! ```text
//! data/
//! ├── records.json     # Cache table (array of cached records)
//! ├── actions.jsonl    # Queue table, one action per line, oldest first
//! └── metadata.json    # Key-value metadata and the next action ID
//! ```
//!
//! New actions are appended to `actions.jsonl`; updates and removals rewrite
//! it. Every rewrite goes through a temporary file and an atomic rename, so a
//! crash leaves either the old or the new file. A torn final line in the
//! action log (crash mid-append) is dropped on load and the log is rewritten
//! without it. Cache upserts from one fetch are written as a single batch.

use crate::queue::{ActionId, ActionKind, PendingAction};
use crate::record::{CachedRecord, RecordId, SyncStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::memory_store::Tables;
use super::{LocalStore, StorageError, StorageResult};

/// File names used for storage
const RECORDS_FILE: &str = "records.json";
const ACTIONS_FILE: &str = "actions.jsonl";
const METADATA_FILE: &str = "metadata.json";

/// Contents of `metadata.json`
#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataFile {
    next_action_id: u64,
    entries: BTreeMap<String, String>,
}

/// File-based implementation of `LocalStore`
///
/// Reads are served from memory. Writers hold the table lock while they
/// persist, so changes reach disk in the order they were made.
pub struct FileStore {
    /// Base directory for all files
    base_path: PathBuf,
    tables: RwLock<Tables>,
}

impl FileStore {
    /// Open (or create) a store in the given directory
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or an existing
    /// file cannot be parsed.
    pub fn open(base_path: impl AsRef<Path>) -> StorageResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let store = Self {
            base_path,
            tables: RwLock::new(Tables::default()),
        };
        let tables = store.load()?;
        tracing::debug!(
            "Opened local store at {:?}: {} records, {} queued actions",
            store.base_path,
            tables.records.len(),
            tables.actions.len()
        );
        *store.write()? = tables;

        Ok(store)
    }

    /// The directory this store lives in
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn records_path(&self) -> PathBuf {
        self.base_path.join(RECORDS_FILE)
    }

    fn actions_path(&self) -> PathBuf {
        self.base_path.join(ACTIONS_FILE)
    }

    fn metadata_path(&self) -> PathBuf {
        self.base_path.join(METADATA_FILE)
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| StorageError::LockPoisoned)
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| StorageError::LockPoisoned)
    }

    // ========== Loading ==========

    fn load(&self) -> StorageResult<Tables> {
        let mut tables = Tables::default();

        let records_path = self.records_path();
        if records_path.exists() {
            let reader = BufReader::new(File::open(&records_path)?);
            let records: Vec<CachedRecord> =
                serde_json::from_reader(reader).map_err(|e| corrupt(RECORDS_FILE, e))?;
            tables.records = records
                .into_iter()
                .map(|r| (r.id().clone(), r))
                .collect();
        }

        let metadata_path = self.metadata_path();
        if metadata_path.exists() {
            let reader = BufReader::new(File::open(&metadata_path)?);
            let metadata: MetadataFile =
                serde_json::from_reader(reader).map_err(|e| corrupt(METADATA_FILE, e))?;
            tables.meta = metadata.entries;
            tables.next_action_id = metadata.next_action_id;
        }

        let (actions, torn) = self.read_actions()?;
        if torn {
            // Rewrite the log so the next append starts on a clean line.
            self.write_actions(&actions)?;
        }
        tables.actions = actions;
        if let Some(last) = tables.actions.keys().next_back() {
            tables.next_action_id = tables.next_action_id.max(last.0 + 1);
        }

        Ok(tables)
    }

    /// Read the action log. The flag reports a dropped torn final line.
    fn read_actions(&self) -> StorageResult<(BTreeMap<ActionId, PendingAction>, bool)> {
        let mut actions = BTreeMap::new();
        let mut torn = false;
        let path = self.actions_path();
        if !path.exists() {
            return Ok((actions, torn));
        }

        let reader = BufReader::new(File::open(&path)?);
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
        let last_index = lines.len().saturating_sub(1);

        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PendingAction>(line) {
                Ok(action) => {
                    actions.insert(action.id, action);
                }
                Err(e) if index == last_index => {
                    tracing::warn!("Dropping torn entry at end of {}: {}", ACTIONS_FILE, e);
                    torn = true;
                }
                Err(e) => return Err(corrupt(ACTIONS_FILE, e)),
            }
        }

        Ok((actions, torn))
    }

    // ========== Persistence ==========

    fn write_records(&self, records: &HashMap<RecordId, CachedRecord>) -> StorageResult<()> {
        let mut sorted: Vec<&CachedRecord> = records.values().collect();
        sorted.sort_by(|a, b| a.id().cmp(b.id()));
        write_atomic(&self.records_path(), |writer| {
            serde_json::to_writer(writer, &sorted)?;
            Ok(())
        })
    }

    fn write_actions(&self, actions: &BTreeMap<ActionId, PendingAction>) -> StorageResult<()> {
        write_atomic(&self.actions_path(), |writer| {
            for action in actions.values() {
                serde_json::to_writer(&mut *writer, action)?;
                writeln!(writer)?;
            }
            Ok(())
        })
    }

    fn append_action(&self, action: &PendingAction) -> StorageResult<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.actions_path())?;

        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, action)?;
        writeln!(writer)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn write_metadata(&self, entries: &BTreeMap<String, String>, next_action_id: u64) -> StorageResult<()> {
        let metadata = MetadataFile {
            next_action_id,
            entries: entries.clone(),
        };
        write_atomic(&self.metadata_path(), |writer| {
            serde_json::to_writer_pretty(writer, &metadata)?;
            Ok(())
        })
    }
}

/// Write a file through a temporary sibling and rename it into place.
fn write_atomic(
    path: &Path,
    fill: impl FnOnce(&mut BufWriter<File>) -> StorageResult<()>,
) -> StorageResult<()> {
    let temp_path = path.with_extension("tmp");
    {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        fill(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
    }
    fs::rename(temp_path, path)?;
    Ok(())
}

fn corrupt(file: &str, err: serde_json::Error) -> StorageError {
    StorageError::Corrupt {
        file: file.to_string(),
        message: err.to_string(),
    }
}

impl LocalStore for FileStore {
    fn upsert_record(&self, record: CachedRecord, skip_pending: bool) -> StorageResult<bool> {
        let mut tables = self.write()?;
        if skip_pending && tables.records.get(record.id()).is_some_and(|r| r.has_local_changes()) {
            return Ok(false);
        }
        let mut records = tables.records.clone();
        records.insert(record.id().clone(), record);

        self.write_records(&records)?;
        tables.records = records;
        Ok(true)
    }

    fn upsert_records(&self, incoming: Vec<CachedRecord>, skip_pending: bool) -> StorageResult<usize> {
        let mut tables = self.write()?;
        let mut records = tables.records.clone();
        let mut written = 0;
        for record in incoming {
            if skip_pending && records.get(record.id()).is_some_and(|r| r.has_local_changes()) {
                continue;
            }
            records.insert(record.id().clone(), record);
            written += 1;
        }
        if written == 0 {
            return Ok(0);
        }

        self.write_records(&records)?;
        tables.records = records;
        Ok(written)
    }

    fn update_record(
        &self,
        id: &RecordId,
        f: &mut dyn FnMut(&mut CachedRecord),
    ) -> StorageResult<Option<CachedRecord>> {
        let mut tables = self.write()?;
        let mut records = tables.records.clone();
        let Some(record) = records.get_mut(id) else {
            return Ok(None);
        };
        f(record);
        let updated = record.clone();

        self.write_records(&records)?;
        tables.records = records;
        Ok(Some(updated))
    }

    fn get_record(&self, id: &RecordId) -> StorageResult<Option<CachedRecord>> {
        Ok(self.read()?.records.get(id).cloned())
    }

    fn list_records(&self) -> StorageResult<Vec<CachedRecord>> {
        Ok(self.read()?.records.values().cloned().collect())
    }

    fn remove_record(&self, id: &RecordId) -> StorageResult<bool> {
        let mut tables = self.write()?;
        if !tables.records.contains_key(id) {
            return Ok(false);
        }
        let mut records = tables.records.clone();
        records.remove(id);

        self.write_records(&records)?;
        tables.records = records;
        Ok(true)
    }

    fn purge_records(&self, status: SyncStatus) -> StorageResult<usize> {
        let mut tables = self.write()?;
        let mut records = tables.records.clone();
        let before = records.len();
        records.retain(|_, r| r.sync_status != status);
        let removed = before - records.len();
        if removed == 0 {
            return Ok(0);
        }

        self.write_records(&records)?;
        tables.records = records;
        Ok(removed)
    }

    fn push_action(&self, kind: ActionKind, created_at: DateTime<Utc>) -> StorageResult<PendingAction> {
        let mut tables = self.write()?;
        let id = tables.next_action_id.max(1);
        let action = PendingAction {
            id: ActionId(id),
            kind,
            created_at,
            retry_count: 0,
            last_error: None,
        };

        // Reserve the ID before the entry lands so a crash between the two
        // writes can only leave a gap, never a reused ID.
        self.write_metadata(&tables.meta, id + 1)?;
        tables.next_action_id = id + 1;
        self.append_action(&action)?;
        tables.actions.insert(action.id, action.clone());
        Ok(action)
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
        let mut actions = tables.actions.clone();
        let Some(action) = actions.get_mut(&id) else {
            return Ok(None);
        };
        f(action);
        let updated = action.clone();

        self.write_actions(&actions)?;
        tables.actions = actions;
        Ok(Some(updated))
    }

    fn remove_action(&self, id: ActionId) -> StorageResult<bool> {
        let mut tables = self.write()?;
        if !tables.actions.contains_key(&id) {
            return Ok(false);
        }
        let mut actions = tables.actions.clone();
        actions.remove(&id);

        self.write_actions(&actions)?;
        tables.actions = actions;
        Ok(true)
    }

    fn get_meta(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.read()?.meta.get(key).cloned())
    }

    fn set_meta(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut tables = self.write()?;
        let mut meta = tables.meta.clone();
        meta.insert(key.to_string(), value.to_string());

        self.write_metadata(&meta, tables.next_action_id)?;
        tables.meta = meta;
        Ok(())
    }

    fn remove_meta(&self, key: &str) -> StorageResult<()> {
        let mut tables = self.write()?;
        if !tables.meta.contains_key(key) {
            return Ok(());
        }
        let mut meta = tables.meta.clone();
        meta.remove(key);

        self.write_metadata(&meta, tables.next_action_id)?;
        tables.meta = meta;
        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        let mut tables = self.write()?;
        let next_action_id = tables.next_action_id;

        self.write_records(&HashMap::new())?;
        self.write_actions(&BTreeMap::new())?;
        self.write_metadata(&BTreeMap::new(), next_action_id)?;

        *tables = Tables::default();
        tables.next_action_id = next_action_id;
        Ok(())
    }
}
