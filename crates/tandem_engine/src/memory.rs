//! In-memory record store.
//!
//! Reference implementation of the [`RecordStore`] contract, used by the
//! test suite and by applications that keep their sync state in memory.
//! Mutation goes through [`RecordStore::apply`] and is all-or-nothing: the
//! change set is applied to a staged copy of the state, which replaces the
//! live state only when every change succeeds.

use crate::store::{RecordChange, RecordStore, StoreError, StoreResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tandem_model::{
    Account, BoxError, FileContent, LocalFacet, RecordEntry, RecordID, RecordPredicate,
    RecordStatus, Syncable,
};
use tracing::debug;

/// Materializes a domain entity from a downloaded payload.
pub type EntityFactory =
    Box<dyn Fn(&RecordID, &[u8]) -> Result<Arc<dyn Syncable>, BoxError> + Send + Sync>;

#[derive(Default, Clone)]
struct State {
    records: BTreeMap<RecordID, RecordEntry>,
    entities: BTreeMap<RecordID, Arc<dyn Syncable>>,
    cached_files: BTreeMap<(RecordID, String), FileContent>,
    account: Option<Account>,
}

/// An in-memory implementation of [`RecordStore`].
pub struct MemoryRecordStore {
    state: Mutex<State>,
    factory: Option<EntityFactory>,
    fail_next_apply: Mutex<Option<StoreError>>,
    pending_update_runs: AtomicUsize,
    started: AtomicBool,
}

impl MemoryRecordStore {
    /// Creates an empty store with no entity factory. Downloads that create
    /// new entities will fail until a factory is provided.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            factory: None,
            fail_next_apply: Mutex::new(None),
            pending_update_runs: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Creates an empty store that materializes downloaded entities with
    /// the given factory.
    pub fn with_entity_factory(factory: EntityFactory) -> Self {
        Self {
            factory: Some(factory),
            ..Self::new()
        }
    }

    /// Seeds a local entity with the given status and returns its record ID.
    pub fn seed_entity(&self, entity: Arc<dyn Syncable>, status: RecordStatus) -> RecordID {
        let record_id = entity.record_id();
        let mut state = self.state.lock();

        let mut entry = RecordEntry::new(record_id.clone());
        entry.is_syncing_enabled = entity.is_syncing_enabled();
        entry.local = Some(LocalFacet::with_status(status));

        state.records.insert(record_id.clone(), entry);
        state.entities.insert(record_id.clone(), entity);
        record_id
    }

    /// Seeds a record entry verbatim, replacing any existing one.
    pub fn seed_entry(&self, entry: RecordEntry) {
        let mut state = self.state.lock();
        state.records.insert(entry.record_id.clone(), entry);
    }

    /// Associates an entity with an already-seeded record.
    pub fn set_entity(&self, record_id: &RecordID, entity: Arc<dyn Syncable>) {
        self.state
            .lock()
            .entities
            .insert(record_id.clone(), entity);
    }

    /// Makes the next `apply` call fail with the given error, mutating
    /// nothing.
    pub fn fail_next_apply(&self, error: StoreError) {
        *self.fail_next_apply.lock() = Some(error);
    }

    /// Number of times the pending-updates hook has run.
    pub fn pending_update_runs(&self) -> usize {
        self.pending_update_runs.load(Ordering::SeqCst)
    }

    /// Number of records currently in the store.
    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    fn apply_change(&self, state: &mut State, change: RecordChange) -> StoreResult<()> {
        match change {
            RecordChange::UpsertRemoteFacet { record_id, facet } => {
                let entry = state
                    .records
                    .entry(record_id.clone())
                    .or_insert_with(|| RecordEntry::new(record_id));
                entry.remote = Some(facet);
            }
            RecordChange::SetRemoteStatus { record_id, status } => {
                if let Some(facet) = state
                    .records
                    .get_mut(&record_id)
                    .and_then(|e| e.remote.as_mut())
                {
                    facet.status = status;
                }
            }
            RecordChange::SetLocalStatus { record_id, status } => {
                if let Some(facet) = state
                    .records
                    .get_mut(&record_id)
                    .and_then(|e| e.local.as_mut())
                {
                    facet.status = status;
                }
            }
            RecordChange::SetLocalVersion { record_id, version } => {
                if let Some(facet) = state
                    .records
                    .get_mut(&record_id)
                    .and_then(|e| e.local.as_mut())
                {
                    facet.version = Some(version);
                }
            }
            RecordChange::AdvanceLocal {
                record_id,
                version,
                sha1_hash,
            } => {
                let facet = state
                    .records
                    .get_mut(&record_id)
                    .and_then(|e| e.local.as_mut())
                    .ok_or_else(|| StoreError::RecordNotFound(record_id.clone()))?;
                facet.status = RecordStatus::Normal;
                facet.version = Some(version);
                facet.sha1_hash = Some(sha1_hash);
            }
            RecordChange::ReplaceRemoteFiles { record_id, files } => {
                if let Some(facet) = state
                    .records
                    .get_mut(&record_id)
                    .and_then(|e| e.local.as_mut())
                {
                    facet.remote_files = files;
                }
            }
            RecordChange::UpsertEntity {
                record_id,
                payload,
                version,
                sha1_hash,
                files,
            } => {
                let factory = self.factory.as_ref().ok_or_else(|| {
                    StoreError::other("no entity factory configured for downloads")
                })?;
                let entity = factory(&record_id, &payload)
                    .map_err(|e| StoreError::other(e.to_string()))?;

                let entry = state
                    .records
                    .entry(record_id.clone())
                    .or_insert_with(|| RecordEntry::new(record_id.clone()));
                entry.local = Some(LocalFacet {
                    status: RecordStatus::Normal,
                    version: Some(version),
                    sha1_hash: Some(sha1_hash),
                    remote_files: files,
                });

                entity
                    .awake_from_sync(entry)
                    .map_err(|e| StoreError::other(e.to_string()))?;
                state.entities.insert(record_id, entity);
            }
            RecordChange::DeleteRecord { record_id } => {
                state.records.remove(&record_id);
                state.entities.remove(&record_id);
            }
            RecordChange::SetConflicted {
                record_id,
                conflicted,
            } => {
                if let Some(entry) = state.records.get_mut(&record_id) {
                    entry.is_conflicted = conflicted;
                }
            }
            RecordChange::SetSyncingEnabled { record_id, enabled } => {
                if let Some(entry) = state.records.get_mut(&record_id) {
                    entry.is_syncing_enabled = enabled;
                }
            }
            RecordChange::PurgeCachedFiles { record_id } => {
                state.cached_files.retain(|(id, _), _| id != &record_id);
            }
        }
        Ok(())
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryRecordStore {
    fn start(&self) -> StoreResult<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn fetch_records(&self, predicate: &RecordPredicate) -> StoreResult<Vec<RecordEntry>> {
        let state = self.state.lock();
        Ok(state
            .records
            .values()
            .filter(|entry| predicate.matches(entry))
            .cloned()
            .collect())
    }

    fn record(&self, record_id: &RecordID) -> StoreResult<Option<RecordEntry>> {
        Ok(self.state.lock().records.get(record_id).cloned())
    }

    fn entity(&self, record_id: &RecordID) -> StoreResult<Option<Arc<dyn Syncable>>> {
        Ok(self.state.lock().entities.get(record_id).cloned())
    }

    fn apply(&self, changes: Vec<RecordChange>) -> StoreResult<()> {
        if let Some(error) = self.fail_next_apply.lock().take() {
            return Err(error);
        }

        let mut state = self.state.lock();

        // Apply against a staged copy so a failing change leaves the live
        // state untouched.
        let mut staged = state.clone();
        for change in changes {
            self.apply_change(&mut staged, change)?;
        }

        *state = staged;
        Ok(())
    }

    fn cache_file(&self, record_id: &RecordID, content: FileContent) -> StoreResult<()> {
        self.state
            .lock()
            .cached_files
            .insert((record_id.clone(), content.identifier.clone()), content);
        Ok(())
    }

    fn cached_file(
        &self,
        record_id: &RecordID,
        file_identifier: &str,
    ) -> StoreResult<Option<FileContent>> {
        Ok(self
            .state
            .lock()
            .cached_files
            .get(&(record_id.clone(), file_identifier.to_string()))
            .cloned())
    }

    fn account(&self) -> StoreResult<Option<Account>> {
        Ok(self.state.lock().account.clone())
    }

    fn save_account(&self, account: &Account) -> StoreResult<()> {
        self.state.lock().account = Some(account.clone());
        Ok(())
    }

    fn reset(&self) -> StoreResult<()> {
        *self.state.lock() = State::default();
        Ok(())
    }

    fn process_pending_updates(&self) {
        self.pending_update_runs.fetch_add(1, Ordering::SeqCst);
        debug!("processed pending updates");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{note, note_factory};
    use chrono::Utc;
    use tandem_model::{RemoteFacet, RemoteFile, Version};

    fn version(id: &str) -> Version {
        Version::new(id, Utc::now())
    }

    #[test]
    fn apply_is_all_or_nothing() {
        let store = MemoryRecordStore::new();
        let id = store.seed_entity(note("1", "hello"), RecordStatus::Updated);

        // Second change targets a missing record, so the first must not
        // stick either.
        let missing = RecordID::new("Note", "missing");
        let result = store.apply(vec![
            RecordChange::SetConflicted {
                record_id: id.clone(),
                conflicted: true,
            },
            RecordChange::AdvanceLocal {
                record_id: missing,
                version: version("v1"),
                sha1_hash: "abc".into(),
            },
        ]);

        assert!(result.is_err());
        let entry = store.record(&id).unwrap().unwrap();
        assert!(!entry.is_conflicted);
    }

    #[test]
    fn fail_next_apply_mutates_nothing() {
        let store = MemoryRecordStore::new();
        let id = store.seed_entity(note("1", "hello"), RecordStatus::Updated);

        store.fail_next_apply(StoreError::save_failed("disk full"));
        let result = store.apply(vec![RecordChange::SetConflicted {
            record_id: id.clone(),
            conflicted: true,
        }]);

        assert_eq!(result, Err(StoreError::save_failed("disk full")));
        assert!(!store.record(&id).unwrap().unwrap().is_conflicted);

        // The failure is one-shot.
        store
            .apply(vec![RecordChange::SetConflicted {
                record_id: id.clone(),
                conflicted: true,
            }])
            .unwrap();
        assert!(store.record(&id).unwrap().unwrap().is_conflicted);
    }

    #[test]
    fn delete_removes_entity_and_bookkeeping() {
        let store = MemoryRecordStore::new();
        let id = store.seed_entity(note("1", "hello"), RecordStatus::Deleted);

        store
            .apply(vec![RecordChange::DeleteRecord {
                record_id: id.clone(),
            }])
            .unwrap();

        assert!(store.record(&id).unwrap().is_none());
        assert!(store.entity(&id).unwrap().is_none());
    }

    #[test]
    fn upsert_entity_materializes_through_factory() {
        let store = MemoryRecordStore::with_entity_factory(note_factory());
        let id = RecordID::new("Note", "7");

        let payload = serde_json::to_vec("downloaded").unwrap();
        store
            .apply(vec![RecordChange::UpsertEntity {
                record_id: id.clone(),
                payload,
                version: version("v3"),
                sha1_hash: "hash".into(),
                files: vec![RemoteFile {
                    identifier: "artwork".into(),
                    sha1_hash: "fh".into(),
                    remote_identifier: "blob-1".into(),
                    version_identifier: "v3".into(),
                    size: 1,
                }],
            }])
            .unwrap();

        let entry = store.record(&id).unwrap().unwrap();
        let local = entry.local.unwrap();
        assert_eq!(local.status, RecordStatus::Normal);
        assert_eq!(local.version.unwrap().identifier, "v3");
        assert_eq!(local.remote_files.len(), 1);
        assert!(store.entity(&id).unwrap().is_some());
    }

    #[test]
    fn upsert_entity_without_factory_fails() {
        let store = MemoryRecordStore::new();
        let result = store.apply(vec![RecordChange::UpsertEntity {
            record_id: RecordID::new("Note", "1"),
            payload: vec![],
            version: version("v1"),
            sha1_hash: "h".into(),
            files: vec![],
        }]);
        assert!(result.is_err());
    }

    #[test]
    fn purge_drops_only_the_records_cached_files() {
        let store = MemoryRecordStore::new();
        let a = RecordID::new("Note", "a");
        let b = RecordID::new("Note", "b");

        for (id, name) in [(&a, "f1"), (&b, "f2")] {
            store
                .cache_file(
                    id,
                    FileContent {
                        identifier: name.into(),
                        version_identifier: "v1".into(),
                        data: vec![1],
                    },
                )
                .unwrap();
        }

        store
            .apply(vec![RecordChange::PurgeCachedFiles { record_id: a.clone() }])
            .unwrap();

        assert!(store.cached_file(&a, "f1").unwrap().is_none());
        assert!(store.cached_file(&b, "f2").unwrap().is_some());
    }

    #[test]
    fn reset_clears_everything() {
        let store = MemoryRecordStore::new();
        store.seed_entity(note("1", "hello"), RecordStatus::Normal);
        store
            .save_account(&Account::new("alice", "mock"))
            .unwrap();

        store.reset().unwrap();
        assert_eq!(store.record_count(), 0);
        assert!(store.account().unwrap().is_none());
    }

    #[test]
    fn remote_facet_upsert_creates_entries() {
        let store = MemoryRecordStore::new();
        let id = RecordID::new("Note", "9");

        store
            .apply(vec![RecordChange::UpsertRemoteFacet {
                record_id: id.clone(),
                facet: RemoteFacet::new("r9", RecordStatus::Updated, version("v1")),
            }])
            .unwrap();

        let entry = store.record(&id).unwrap().unwrap();
        assert!(entry.local.is_none());
        assert_eq!(entry.remote_status(), Some(RecordStatus::Updated));
    }
}
