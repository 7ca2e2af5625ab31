//! End-to-end sync tests over the in-memory store and the mock service.

use parking_lot::Mutex;
use std::sync::Arc;
use tandem_engine::{
    ChangeSet, MemoryRecordStore, MockService, RecordStore, RemoteEntity, SyncConfig,
    SyncCoordinator, SyncEvent,
};
use tandem_model::{
    Account, BoxError, ChangeToken, LocalFile, RecordID, RecordStatus, RemoteFacet, RemoteFile,
    Syncable, Version,
};

struct Note {
    identifier: String,
    content: Mutex<String>,
    files: Vec<LocalFile>,
}

impl Note {
    fn new(identifier: &str, content: &str) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.to_string(),
            content: Mutex::new(content.to_string()),
            files: Vec::new(),
        })
    }

    fn with_file(identifier: &str, content: &str, file: LocalFile) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.to_string(),
            content: Mutex::new(content.to_string()),
            files: vec![file],
        })
    }
}

impl Syncable for Note {
    fn record_type(&self) -> &str {
        "Note"
    }

    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    fn syncable_data(&self) -> Result<Vec<u8>, BoxError> {
        Ok(serde_json::to_vec(&*self.content.lock())?)
    }

    fn syncable_files(&self) -> Vec<LocalFile> {
        self.files.clone()
    }

    fn display_name(&self) -> Option<String> {
        Some(self.content.lock().clone())
    }
}

fn store() -> Arc<MemoryRecordStore> {
    Arc::new(MemoryRecordStore::with_entity_factory(Box::new(
        |record_id, payload| {
            let content: String = serde_json::from_slice(payload)?;
            let entity: Arc<dyn Syncable> = Note::new(&record_id.identifier, &content);
            Ok(entity)
        },
    )))
}

fn remote_facet(version_id: &str) -> RemoteFacet {
    RemoteFacet::new(
        format!("remote-{version_id}"),
        RecordStatus::Updated,
        Version::new(version_id, chrono::Utc::now()),
    )
}

#[tokio::test]
async fn a_full_session_uploads_downloads_and_deletes() {
    let store = store();
    let service = Arc::new(MockService::new());

    // Two locally-edited notes, one with a file.
    let a = store.seed_entity(Note::new("a", "first"), RecordStatus::Updated);
    let b = store.seed_entity(
        Note::with_file("b", "second", LocalFile::new("attachment", vec![1, 2, 3])),
        RecordStatus::Updated,
    );

    // One tombstoned note the server still knows about.
    let c = store.seed_entity(Note::new("c", "gone"), RecordStatus::Deleted);
    let mut entry = store.record(&c).unwrap().unwrap();
    entry.remote = Some(remote_facet("v-c"));
    entry.remote.as_mut().unwrap().status = RecordStatus::Normal;
    entry.local.as_mut().unwrap().remote_files = vec![RemoteFile {
        identifier: "old-attachment".into(),
        sha1_hash: "h".into(),
        remote_identifier: "blob-c".into(),
        version_identifier: "v-c".into(),
        size: 1,
    }];
    store.seed_entry(entry);

    // One record that only exists remotely.
    let d = RecordID::new("Note", "d");
    let mut change_set = ChangeSet::empty(ChangeToken::new(b"cursor-1".to_vec()));
    change_set.records.push((d.clone(), remote_facet("v-d")));
    service.push_fetch_response(Ok(change_set));
    service.seed_remote_entity(
        d.clone(),
        RemoteEntity {
            payload: serde_json::to_vec("from the server").unwrap(),
            files: vec![],
        },
    );

    let coordinator = SyncCoordinator::new(service.clone(), store.clone(), SyncConfig::new());
    coordinator.start().await.unwrap().expect("authenticated");
    let mut events = coordinator.subscribe();

    let results = match coordinator.sync().outcome().await.as_ref() {
        Ok(results) => results.clone(),
        Err(error) => panic!("session failed: {error}"),
    };

    // Every touched record reports success.
    assert_eq!(results.len(), 4);
    for (record_id, result) in &results {
        assert!(result.is_ok(), "{record_id} failed: {result:?}");
    }

    assert_eq!(service.upload_record_calls(), 2);
    assert_eq!(service.upload_file_calls(), 1);
    assert_eq!(service.download_record_calls(), 1);
    assert_eq!(service.delete_record_calls(), 1);
    assert_eq!(service.delete_file_calls(), 1);

    // Uploaded records settle at Normal with a version and hash.
    for record_id in [&a, &b] {
        let entry = store.record(record_id).unwrap().unwrap();
        let local = entry.local.unwrap();
        assert_eq!(local.status, RecordStatus::Normal);
        assert!(local.version.is_some());
        assert!(local.sha1_hash.is_some());
    }

    // The uploaded file is tracked in the bookkeeping.
    let entry = store.record(&b).unwrap().unwrap();
    assert_eq!(entry.local.unwrap().remote_files.len(), 1);

    // The tombstone is gone, the remote-only record materialized.
    assert!(store.record(&c).unwrap().is_none());
    let entry = store.record(&d).unwrap().unwrap();
    assert_eq!(entry.local.unwrap().status, RecordStatus::Normal);
    assert!(store.entity(&d).unwrap().is_some());

    // The change token was persisted after the session concluded.
    let account = store.account().unwrap().unwrap();
    assert_eq!(
        account.change_token,
        Some(ChangeToken::new(b"cursor-1".to_vec()))
    );

    // Start and finish events were published.
    assert!(matches!(events.recv().await.unwrap(), SyncEvent::Started));
    assert!(matches!(
        events.recv().await.unwrap(),
        SyncEvent::Finished(_)
    ));
}

#[tokio::test]
async fn a_second_session_is_incremental_and_idle() {
    let store = store();
    let service = Arc::new(MockService::new());
    store.seed_entity(Note::new("a", "first"), RecordStatus::Updated);

    let coordinator = SyncCoordinator::new(service.clone(), store.clone(), SyncConfig::new());
    coordinator.start().await.unwrap();

    assert!(coordinator.sync().outcome().await.is_ok());
    assert!(coordinator.sync().outcome().await.is_ok());

    // The first session uploaded and fetched everything; the second had a
    // token and nothing left to do.
    assert_eq!(service.full_fetch_calls(), 1);
    assert_eq!(service.incremental_fetch_calls(), 1);
    assert_eq!(service.upload_record_calls(), 1);
}

#[tokio::test]
async fn accounts_persist_across_coordinators() {
    let store = store();
    let service = Arc::new(MockService::new());

    let mut account = Account::new("tester", "mock");
    account.change_token = Some(ChangeToken::new(b"saved".to_vec()));
    store.save_account(&account).unwrap();

    let coordinator = SyncCoordinator::new(service.clone(), store.clone(), SyncConfig::new());
    coordinator.start().await.unwrap();

    // The silent authentication kept the persisted token, so the first
    // sync is incremental.
    assert!(coordinator.sync().outcome().await.is_ok());
    assert_eq!(service.full_fetch_calls(), 0);
    assert_eq!(service.incremental_fetch_calls(), 1);
}
