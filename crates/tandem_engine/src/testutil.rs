//! Shared helpers for the engine test suite.

use crate::memory::EntityFactory;
use crate::task::Reauthenticator;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tandem_model::{
    Account, AuthenticationError, BoxError, ConflictAction, LocalFile, RecordEntry, RecordStatus,
    RemoteFacet, Syncable, Version,
};

/// A minimal syncable entity for tests.
pub(crate) struct TestNote {
    identifier: String,
    pub content: Mutex<String>,
    pub files: Mutex<Vec<LocalFile>>,
    pub prepare_calls: AtomicUsize,
    pub conflict_action: Mutex<ConflictAction>,
}

impl TestNote {
    pub fn set_files(&self, files: Vec<LocalFile>) {
        *self.files.lock() = files;
    }

    pub fn set_conflict_action(&self, action: ConflictAction) {
        *self.conflict_action.lock() = action;
    }

    pub fn prepare_calls(&self) -> usize {
        self.prepare_calls.load(Ordering::SeqCst)
    }
}

impl Syncable for TestNote {
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
        self.files.lock().clone()
    }

    fn prepare_for_sync(&self, _entry: &RecordEntry) -> Result<(), BoxError> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn resolve_conflict(&self, _entry: &RecordEntry) -> ConflictAction {
        *self.conflict_action.lock()
    }
}

pub(crate) fn note(identifier: &str, content: &str) -> Arc<TestNote> {
    Arc::new(TestNote {
        identifier: identifier.to_string(),
        content: Mutex::new(content.to_string()),
        files: Mutex::new(Vec::new()),
        prepare_calls: AtomicUsize::new(0),
        conflict_action: Mutex::new(ConflictAction::Flag),
    })
}

/// An entity factory that materializes [`TestNote`]s from JSON payloads.
pub(crate) fn note_factory() -> EntityFactory {
    Box::new(|record_id, payload| {
        let content: String = serde_json::from_slice(payload)?;
        let entity: Arc<dyn Syncable> = note(&record_id.identifier, &content);
        Ok(entity)
    })
}

pub(crate) fn version(identifier: &str) -> Version {
    Version::new(identifier, Utc::now())
}

pub(crate) fn remote_facet(identifier: &str, status: RecordStatus, version_id: &str) -> RemoteFacet {
    RemoteFacet::new(identifier, status, version(version_id))
}

/// A scripted [`Reauthenticator`].
pub(crate) struct StubAuth {
    authenticated: AtomicBool,
    failure: Mutex<Option<AuthenticationError>>,
    calls: AtomicUsize,
}

impl StubAuth {
    pub fn authenticated() -> Arc<Self> {
        Arc::new(Self {
            authenticated: AtomicBool::new(true),
            failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn unauthenticated() -> Arc<Self> {
        let auth = Self::authenticated();
        auth.authenticated.store(false, Ordering::SeqCst);
        auth
    }

    pub fn fail_reauthentication(&self, error: AuthenticationError) {
        *self.failure.lock() = Some(error);
    }

    pub fn reauthenticate_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reauthenticator for StubAuth {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn reauthenticate(&self) -> Result<Account, AuthenticationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }

        self.authenticated.store(true, Ordering::SeqCst);
        Ok(Account::new("tester", "mock"))
    }
}
