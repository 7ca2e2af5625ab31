//! Local store contract and staged changes.
//!
//! The store is an external collaborator: the engine only ever talks to it
//! through [`RecordStore`]. All mutation is staged as [`RecordChange`]
//! values in a [`SaveContext`] and handed to [`RecordStore::apply`] as one
//! transaction, so a batch either commits every record's staged change or
//! none of them.

use parking_lot::Mutex;
use std::sync::Arc;
use tandem_model::{
    Account, FileContent, RecordEntry, RecordID, RecordPredicate, RecordStatus, RemoteFacet,
    RemoteFile, SyncError, Syncable, Version,
};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the local store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The requested record does not exist in the store.
    #[error("record {0} not found")]
    RecordNotFound(RecordID),

    /// A transactional save failed; nothing was applied.
    #[error("failed to save changes: {0}")]
    SaveFailed(String),

    /// Any other store failure.
    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Creates a save-failed error.
    pub fn save_failed(message: impl Into<String>) -> Self {
        Self::SaveFailed(message.into())
    }

    /// Creates an uninterpreted store error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

impl From<StoreError> for SyncError {
    fn from(error: StoreError) -> Self {
        SyncError::Other(error.to_string())
    }
}

/// One staged mutation against the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordChange {
    /// Creates or replaces the remote facet mirror of a record.
    UpsertRemoteFacet {
        /// Target record.
        record_id: RecordID,
        /// New remote facet.
        facet: RemoteFacet,
    },
    /// Sets the remote facet's status, if the facet exists.
    SetRemoteStatus {
        /// Target record.
        record_id: RecordID,
        /// New status.
        status: RecordStatus,
    },
    /// Sets the local facet's status, if the facet exists.
    SetLocalStatus {
        /// Target record.
        record_id: RecordID,
        /// New status.
        status: RecordStatus,
    },
    /// Pins the local facet to a version without touching its status.
    SetLocalVersion {
        /// Target record.
        record_id: RecordID,
        /// Version to pin.
        version: Version,
    },
    /// Marks the local facet as synced: status `Normal`, with the given
    /// version and content hash advanced as a pair.
    AdvanceLocal {
        /// Target record.
        record_id: RecordID,
        /// Server-accepted version.
        version: Version,
        /// Content hash at that version.
        sha1_hash: String,
    },
    /// Replaces the local facet's remote-file bookkeeping.
    ReplaceRemoteFiles {
        /// Target record.
        record_id: RecordID,
        /// New bookkeeping set.
        files: Vec<RemoteFile>,
    },
    /// Creates or replaces the local entity from a downloaded payload and
    /// marks the local facet as synced at the given version.
    UpsertEntity {
        /// Target record.
        record_id: RecordID,
        /// Serialized entity payload.
        payload: Vec<u8>,
        /// Version the payload was downloaded at.
        version: Version,
        /// Content hash of the payload.
        sha1_hash: String,
        /// Remote-file bookkeeping for the downloaded record.
        files: Vec<RemoteFile>,
    },
    /// Deletes the record's entity, bookkeeping, and both facets. The
    /// record's remote-file bookkeeping dies with the local facet.
    DeleteRecord {
        /// Target record.
        record_id: RecordID,
    },
    /// Sets or clears the conflicted flag.
    SetConflicted {
        /// Target record.
        record_id: RecordID,
        /// New flag value.
        conflicted: bool,
    },
    /// Enables or disables syncing for the record.
    SetSyncingEnabled {
        /// Target record.
        record_id: RecordID,
        /// New flag value.
        enabled: bool,
    },
    /// Drops cached downloaded file content for the record.
    PurgeCachedFiles {
        /// Target record.
        record_id: RecordID,
    },
}

impl RecordChange {
    /// The record this change targets.
    pub fn record_id(&self) -> &RecordID {
        match self {
            RecordChange::UpsertRemoteFacet { record_id, .. }
            | RecordChange::SetRemoteStatus { record_id, .. }
            | RecordChange::SetLocalStatus { record_id, .. }
            | RecordChange::SetLocalVersion { record_id, .. }
            | RecordChange::AdvanceLocal { record_id, .. }
            | RecordChange::ReplaceRemoteFiles { record_id, .. }
            | RecordChange::UpsertEntity { record_id, .. }
            | RecordChange::DeleteRecord { record_id }
            | RecordChange::SetConflicted { record_id, .. }
            | RecordChange::SetSyncingEnabled { record_id, .. }
            | RecordChange::PurgeCachedFiles { record_id } => record_id,
        }
    }
}

/// Staging buffer for one batch's side effects.
///
/// Record operations running concurrently within a batch stage their
/// changes here; the batch commits them as a single transaction after all
/// operations finish. Changes are applied in staging order.
#[derive(Debug, Default)]
pub struct SaveContext {
    changes: Mutex<Vec<RecordChange>>,
}

impl SaveContext {
    /// Creates an empty save context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages one change.
    pub fn stage(&self, change: RecordChange) {
        self.changes.lock().push(change);
    }

    /// Stages several changes, keeping their relative order.
    pub fn stage_all(&self, changes: impl IntoIterator<Item = RecordChange>) {
        self.changes.lock().extend(changes);
    }

    /// Takes every staged change, leaving the context empty.
    pub fn take_changes(&self) -> Vec<RecordChange> {
        std::mem::take(&mut *self.changes.lock())
    }

    /// Number of staged changes.
    pub fn len(&self) -> usize {
        self.changes.lock().len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.changes.lock().is_empty()
    }
}

/// Contract the engine requires from the local persistent store.
///
/// Implementations serialize access internally; every method is safe to
/// call from any task. Mutation happens only through [`apply`], which is
/// transactional: on error, no change may be visible.
///
/// [`apply`]: RecordStore::apply
pub trait RecordStore: Send + Sync {
    /// Initializes the store. Called once by the coordinator's `start`.
    fn start(&self) -> StoreResult<()>;

    /// Snapshot-fetches every record matching the predicate.
    fn fetch_records(&self, predicate: &RecordPredicate) -> StoreResult<Vec<RecordEntry>>;

    /// Fetches one record's current entry, if it exists.
    fn record(&self, record_id: &RecordID) -> StoreResult<Option<RecordEntry>>;

    /// Resolves the record's domain entity, if it exists locally.
    fn entity(&self, record_id: &RecordID) -> StoreResult<Option<Arc<dyn Syncable>>>;

    /// Applies the given changes as one transaction.
    fn apply(&self, changes: Vec<RecordChange>) -> StoreResult<()>;

    /// Caches downloaded file content for the domain to consume.
    ///
    /// Deliberately outside the transactional save: files downloaded before
    /// an operation fails stay cached.
    fn cache_file(&self, record_id: &RecordID, content: FileContent) -> StoreResult<()>;

    /// Looks up cached file content by record and file identifier.
    fn cached_file(
        &self,
        record_id: &RecordID,
        file_identifier: &str,
    ) -> StoreResult<Option<FileContent>>;

    /// The persisted account, if any.
    fn account(&self) -> StoreResult<Option<Account>>;

    /// Persists the account, replacing any existing one.
    fn save_account(&self, account: &Account) -> StoreResult<()>;

    /// Wipes all sync state, entities, and the account.
    fn reset(&self) -> StoreResult<()>;

    /// Reconciliation hook invoked after every batch commit.
    fn process_pending_updates(&self);
}
