//! Per-record operations.
//!
//! Each operation performs exactly one high-level action for one record —
//! download, upload, or delete — staging its side effects into the batch's
//! save context. Construction fails before any network call if the record
//! is conflicted or has syncing disabled.

mod delete;
mod download;
mod upload;

pub use delete::DeleteRecordOperation;
pub use download::DownloadRecordOperation;
pub use upload::UploadRecordOperation;

use crate::config::SyncConfig;
use crate::progress::Progress;
use crate::service::Service;
use crate::store::{RecordStore, SaveContext};
use crate::task::{Reauthenticator, ServiceTask};
use std::sync::Arc;
use tandem_model::{RecordEntry, RecordError, RecordID};

/// Progress weight of a record body.
pub(crate) const RECORD_UNITS: u64 = 1;
/// Progress weight of a record's files.
pub(crate) const FILE_UNITS: u64 = 3;

/// Everything a record operation needs: collaborators, the batch's save
/// context, and its own progress/cancellation token.
#[derive(Clone)]
pub struct OperationContext {
    /// Local store the operation reads from and stages against.
    pub store: Arc<dyn RecordStore>,
    /// Remote service.
    pub service: Arc<dyn Service>,
    /// Reauthentication hook handed to the task runner.
    pub auth: Arc<dyn Reauthenticator>,
    /// Staging buffer shared by the whole batch.
    pub save: Arc<SaveContext>,
    /// Engine configuration.
    pub config: SyncConfig,
    /// Operation-level progress and cancellation token.
    pub progress: Progress,
}

impl OperationContext {
    /// Creates a context with a fresh save context and a standalone
    /// progress root.
    pub fn new(
        store: Arc<dyn RecordStore>,
        service: Arc<dyn Service>,
        auth: Arc<dyn Reauthenticator>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            service,
            auth,
            save: Arc::new(SaveContext::new()),
            config,
            progress: Progress::new(RECORD_UNITS + FILE_UNITS),
        }
    }

    /// Replaces the save context.
    pub fn with_save(mut self, save: Arc<SaveContext>) -> Self {
        self.save = save;
        self
    }

    /// Replaces the progress token.
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// A service task for the record body, weighted one unit.
    pub(crate) fn record_task(&self) -> ServiceTask {
        ServiceTask::new(
            self.auth.clone(),
            self.config.retry.clone(),
            self.progress.child(RECORD_UNITS),
        )
    }

    /// A service task for one file, weighted one unit of the given files
    /// progress.
    pub(crate) fn file_task(&self, files_progress: &Progress) -> ServiceTask {
        ServiceTask::new(
            self.auth.clone(),
            self.config.retry.clone(),
            files_progress.child(1),
        )
    }
}

/// Fails when the record must not be operated on.
pub(crate) fn guard_operable(entry: &RecordEntry) -> Result<(), RecordError> {
    if entry.is_conflicted {
        return Err(RecordError::Conflicted(entry.record_id.clone()));
    }
    if !entry.is_syncing_enabled {
        return Err(RecordError::SyncingDisabled(entry.record_id.clone()));
    }
    Ok(())
}

/// Re-fetches the record's current entry from the store.
pub(crate) fn resolve_entry(
    ctx: &OperationContext,
    record_id: &RecordID,
) -> Result<RecordEntry, RecordError> {
    ctx.store
        .record(record_id)
        .map_err(|e| RecordError::other(record_id.clone(), e))?
        .ok_or_else(|| RecordError::DoesNotExist(record_id.clone()))
}
