//! Delete operation for one record.

use super::{guard_operable, resolve_entry, OperationContext};
use crate::store::RecordChange;
use tandem_model::{FileError, RecordEntry, RecordError, RecordID};
use tracing::debug;

/// Deletes one record: remote files first, then the remote record, then the
/// local entity and its bookkeeping.
///
/// An "already absent" response from the server, for either a file or the
/// record itself, counts as success.
pub struct DeleteRecordOperation {
    record_id: RecordID,
    ctx: OperationContext,
}

impl DeleteRecordOperation {
    /// Creates the operation, failing before any network call if the record
    /// is conflicted or excluded from syncing.
    pub fn new(entry: &RecordEntry, ctx: OperationContext) -> Result<Self, RecordError> {
        guard_operable(entry)?;
        // Remote files, remote record, local record.
        ctx.progress.set_total(3);

        Ok(Self {
            record_id: entry.record_id.clone(),
            ctx,
        })
    }

    /// Runs the deletion.
    pub async fn run(&self) -> Result<(), RecordError> {
        let record_id = &self.record_id;
        debug!(record = %record_id, "deleting record");

        let entry = match resolve_entry(&self.ctx, record_id) {
            Ok(entry) => entry,
            Err(RecordError::DoesNotExist(_)) => {
                // Already gone locally.
                self.ctx.progress.complete();
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        guard_operable(&entry)?;

        self.delete_remote_files(&entry).await?;
        self.delete_remote_record(&entry).await?;

        self.ctx.save.stage(RecordChange::DeleteRecord {
            record_id: record_id.clone(),
        });

        self.ctx.progress.complete();
        Ok(())
    }

    async fn delete_remote_files(&self, entry: &RecordEntry) -> Result<(), RecordError> {
        let files = entry
            .local
            .as_ref()
            .map(|l| l.remote_files.clone())
            .unwrap_or_default();

        let files_progress = self.ctx.progress.child(1);
        files_progress.set_total(files.len() as u64);

        let mut errors = Vec::new();
        for file in files {
            let result = self
                .ctx
                .file_task(&files_progress)
                .run(|| self.ctx.service.delete_file(&self.record_id, &file))
                .await;

            if let Err(error) = result {
                match FileError::normalize(file.identifier.clone(), error) {
                    // A file the server no longer has is already deleted.
                    FileError::DoesNotExist(_) => {}
                    error => errors.push(error),
                }
            }
        }

        files_progress.complete();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RecordError::FilesFailed(self.record_id.clone(), errors))
        }
    }

    async fn delete_remote_record(&self, entry: &RecordEntry) -> Result<(), RecordError> {
        if entry.remote.is_none() {
            // Never uploaded; nothing to delete on the server.
            self.ctx.progress.complete_unit();
            return Ok(());
        }

        let result = self
            .ctx
            .record_task()
            .run(|| self.ctx.service.delete_record(&self.record_id))
            .await;

        match result.map_err(|e| RecordError::normalize(self.record_id.clone(), e)) {
            Ok(()) => Ok(()),
            // Already absent on the server counts as deleted.
            Err(RecordError::DoesNotExist(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }
}
