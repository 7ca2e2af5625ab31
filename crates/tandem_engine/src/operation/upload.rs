//! Upload operation for one record.

use super::{guard_operable, resolve_entry, OperationContext, FILE_UNITS, RECORD_UNITS};
use crate::hash::sha1_hex;
use crate::store::RecordChange;
use tandem_model::{
    FileError, FileMetadata, LocalFacet, RecordEntry, RecordError, RecordID, RecordMetadata,
    RemoteFacet, RemoteFile, Syncable, ValidationError,
};
use tracing::debug;

/// Uploads one record: changed files first, then the record body, with the
/// local and remote facets advanced together on success.
///
/// If the recomputed content hash matches the last accepted remote hash,
/// the upload short-circuits without a network call but still advances the
/// local facet to `Normal`.
pub struct UploadRecordOperation {
    record_id: RecordID,
    ctx: OperationContext,
}

impl UploadRecordOperation {
    /// Creates the operation, failing before any network call if the record
    /// is conflicted or excluded from syncing.
    pub fn new(entry: &RecordEntry, ctx: OperationContext) -> Result<Self, RecordError> {
        guard_operable(entry)?;
        ctx.progress.set_total(RECORD_UNITS + FILE_UNITS);

        Ok(Self {
            record_id: entry.record_id.clone(),
            ctx,
        })
    }

    /// Runs the upload and returns the server's new facet.
    pub async fn run(&self) -> Result<RemoteFacet, RecordError> {
        let record_id = &self.record_id;
        debug!(record = %record_id, "uploading record");

        let entry = resolve_entry(&self.ctx, record_id)?;
        guard_operable(&entry)?;

        let local = entry.local.clone().ok_or_else(|| {
            RecordError::Validation(record_id.clone(), ValidationError::MissingLocalFacet)
        })?;
        let entity = self
            .ctx
            .store
            .entity(record_id)
            .map_err(|e| RecordError::other(record_id.clone(), e))?
            .ok_or_else(|| {
                RecordError::Validation(record_id.clone(), ValidationError::MissingEntity)
            })?;

        entity
            .prepare_for_sync(&entry)
            .map_err(|e| RecordError::other(record_id.clone(), e))?;

        // Always recompute; the entity may have changed since the last sync.
        let payload = entity
            .syncable_data()
            .map_err(|e| RecordError::other(record_id.clone(), e))?;
        let record_hash = sha1_hex(&payload);

        if let Some(remote) = &entry.remote {
            if remote.sha1_hash.as_deref() == Some(record_hash.as_str()) {
                debug!(record = %record_id, "content unchanged, skipping upload");
                self.ctx.save.stage(RecordChange::AdvanceLocal {
                    record_id: record_id.clone(),
                    version: remote.version.clone(),
                    sha1_hash: record_hash,
                });
                self.ctx.progress.complete();
                return Ok(remote.clone());
            }
        }

        let remote_files = self.upload_files(&local, entity.as_ref()).await?;
        self.ctx.save.stage(RecordChange::ReplaceRemoteFiles {
            record_id: record_id.clone(),
            files: remote_files.clone(),
        });

        let metadata = self.metadata(&entry, entity.as_ref(), &record_hash, &remote_files);

        let facet = self
            .ctx
            .record_task()
            .run(|| self.ctx.service.upload_record(record_id, &payload, &metadata))
            .await
            .map_err(|e| RecordError::normalize(record_id.clone(), e))?;

        // Both facets advance as a pair within the batch commit.
        self.ctx.save.stage_all([
            RecordChange::UpsertRemoteFacet {
                record_id: record_id.clone(),
                facet: facet.clone(),
            },
            RecordChange::AdvanceLocal {
                record_id: record_id.clone(),
                version: facet.version.clone(),
                sha1_hash: record_hash,
            },
        ]);

        self.ctx.progress.complete();
        Ok(facet)
    }

    async fn upload_files(
        &self,
        local: &LocalFacet,
        entity: &dyn Syncable,
    ) -> Result<Vec<RemoteFile>, RecordError> {
        let files_progress = self.ctx.progress.child(FILE_UNITS);

        let mut bookkeeping = local.remote_files.clone();
        let changed: Vec<_> = entity
            .syncable_files()
            .into_iter()
            .filter_map(|file| {
                let hash = sha1_hex(&file.data);
                match local.remote_file(&file.identifier) {
                    Some(cached) if cached.sha1_hash == hash => None,
                    _ => Some((file, hash)),
                }
            })
            .collect();

        files_progress.set_total(changed.len() as u64);
        if changed.is_empty() {
            files_progress.complete();
            return Ok(bookkeeping);
        }

        let mut errors = Vec::new();
        for (file, hash) in changed {
            let metadata = FileMetadata::new(file.identifier.clone(), hash);
            let result = self
                .ctx
                .file_task(&files_progress)
                .run(|| self.ctx.service.upload_file(&self.record_id, &file, &metadata))
                .await;

            match result {
                Ok(remote_file) => {
                    bookkeeping.retain(|f| f.identifier != remote_file.identifier);
                    bookkeeping.push(remote_file);
                }
                Err(error) => errors.push(FileError::normalize(file.identifier.clone(), error)),
            }
        }

        files_progress.complete();
        if errors.is_empty() {
            Ok(bookkeeping)
        } else {
            Err(RecordError::FilesFailed(self.record_id.clone(), errors))
        }
    }

    fn metadata(
        &self,
        entry: &RecordEntry,
        entity: &dyn Syncable,
        record_hash: &str,
        files: &[RemoteFile],
    ) -> RecordMetadata {
        let mut metadata = RecordMetadata {
            record_type: self.record_id.record_type.clone(),
            identifier: self.record_id.identifier.clone(),
            author: self.ctx.config.author.clone(),
            display_name: entity.display_name(),
            is_locked: self.ctx.config.lock_uploads,
            previous_version: None,
            sha1_hash: Some(record_hash.to_string()),
            files: files
                .iter()
                .map(|f| FileMetadata::new(f.identifier.clone(), f.sha1_hash.clone()))
                .collect(),
            extra: entity.syncable_metadata(),
        };

        // Remember the previous non-locked version, so the record can be
        // restored if it ends up locked indefinitely.
        if let Some(remote) = &entry.remote {
            if !remote.is_locked {
                metadata.previous_version = Some(remote.version.clone());
            }
        }

        metadata
    }
}
