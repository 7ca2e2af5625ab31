//! Download operation for one record.

use super::{guard_operable, resolve_entry, OperationContext, FILE_UNITS, RECORD_UNITS};
use crate::hash::sha1_hex;
use crate::service::RemoteEntity;
use crate::store::RecordChange;
use std::collections::HashMap;
use tandem_model::{
    FileError, RecordEntry, RecordError, RecordID, RecordStatus, RemoteFacet, ValidationError,
    Version,
};
use tracing::debug;

/// Downloads one record body and its changed files, replacing the local
/// entity at commit time.
///
/// The effective version is the explicit override if one was given, else
/// the record's previous unlocked version when the remote is locked, else
/// the latest version.
pub struct DownloadRecordOperation {
    record_id: RecordID,
    version: Option<Version>,
    ctx: OperationContext,
}

impl DownloadRecordOperation {
    /// Creates the operation, failing before any network call if the record
    /// is conflicted or excluded from syncing.
    pub fn new(entry: &RecordEntry, ctx: OperationContext) -> Result<Self, RecordError> {
        guard_operable(entry)?;
        ctx.progress.set_total(RECORD_UNITS + FILE_UNITS);

        Ok(Self {
            record_id: entry.record_id.clone(),
            version: None,
            ctx,
        })
    }

    /// Pins the download to an explicit version, bypassing lock handling.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Runs the download.
    pub async fn run(&self) -> Result<(), RecordError> {
        let record_id = &self.record_id;
        debug!(record = %record_id, "downloading record");

        let entry = resolve_entry(&self.ctx, record_id)?;
        guard_operable(&entry)?;

        let remote = entry.remote.clone().ok_or_else(|| {
            RecordError::Validation(record_id.clone(), ValidationError::MissingRemoteFacet)
        })?;
        let version = self.effective_version(&remote)?;

        let remote_entity = self
            .ctx
            .record_task()
            .run(|| self.ctx.service.download_record(record_id, &version))
            .await
            .map_err(|e| RecordError::normalize(record_id.clone(), e))?;

        self.download_files(&remote_entity).await?;

        let payload_hash = sha1_hex(&remote_entity.payload);
        self.ctx.save.stage_all([
            RecordChange::UpsertEntity {
                record_id: record_id.clone(),
                payload: remote_entity.payload.clone(),
                version: version.clone(),
                sha1_hash: payload_hash,
                files: remote_entity.files.clone(),
            },
            RecordChange::SetRemoteStatus {
                record_id: record_id.clone(),
                status: RecordStatus::Normal,
            },
        ]);

        self.ctx.progress.complete();
        Ok(())
    }

    fn effective_version(&self, remote: &RemoteFacet) -> Result<Version, RecordError> {
        if let Some(version) = &self.version {
            return Ok(version.clone());
        }

        if remote.is_locked {
            remote
                .previous_unlocked_version
                .clone()
                .ok_or_else(|| RecordError::Locked(self.record_id.clone()))
        } else {
            Ok(remote.version.clone())
        }
    }

    async fn download_files(&self, remote_entity: &RemoteEntity) -> Result<(), RecordError> {
        let record_id = &self.record_id;
        let files_progress = self.ctx.progress.child(FILE_UNITS);

        // When a local entity exists, compare hashes so unchanged files are
        // not downloaded again. Without one, download everything.
        let local_hashes: Option<HashMap<String, String>> = self
            .ctx
            .store
            .entity(record_id)
            .map_err(|e| RecordError::other(record_id.clone(), e))?
            .map(|entity| {
                entity
                    .syncable_files()
                    .iter()
                    .map(|f| (f.identifier.clone(), sha1_hex(&f.data)))
                    .collect()
            });

        let mut errors = Vec::new();
        let mut pending = Vec::new();
        for remote_file in &remote_entity.files {
            if let Some(hashes) = &local_hashes {
                match hashes.get(&remote_file.identifier) {
                    Some(hash) if *hash == remote_file.sha1_hash => continue,
                    Some(_) => {}
                    None => {
                        errors.push(FileError::UnknownFile(remote_file.identifier.clone()));
                        continue;
                    }
                }
            }
            pending.push(remote_file.clone());
        }

        files_progress.set_total(pending.len() as u64);
        for remote_file in pending {
            let result = self
                .ctx
                .file_task(&files_progress)
                .run(|| self.ctx.service.download_file(record_id, &remote_file))
                .await;

            match result {
                Ok(content) => {
                    // Cached outside the batch transaction: files fetched
                    // before a later failure stay available.
                    if let Err(error) = self.ctx.store.cache_file(record_id, content) {
                        errors.push(FileError::Other(
                            remote_file.identifier.clone(),
                            error.to_string(),
                        ));
                    }
                }
                Err(error) => {
                    errors.push(FileError::normalize(remote_file.identifier.clone(), error));
                }
            }
        }

        files_progress.complete();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RecordError::FilesFailed(record_id.clone(), errors))
        }
    }
}
