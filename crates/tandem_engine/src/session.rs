//! Sync session state machine.
//!
//! A session runs its phases strictly in order: fetch remote changes,
//! check conflicts, upload, download, delete, reconcile. Each of the three
//! middle phases is a [`BatchProcessor`] bound to a selection predicate;
//! reconciling re-queries the conflicted set and overwrites those records'
//! results, so a conflict discovered at any point wins over an earlier
//! success.

use crate::batch::{BatchFailure, BatchOutcome, BatchProcessor, OperationFuture};
use crate::config::SyncConfig;
use crate::operation::{
    DeleteRecordOperation, DownloadRecordOperation, OperationContext, UploadRecordOperation,
};
use crate::progress::Progress;
use crate::service::{ChangeSet, Service};
use crate::store::{RecordChange, RecordStore};
use crate::task::{Reauthenticator, ServiceTask};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tandem_model::{
    ChangeToken, ConflictAction, RecordEntry, RecordError, RecordPredicate, RecordResults,
    RecordStatus, RemoteFacet, SyncError, ValidationError,
};
use tracing::{debug, info};

/// The phase a session is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Fetching the remote change list and mirroring it locally.
    FetchingChanges,
    /// Counting conflicted records; mutates nothing.
    ConflictCheck,
    /// Uploading records with pending local changes.
    Uploading,
    /// Downloading records with pending remote changes.
    Downloading,
    /// Deleting tombstoned records.
    Deleting,
    /// Overwriting results for records flagged conflicted.
    Reconciling,
    /// The session has finished.
    Finished,
}

/// The outcome of a session: the full per-record result map on success, or
/// a [`SyncError`] (`Partial` carries the same map when any record failed).
pub type SessionOutcome = Result<RecordResults, SyncError>;

/// One run of the five-phase sync state machine.
pub struct SyncSession {
    store: Arc<dyn RecordStore>,
    service: Arc<dyn Service>,
    auth: Arc<dyn Reauthenticator>,
    config: SyncConfig,
    change_token: Option<ChangeToken>,
    progress: Progress,
    state: RwLock<SessionState>,
    updated_change_token: Mutex<Option<ChangeToken>>,
}

impl SyncSession {
    /// Creates a session against the given change token (`None` requests a
    /// full fetch).
    pub fn new(
        store: Arc<dyn RecordStore>,
        service: Arc<dyn Service>,
        auth: Arc<dyn Reauthenticator>,
        config: SyncConfig,
        change_token: Option<ChangeToken>,
        progress: Progress,
    ) -> Self {
        Self {
            store,
            service,
            auth,
            config,
            change_token,
            progress,
            state: RwLock::new(SessionState::FetchingChanges),
            updated_change_token: Mutex::new(None),
        }
    }

    /// The session's current phase.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// The session's progress and cancellation token.
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// The token produced by the fetch phase, once it has committed. The
    /// coordinator persists it after the session concludes.
    pub fn updated_change_token(&self) -> Option<ChangeToken> {
        self.updated_change_token.lock().clone()
    }

    fn set_state(&self, state: SessionState) {
        debug!(?state, "session phase");
        *self.state.write() = state;
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.progress.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs every phase to completion.
    pub async fn run(&self) -> SessionOutcome {
        info!(incremental = self.change_token.is_some(), "sync session started");

        self.set_state(SessionState::FetchingChanges);
        let change_set = self.fetch_changes().await?;
        self.merge_remote_changes(&change_set)?;
        *self.updated_change_token.lock() = Some(change_set.change_token.clone());
        self.check_cancelled()?;

        self.set_state(SessionState::ConflictCheck);
        let conflicted = self.store.fetch_records(&RecordPredicate::Conflicted)?;
        debug!(count = conflicted.len(), "conflicted records excluded from phases");
        self.check_cancelled()?;

        let mut results = RecordResults::new();

        self.set_state(SessionState::Uploading);
        self.finish_phase(self.upload_phase().await?, &mut results)?;

        self.set_state(SessionState::Downloading);
        self.finish_phase(self.download_phase().await?, &mut results)?;

        self.set_state(SessionState::Deleting);
        self.finish_phase(self.delete_phase().await?, &mut results)?;

        // Conflicts flagged by the fetch phase, or discovered as races
        // during upload/download, win over any earlier per-record result.
        self.set_state(SessionState::Reconciling);
        for entry in self.store.fetch_records(&RecordPredicate::Conflicted)? {
            results.insert(
                entry.record_id.clone(),
                Err(RecordError::Conflicted(entry.record_id)),
            );
        }

        self.set_state(SessionState::Finished);
        self.progress.complete();

        let failed = results.values().filter(|r| r.is_err()).count();
        if failed > 0 {
            info!(failed, total = results.len(), "sync session finished with failures");
            Err(SyncError::Partial(results))
        } else {
            info!(total = results.len(), "sync session finished");
            Ok(results)
        }
    }

    fn finish_phase(
        &self,
        outcome: BatchOutcome,
        results: &mut RecordResults,
    ) -> Result<(), SyncError> {
        for (record_id, result) in outcome.results {
            results.insert(record_id, result);
        }

        match outcome.failure {
            None => self.check_cancelled(),
            Some(BatchFailure::Cancelled) => Err(SyncError::Cancelled),
            // The commit error is already in every record's result; the
            // session ends as partial without running later phases.
            Some(BatchFailure::Commit(_)) => Err(SyncError::Partial(std::mem::take(results))),
        }
    }

    async fn fetch_changes(&self) -> Result<ChangeSet, SyncError> {
        let task = ServiceTask::new(
            self.auth.clone(),
            self.config.retry.clone(),
            self.progress.child(1),
        );

        let result = match &self.change_token {
            Some(token) => task.run(|| self.service.fetch_changed_records(token)).await,
            None => task.run(|| self.service.fetch_all_records()).await,
        };

        result.map_err(|error| {
            if error.is_cancelled() {
                SyncError::Cancelled
            } else {
                SyncError::Fetch(error)
            }
        })
    }

    /// Mirrors the fetched change list into the store as one transaction,
    /// detecting conflicts along the way.
    fn merge_remote_changes(&self, change_set: &ChangeSet) -> Result<(), SyncError> {
        let mut changes = Vec::new();

        for (record_id, facet) in &change_set.records {
            match self.store.record(record_id)? {
                None => changes.push(RecordChange::UpsertRemoteFacet {
                    record_id: record_id.clone(),
                    facet: facet.clone(),
                }),
                Some(entry) => {
                    let local_updated = entry.local_status() == Some(RecordStatus::Updated);
                    let diverged = entry.local_version_identifier()
                        != Some(facet.version.identifier.as_str());

                    if local_updated && diverged {
                        self.merge_divergence(&entry, facet, &mut changes);
                    } else {
                        changes.push(RecordChange::UpsertRemoteFacet {
                            record_id: record_id.clone(),
                            facet: facet.clone(),
                        });
                    }
                }
            }
        }

        for record_id in &change_set.deleted {
            if let Some(entry) = self.store.record(record_id)? {
                if entry.remote.is_some() {
                    changes.push(RecordChange::SetRemoteStatus {
                        record_id: record_id.clone(),
                        status: RecordStatus::Deleted,
                    });
                }
                // A remote deletion racing a local edit is a conflict.
                if entry.local_status() == Some(RecordStatus::Updated) {
                    changes.push(RecordChange::SetConflicted {
                        record_id: record_id.clone(),
                        conflicted: true,
                    });
                }
            }
        }

        self.store.apply(changes)?;
        Ok(())
    }

    /// Stages the resolution for a record whose local facet was edited
    /// while the server accepted a different version.
    fn merge_divergence(
        &self,
        entry: &RecordEntry,
        facet: &RemoteFacet,
        changes: &mut Vec<RecordChange>,
    ) {
        let record_id = &entry.record_id;
        let action = self
            .store
            .entity(record_id)
            .ok()
            .flatten()
            .map(|entity| entity.resolve_conflict(entry))
            .unwrap_or(ConflictAction::Flag);

        let action = match action {
            ConflictAction::UseNewest | ConflictAction::UseOldest => {
                let local_date = entry.local.as_ref().and_then(|l| l.version.as_ref()).map(|v| v.date);
                let remote_newer = match local_date {
                    Some(date) => facet.version.date >= date,
                    None => true,
                };
                let use_remote = if action == ConflictAction::UseNewest {
                    remote_newer
                } else {
                    !remote_newer
                };
                if use_remote {
                    ConflictAction::UseRemote
                } else {
                    ConflictAction::UseLocal
                }
            }
            action => action,
        };

        match action {
            ConflictAction::UseLocal => {
                debug!(record = %record_id, "divergence resolved: keeping local");
                // Mirror the remote version as already-seen so the pending
                // upload replaces it instead of conflicting.
                let mut kept = facet.clone();
                kept.status = RecordStatus::Normal;
                changes.push(RecordChange::UpsertRemoteFacet {
                    record_id: record_id.clone(),
                    facet: kept,
                });
                changes.push(RecordChange::SetLocalVersion {
                    record_id: record_id.clone(),
                    version: facet.version.clone(),
                });
            }
            ConflictAction::UseRemote => {
                debug!(record = %record_id, "divergence resolved: taking remote");
                changes.push(RecordChange::UpsertRemoteFacet {
                    record_id: record_id.clone(),
                    facet: facet.clone(),
                });
                changes.push(RecordChange::SetLocalStatus {
                    record_id: record_id.clone(),
                    status: RecordStatus::Normal,
                });
            }
            _ => {
                debug!(record = %record_id, "divergence flagged as conflict");
                changes.push(RecordChange::UpsertRemoteFacet {
                    record_id: record_id.clone(),
                    facet: facet.clone(),
                });
                changes.push(RecordChange::SetConflicted {
                    record_id: record_id.clone(),
                    conflicted: true,
                });
            }
        }
    }

    fn operation_context(&self, processor: &BatchProcessor) -> OperationContext {
        OperationContext::new(
            self.store.clone(),
            self.service.clone(),
            self.auth.clone(),
            self.config.clone(),
        )
        .with_save(processor.save_context())
    }

    async fn upload_phase(&self) -> Result<BatchOutcome, SyncError> {
        let store = self.store.clone();
        let processor = BatchProcessor::new(
            self.store.clone(),
            self.config.clone(),
            RecordPredicate::Upload,
            self.progress.child(1),
        )
        // Validate that each selected record still has an entity to read
        // from before its operation spins up.
        .with_pre_process(Box::new(move |records, results| {
            records
                .into_iter()
                .filter(|entry| match store.entity(&entry.record_id) {
                    Ok(Some(_)) => true,
                    Ok(None) => {
                        results.insert(
                            entry.record_id.clone(),
                            Err(RecordError::Validation(
                                entry.record_id.clone(),
                                ValidationError::MissingEntity,
                            )),
                        );
                        false
                    }
                    Err(error) => {
                        results.insert(
                            entry.record_id.clone(),
                            Err(RecordError::other(entry.record_id.clone(), error)),
                        );
                        false
                    }
                })
                .collect()
        }));

        let template = self.operation_context(&processor);
        let outcome = processor
            .run(|entry, progress| {
                let ctx = template.clone().with_progress(progress);
                Box::pin(async move {
                    let operation = UploadRecordOperation::new(&entry, ctx)?;
                    operation.run().await.map(|_| ())
                }) as OperationFuture
            })
            .await?;
        Ok(outcome)
    }

    async fn download_phase(&self) -> Result<BatchOutcome, SyncError> {
        let processor = BatchProcessor::new(
            self.store.clone(),
            self.config.clone(),
            RecordPredicate::Download,
            self.progress.child(1),
        );

        let template = self.operation_context(&processor);
        let outcome = processor
            .run(|entry, progress| {
                let ctx = template.clone().with_progress(progress);
                Box::pin(async move {
                    let operation = DownloadRecordOperation::new(&entry, ctx)?;
                    operation.run().await
                }) as OperationFuture
            })
            .await?;
        Ok(outcome)
    }

    async fn delete_phase(&self) -> Result<BatchOutcome, SyncError> {
        let processor = BatchProcessor::new(
            self.store.clone(),
            self.config.clone(),
            RecordPredicate::Delete,
            self.progress.child(1),
        )
        // Successful deletions also drop any cached downloaded blobs.
        .with_post_process(Box::new(|results, save| {
            for (record_id, result) in results {
                if result.is_ok() {
                    save.stage(RecordChange::PurgeCachedFiles {
                        record_id: record_id.clone(),
                    });
                }
            }
        }));

        let template = self.operation_context(&processor);
        let outcome = processor
            .run(|entry, progress| {
                let ctx = template.clone().with_progress(progress);
                Box::pin(async move {
                    let operation = DeleteRecordOperation::new(&entry, ctx)?;
                    operation.run().await
                }) as OperationFuture
            })
            .await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRecordStore;
    use crate::service::{MockService, RemoteEntity};
    use crate::testutil::{note, note_factory, remote_facet, version, StubAuth};
    use tandem_model::{FetchError, RecordID};

    struct Fixture {
        store: Arc<MemoryRecordStore>,
        service: Arc<MockService>,
        auth: Arc<crate::testutil::StubAuth>,
    }

    fn fixture() -> Fixture {
        Fixture {
            store: Arc::new(MemoryRecordStore::with_entity_factory(note_factory())),
            service: Arc::new(MockService::new()),
            auth: StubAuth::authenticated(),
        }
    }

    fn session(fixture: &Fixture, token: Option<ChangeToken>) -> SyncSession {
        SyncSession::new(
            fixture.store.clone(),
            fixture.service.clone(),
            fixture.auth.clone(),
            SyncConfig::new(),
            token,
            Progress::new(1),
        )
    }

    fn changed_record(id: &str, version_id: &str) -> (RecordID, RemoteFacet) {
        (
            RecordID::new("Note", id),
            remote_facet(&format!("r-{id}"), RecordStatus::Updated, version_id),
        )
    }

    #[tokio::test]
    async fn a_clean_store_syncs_successfully() {
        let fixture = fixture();
        let session = session(&fixture, None);

        let results = session.run().await.unwrap();
        assert!(results.is_empty());
        assert_eq!(session.state(), SessionState::Finished);
        assert!(session.updated_change_token().is_some());
    }

    #[tokio::test]
    async fn concurrent_edits_reconcile_as_conflicts_superseding_uploads() {
        let fixture = fixture();

        // Record A: locally updated at v1, remotely updated at v2.
        let entity = note("a", "local edit");
        let id = fixture.store.seed_entity(entity, RecordStatus::Updated);
        let mut entry = fixture.store.record(&id).unwrap().unwrap();
        entry.local.as_mut().unwrap().version = Some(version("v1"));
        entry.remote = Some(remote_facet("r-a", RecordStatus::Normal, "v1"));
        fixture.store.seed_entry(entry);

        let mut change_set = ChangeSet::empty(ChangeToken::new(b"t1".to_vec()));
        change_set.records.push(changed_record("a", "v2"));
        fixture.service.push_fetch_response(Ok(change_set));

        let session = session(&fixture, None);
        let error = session.run().await.unwrap_err();

        let results = error.partial_results().expect("partial failure");
        assert_eq!(
            results[&id].as_ref().unwrap_err(),
            &RecordError::Conflicted(id.clone())
        );

        // The conflicted record never reached the upload phase.
        assert_eq!(fixture.service.upload_record_calls(), 0);
        assert!(fixture.store.record(&id).unwrap().unwrap().is_conflicted);
    }

    #[tokio::test]
    async fn use_local_resolution_keeps_the_edit_and_uploads_it() {
        let fixture = fixture();

        let entity = note("a", "local edit");
        entity.set_conflict_action(ConflictAction::UseLocal);
        let id = fixture.store.seed_entity(entity, RecordStatus::Updated);
        let mut entry = fixture.store.record(&id).unwrap().unwrap();
        entry.local.as_mut().unwrap().version = Some(version("v1"));
        entry.remote = Some(remote_facet("r-a", RecordStatus::Normal, "v1"));
        fixture.store.seed_entry(entry);

        let mut change_set = ChangeSet::empty(ChangeToken::new(b"t1".to_vec()));
        change_set.records.push(changed_record("a", "v2"));
        fixture.service.push_fetch_response(Ok(change_set));

        let session = session(&fixture, None);
        let results = session.run().await.unwrap();

        assert!(results[&id].is_ok());
        assert_eq!(fixture.service.upload_record_calls(), 1);
        assert_eq!(fixture.service.download_record_calls(), 0);
        assert!(!fixture.store.record(&id).unwrap().unwrap().is_conflicted);
    }

    #[tokio::test]
    async fn use_remote_resolution_discards_the_edit_and_downloads() {
        let fixture = fixture();

        let entity = note("a", "local edit");
        entity.set_conflict_action(ConflictAction::UseRemote);
        let id = fixture.store.seed_entity(entity, RecordStatus::Updated);
        let mut entry = fixture.store.record(&id).unwrap().unwrap();
        entry.local.as_mut().unwrap().version = Some(version("v1"));
        entry.remote = Some(remote_facet("r-a", RecordStatus::Normal, "v1"));
        fixture.store.seed_entry(entry);

        let mut change_set = ChangeSet::empty(ChangeToken::new(b"t1".to_vec()));
        change_set.records.push(changed_record("a", "v2"));
        fixture.service.push_fetch_response(Ok(change_set));
        fixture.service.seed_remote_entity(
            id.clone(),
            RemoteEntity {
                payload: serde_json::to_vec("server edit").unwrap(),
                files: vec![],
            },
        );

        let session = session(&fixture, None);
        let results = session.run().await.unwrap();

        assert!(results[&id].is_ok());
        assert_eq!(fixture.service.upload_record_calls(), 0);
        assert_eq!(fixture.service.download_record_calls(), 1);
    }

    #[tokio::test]
    async fn a_fetch_failure_aborts_the_whole_session() {
        let fixture = fixture();
        fixture.store.seed_entity(note("a", "pending"), RecordStatus::Updated);
        fixture
            .service
            .push_fetch_response(Err(FetchError::InvalidChangeToken));

        let session = session(&fixture, Some(ChangeToken::new(b"stale".to_vec())));
        let error = session.run().await.unwrap_err();

        assert_eq!(error, SyncError::Fetch(FetchError::InvalidChangeToken));
        assert_eq!(fixture.service.upload_record_calls(), 0);
        assert!(session.updated_change_token().is_none());
    }

    #[tokio::test]
    async fn remote_deletions_tombstone_and_delete_locally() {
        let fixture = fixture();

        let entity = note("a", "kept in sync");
        let id = fixture.store.seed_entity(entity, RecordStatus::Normal);
        let mut entry = fixture.store.record(&id).unwrap().unwrap();
        entry.local.as_mut().unwrap().version = Some(version("v1"));
        entry.remote = Some(remote_facet("r-a", RecordStatus::Normal, "v1"));
        fixture.store.seed_entry(entry);

        let mut change_set = ChangeSet::empty(ChangeToken::new(b"t1".to_vec()));
        change_set.deleted.push(id.clone());
        fixture.service.push_fetch_response(Ok(change_set));

        let session = session(&fixture, None);
        let results = session.run().await.unwrap();

        assert!(results[&id].is_ok());
        assert_eq!(fixture.service.delete_record_calls(), 1);
        assert!(fixture.store.record(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn a_remote_deletion_racing_a_local_edit_is_a_conflict() {
        let fixture = fixture();

        let entity = note("a", "local edit");
        let id = fixture.store.seed_entity(entity, RecordStatus::Updated);
        let mut entry = fixture.store.record(&id).unwrap().unwrap();
        entry.local.as_mut().unwrap().version = Some(version("v1"));
        entry.remote = Some(remote_facet("r-a", RecordStatus::Normal, "v1"));
        fixture.store.seed_entry(entry);

        let mut change_set = ChangeSet::empty(ChangeToken::new(b"t1".to_vec()));
        change_set.deleted.push(id.clone());
        fixture.service.push_fetch_response(Ok(change_set));

        let session = session(&fixture, None);
        let error = session.run().await.unwrap_err();

        let results = error.partial_results().expect("partial failure");
        assert!(matches!(
            results[&id].as_ref().unwrap_err(),
            RecordError::Conflicted(_)
        ));
        assert_eq!(fixture.service.delete_record_calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_mid_download_stops_later_phases() {
        let fixture = fixture();

        // One record to download, one to delete afterwards.
        let download_id = RecordID::new("Note", "dl");
        let mut entry = tandem_model::RecordEntry::new(download_id.clone());
        entry.remote = Some(remote_facet("r-dl", RecordStatus::Updated, "v1"));
        fixture.store.seed_entry(entry);
        fixture.service.seed_remote_entity(
            download_id.clone(),
            RemoteEntity {
                payload: serde_json::to_vec("body").unwrap(),
                files: vec![],
            },
        );
        fixture
            .store
            .seed_entity(note("gone", "bye"), RecordStatus::Deleted);

        let release = fixture.service.hold_calls();
        let progress = Progress::new(1);
        let session = Arc::new(SyncSession::new(
            fixture.store.clone(),
            fixture.service.clone(),
            fixture.auth.clone(),
            SyncConfig::new(),
            None,
            progress.clone(),
        ));

        let runner = tokio::spawn({
            let session = session.clone();
            async move { session.run().await }
        });

        // Let the session reach the gated download, then cancel.
        tokio::task::yield_now().await;
        while session.state() != SessionState::Downloading {
            tokio::task::yield_now().await;
        }
        progress.cancel();
        release.send(true).unwrap();

        let outcome = runner.await.unwrap();
        assert_eq!(outcome.unwrap_err(), SyncError::Cancelled);

        // The delete phase never started, and the tombstoned record is
        // still there.
        assert_eq!(fixture.service.delete_record_calls(), 0);
        let gone = RecordID::new("Note", "gone");
        assert!(fixture.store.record(&gone).unwrap().is_some());
    }
}
