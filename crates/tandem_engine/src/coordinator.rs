//! Sync coordinator.
//!
//! The public entry point. Owns the authenticated account, the single-slot
//! session queue (at most one sync session runs at a time, and a `sync()`
//! while one is queued but not yet started returns the queued handle), and
//! the ad-hoc single-record operations.

use crate::config::SyncConfig;
use crate::operation::{DownloadRecordOperation, OperationContext, UploadRecordOperation};
use crate::progress::Progress;
use crate::service::Service;
use crate::session::{SessionOutcome, SyncSession};
use crate::store::{RecordChange, RecordStore, SaveContext};
use crate::task::{Reauthenticator, ServiceTask};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tandem_model::{
    Account, AuthenticationError, DeauthenticationError, RecordEntry, RecordError, RecordID,
    RecordMetadata, RecordStatus, RemoteFacet, SyncError, Version,
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

/// Events published around sync sessions.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A session has started executing.
    Started,
    /// A session finished, carrying the full per-record outcome.
    Finished(Arc<SessionOutcome>),
}

/// How a conflicted record should be resolved.
#[derive(Debug, Clone)]
pub enum ConflictResolution {
    /// Keep the local state and upload it over the remote version.
    Local,
    /// Restore the record to the given remote version.
    Remote(Version),
}

/// Handle to a queued or running sync session.
///
/// Cloning shares the underlying session; cancelling any clone cancels it.
#[derive(Clone)]
pub struct SyncHandle {
    progress: Progress,
    outcome: watch::Receiver<Option<Arc<SessionOutcome>>>,
    started: Arc<AtomicBool>,
}

impl SyncHandle {
    /// The session's progress and cancellation token.
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Requests cancellation of the session.
    pub fn cancel(&self) {
        self.progress.cancel();
    }

    /// Whether the session has left the queue and begun executing.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Waits for the session to finish and returns its outcome.
    pub async fn outcome(&self) -> Arc<SessionOutcome> {
        let mut rx = self.outcome.clone();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Arc::new(Err(SyncError::Cancelled));
            }
        }
    }
}

struct CoordinatorInner {
    service: Arc<dyn Service>,
    store: Arc<dyn RecordStore>,
    config: SyncConfig,
    account: RwLock<Option<Account>>,
    is_authenticated: AtomicBool,
    is_started: AtomicBool,
    session_slot: tokio::sync::Mutex<()>,
    queued: Mutex<Option<SyncHandle>>,
    current: Mutex<Option<SyncHandle>>,
    events: broadcast::Sender<SyncEvent>,
}

impl CoordinatorInner {
    async fn authenticate_with_service(
        &self,
        interactive: bool,
    ) -> Result<Account, AuthenticationError> {
        // Authentication is exempt from requiring authentication, and runs
        // outside the session queue so it can never deadlock behind a task
        // that is itself waiting to reauthenticate.
        let task = ServiceTask::unauthenticated(self.config.retry.clone(), Progress::new(1));
        let service = self.service.clone();
        let result = if interactive {
            task.run(|| service.authenticate()).await
        } else {
            task.run(|| service.authenticate_in_background()).await
        };
        let mut account = result?;

        // Reauthenticating the same service account keeps its change token.
        if let Ok(Some(existing)) = self.store.account() {
            if existing.service_identifier == account.service_identifier
                && account.change_token.is_none()
            {
                account.change_token = existing.change_token;
            }
        }

        self.store
            .save_account(&account)
            .map_err(|e| AuthenticationError::Other(e.to_string()))?;
        *self.account.write() = Some(account.clone());
        self.is_authenticated.store(true, Ordering::SeqCst);
        info!(account = %account.name, "authenticated");
        Ok(account)
    }

    fn ensure_started(&self) -> Result<(), SyncError> {
        if self.is_started.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.store.start()?;
        if let Ok(account) = self.store.account() {
            *self.account.write() = account;
        }
        self.is_started.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Reauthenticator for CoordinatorInner {
    fn is_authenticated(&self) -> bool {
        self.is_authenticated.load(Ordering::SeqCst)
    }

    async fn reauthenticate(&self) -> Result<Account, AuthenticationError> {
        self.authenticate_with_service(false).await
    }
}

/// Public entry point for the sync engine.
///
/// Must be used within a tokio runtime; sessions run as spawned tasks.
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    /// Creates a coordinator over the given collaborators.
    pub fn new(
        service: Arc<dyn Service>,
        store: Arc<dyn RecordStore>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(CoordinatorInner {
                service,
                store,
                config,
                account: RwLock::new(None),
                is_authenticated: AtomicBool::new(false),
                is_started: AtomicBool::new(false),
                session_slot: tokio::sync::Mutex::new(()),
                queued: Mutex::new(None),
                current: Mutex::new(None),
                events,
            }),
        }
    }

    /// Subscribes to session start/finish events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// The cached account, if authenticated or loaded from the store.
    pub fn account(&self) -> Option<Account> {
        self.inner.account.read().clone()
    }

    /// Whether a service session is currently authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.inner.is_authenticated.load(Ordering::SeqCst)
    }

    /// Whether `start` has completed.
    pub fn is_started(&self) -> bool {
        self.inner.is_started.load(Ordering::SeqCst)
    }

    /// Whether a session is queued or running.
    pub fn is_syncing(&self) -> bool {
        self.inner.current.lock().is_some() || self.inner.queued.lock().is_some()
    }

    /// Initializes the store and attempts a silent authentication.
    ///
    /// Missing saved credentials are not an error: the coordinator ends up
    /// started but unauthenticated and returns `Ok(None)`.
    pub async fn start(&self) -> Result<Option<Account>, SyncError> {
        if self.is_started() {
            return Ok(self.account());
        }

        self.inner.ensure_started()?;

        match self.inner.authenticate_with_service(false).await {
            Ok(account) => Ok(Some(account)),
            Err(AuthenticationError::NoSavedCredentials) => Ok(None),
            Err(error) => {
                if self.account().is_none() {
                    Ok(None)
                } else {
                    Err(SyncError::Authentication(error))
                }
            }
        }
    }

    /// Authenticates interactively.
    pub async fn authenticate(&self) -> Result<Account, AuthenticationError> {
        self.inner
            .ensure_started()
            .map_err(|e| AuthenticationError::Other(e.to_string()))?;
        self.inner.authenticate_with_service(true).await
    }

    /// Deauthenticates and resets all local sync state.
    ///
    /// Cancels the sync queue first; it must not run concurrently with a
    /// session mutating the store it is about to wipe.
    pub async fn deauthenticate(&self) -> Result<(), DeauthenticationError> {
        let inner = &self.inner;
        let was_authenticated = inner.is_authenticated.swap(false, Ordering::SeqCst);

        if let Some(handle) = inner.queued.lock().take() {
            handle.cancel();
        }
        if let Some(handle) = inner.current.lock().clone() {
            handle.cancel();
        }

        let result = async {
            let task = ServiceTask::unauthenticated(inner.config.retry.clone(), Progress::new(1));
            let service = inner.service.clone();
            task.run(|| service.deauthenticate()).await?;
            inner
                .store
                .reset()
                .map_err(|e| DeauthenticationError::other(e.to_string()))?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                *inner.account.write() = None;
                info!("deauthenticated and reset local state");
                Ok(())
            }
            Err(error) => {
                inner
                    .is_authenticated
                    .store(was_authenticated, Ordering::SeqCst);
                Err(error)
            }
        }
    }

    /// Enqueues a sync session, or returns the already-queued one.
    ///
    /// On completion the session's change token is persisted (for success
    /// and partial outcomes) and a [`SyncEvent::Finished`] is published with
    /// the full result.
    pub fn sync(&self) -> SyncHandle {
        {
            let queued = self.inner.queued.lock();
            if let Some(handle) = queued.as_ref() {
                if !handle.has_started() {
                    debug!("sync already queued, returning existing session");
                    return handle.clone();
                }
            }
        }

        let (tx, rx) = watch::channel(None);
        let handle = SyncHandle {
            progress: Progress::new(1),
            outcome: rx,
            started: Arc::new(AtomicBool::new(false)),
        };
        *self.inner.queued.lock() = Some(handle.clone());

        let inner = self.inner.clone();
        let session_handle = handle.clone();
        tokio::spawn(async move {
            let _slot = inner.session_slot.lock().await;
            session_handle.started.store(true, Ordering::SeqCst);
            {
                let mut queued = inner.queued.lock();
                if queued.as_ref().map(|h| h.has_started()).unwrap_or(false) {
                    *queued = None;
                }
            }
            *inner.current.lock() = Some(session_handle.clone());
            let _ = inner.events.send(SyncEvent::Started);

            let change_token = inner
                .store
                .account()
                .ok()
                .flatten()
                .and_then(|a| a.change_token);
            let auth: Arc<dyn Reauthenticator> = inner.clone();
            let session = SyncSession::new(
                inner.store.clone(),
                inner.service.clone(),
                auth,
                inner.config.clone(),
                change_token,
                session_handle.progress.child(1),
            );

            let outcome = session.run().await;

            // The token is persisted only once the session has concluded,
            // successfully or partially.
            if matches!(outcome, Ok(_) | Err(SyncError::Partial(_))) {
                if let Some(token) = session.updated_change_token() {
                    if let Ok(Some(mut account)) = inner.store.account() {
                        account.change_token = Some(token);
                        match inner.store.save_account(&account) {
                            Ok(()) => *inner.account.write() = Some(account),
                            Err(error) => error!(%error, "failed to save change token"),
                        }
                    }
                }
            }

            let outcome = Arc::new(outcome);
            *inner.current.lock() = None;
            let _ = tx.send(Some(outcome.clone()));
            let _ = inner.events.send(SyncEvent::Finished(outcome));
        });

        handle
    }

    /// Uploads one record outside a session.
    pub async fn upload_record(&self, record_id: &RecordID) -> Result<RemoteFacet, RecordError> {
        let entry = self.entry(record_id)?;
        let (save, ctx) = self.operation_context();

        let operation = UploadRecordOperation::new(&entry, ctx)?;
        let facet = operation.run().await?;
        self.commit(record_id, &save)?;
        Ok(facet)
    }

    /// Restores one record to a specific remote version.
    ///
    /// The restored state is marked as a pending upload pinned to the
    /// current remote version, so the next sync publishes it without
    /// conflicting. A locked record restores like any other download with
    /// an explicit version.
    pub async fn restore_record(
        &self,
        record_id: &RecordID,
        version: &Version,
    ) -> Result<(), RecordError> {
        let entry = self.entry(record_id)?;
        let (save, ctx) = self.operation_context();

        let operation = DownloadRecordOperation::new(&entry, ctx)?.with_version(version.clone());
        operation.run().await?;
        self.commit(record_id, &save)?;

        let mut changes = vec![RecordChange::SetLocalStatus {
            record_id: record_id.clone(),
            status: RecordStatus::Updated,
        }];
        if let Ok(Some(entry)) = self.inner.store.record(record_id) {
            if let Some(remote) = entry.remote {
                changes.push(RecordChange::SetLocalVersion {
                    record_id: record_id.clone(),
                    version: remote.version,
                });
            }
        }
        self.inner
            .store
            .apply(changes)
            .map_err(|e| RecordError::other(record_id.clone(), e))?;
        self.inner.store.process_pending_updates();
        Ok(())
    }

    /// Lists the versions the server retains for one record.
    pub async fn fetch_versions(&self, record_id: &RecordID) -> Result<Vec<Version>, RecordError> {
        let auth: Arc<dyn Reauthenticator> = self.inner.clone();
        let task = ServiceTask::new(auth, self.inner.config.retry.clone(), Progress::new(1));
        let service = self.inner.service.clone();

        task.run(|| service.fetch_versions(record_id))
            .await
            .map_err(|e| RecordError::normalize(record_id.clone(), e))
    }

    /// Replaces one record's remote metadata without uploading a version.
    pub async fn update_record_metadata(
        &self,
        record_id: &RecordID,
        metadata: &RecordMetadata,
    ) -> Result<(), RecordError> {
        let auth: Arc<dyn Reauthenticator> = self.inner.clone();
        let task = ServiceTask::new(auth, self.inner.config.retry.clone(), Progress::new(1));
        let service = self.inner.service.clone();

        task.run(|| service.update_metadata(record_id, metadata))
            .await
            .map_err(|e| RecordError::normalize(record_id.clone(), e))
    }

    /// Enables or disables syncing for one record.
    pub fn set_syncing_enabled(
        &self,
        record_id: &RecordID,
        enabled: bool,
    ) -> Result<(), RecordError> {
        self.inner
            .store
            .apply(vec![RecordChange::SetSyncingEnabled {
                record_id: record_id.clone(),
                enabled,
            }])
            .map_err(|e| RecordError::other(record_id.clone(), e))
    }

    /// Resolves a conflicted record by either uploading the local state or
    /// restoring a remote version.
    ///
    /// On failure the conflicted flag is re-raised, so the record is never
    /// left unflagged in an inconsistent state.
    pub async fn resolve_conflicted_record(
        &self,
        record_id: &RecordID,
        resolution: ConflictResolution,
    ) -> Result<(), RecordError> {
        self.set_conflicted(record_id, false)?;

        let result = match resolution {
            ConflictResolution::Local => self.upload_record(record_id).await.map(|_| ()),
            ConflictResolution::Remote(version) => self.restore_record(record_id, &version).await,
        };

        if let Err(error) = result {
            let _ = self.set_conflicted(record_id, true);
            return Err(error);
        }
        Ok(())
    }

    fn set_conflicted(&self, record_id: &RecordID, conflicted: bool) -> Result<(), RecordError> {
        self.inner
            .store
            .apply(vec![RecordChange::SetConflicted {
                record_id: record_id.clone(),
                conflicted,
            }])
            .map_err(|e| RecordError::other(record_id.clone(), e))
    }

    fn entry(&self, record_id: &RecordID) -> Result<RecordEntry, RecordError> {
        self.inner
            .store
            .record(record_id)
            .map_err(|e| RecordError::other(record_id.clone(), e))?
            .ok_or_else(|| RecordError::DoesNotExist(record_id.clone()))
    }

    fn operation_context(&self) -> (Arc<SaveContext>, OperationContext) {
        let save = Arc::new(SaveContext::new());
        let auth: Arc<dyn Reauthenticator> = self.inner.clone();
        let ctx = OperationContext::new(
            self.inner.store.clone(),
            self.inner.service.clone(),
            auth,
            self.inner.config.clone(),
        )
        .with_save(save.clone());
        (save, ctx)
    }

    fn commit(&self, record_id: &RecordID, save: &SaveContext) -> Result<(), RecordError> {
        self.inner
            .store
            .apply(save.take_changes())
            .map_err(|e| RecordError::other(record_id.clone(), e))?;
        self.inner.store.process_pending_updates();
        Ok(())
    }
}
