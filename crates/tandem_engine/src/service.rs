//! Remote service contract.
//!
//! The concrete backend is an external collaborator: the engine only ever
//! talks to it through the [`Service`] trait. Every call is a plain future;
//! retry, backoff, and reauthentication live in the
//! [`ServiceTask`](crate::ServiceTask) runner, not in implementations.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tandem_model::{
    Account, AuthenticationError, ChangeToken, DeauthenticationError, FetchError, FileContent,
    FileMetadata, LocalFile, RecordID, RecordMetadata, RecordStatus, RemoteFacet, RemoteFile,
    ServiceError, Version,
};
use tokio::sync::watch;
use uuid::Uuid;

/// The result of a fetch-changes call.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    /// Remote facets created or changed since the requested token.
    pub records: Vec<(RecordID, RemoteFacet)>,
    /// Records deleted on the server since the requested token. Always
    /// empty for a full fetch.
    pub deleted: Vec<RecordID>,
    /// Watermark to use for the next incremental fetch.
    pub change_token: ChangeToken,
}

impl ChangeSet {
    /// Creates an empty change set carrying only a token.
    pub fn empty(change_token: ChangeToken) -> Self {
        Self {
            records: Vec::new(),
            deleted: Vec::new(),
            change_token,
        }
    }
}

/// A downloaded record body.
#[derive(Debug, Clone)]
pub struct RemoteEntity {
    /// Serialized entity payload.
    pub payload: Vec<u8>,
    /// Files belonging to the record at the downloaded version.
    pub files: Vec<RemoteFile>,
}

/// Contract the engine requires from a remote sync backend.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable identifier of this service.
    fn identifier(&self) -> &str;

    /// Authenticates interactively.
    async fn authenticate(&self) -> Result<Account, AuthenticationError>;

    /// Authenticates silently from saved credentials.
    async fn authenticate_in_background(&self) -> Result<Account, AuthenticationError>;

    /// Tears down the authenticated session on the service side.
    async fn deauthenticate(&self) -> Result<(), DeauthenticationError>;

    /// Lists every record the service knows about.
    async fn fetch_all_records(&self) -> Result<ChangeSet, FetchError>;

    /// Lists records changed since the given token.
    async fn fetch_changed_records(&self, since: &ChangeToken) -> Result<ChangeSet, FetchError>;

    /// Uploads a record body and returns the server's new facet for it.
    async fn upload_record(
        &self,
        record_id: &RecordID,
        payload: &[u8],
        metadata: &RecordMetadata,
    ) -> Result<RemoteFacet, ServiceError>;

    /// Downloads a record body at the given version.
    async fn download_record(
        &self,
        record_id: &RecordID,
        version: &Version,
    ) -> Result<RemoteEntity, ServiceError>;

    /// Deletes a record on the server.
    async fn delete_record(&self, record_id: &RecordID) -> Result<(), ServiceError>;

    /// Uploads one file for a record.
    async fn upload_file(
        &self,
        record_id: &RecordID,
        file: &LocalFile,
        metadata: &FileMetadata,
    ) -> Result<RemoteFile, ServiceError>;

    /// Downloads one file's content.
    async fn download_file(
        &self,
        record_id: &RecordID,
        file: &RemoteFile,
    ) -> Result<FileContent, ServiceError>;

    /// Deletes one file on the server.
    async fn delete_file(&self, record_id: &RecordID, file: &RemoteFile)
        -> Result<(), ServiceError>;

    /// Replaces a record's remote metadata without uploading a new version.
    async fn update_metadata(
        &self,
        record_id: &RecordID,
        metadata: &RecordMetadata,
    ) -> Result<(), ServiceError>;

    /// Lists the versions the server retains for a record.
    async fn fetch_versions(&self, record_id: &RecordID) -> Result<Vec<Version>, ServiceError>;
}

/// A scripted service for testing.
///
/// Every endpoint has a response queue; a queued response is consumed once,
/// after which the endpoint falls back to a reasonable default (uploads
/// mint new facets, lookups consult seeded maps, deletions succeed). Call
/// counts are tracked per endpoint.
#[derive(Default)]
pub struct MockService {
    authenticate_responses: Mutex<VecDeque<Result<Account, AuthenticationError>>>,
    deauthenticate_responses: Mutex<VecDeque<Result<(), DeauthenticationError>>>,
    fetch_responses: Mutex<VecDeque<Result<ChangeSet, FetchError>>>,
    upload_record_responses: Mutex<VecDeque<Result<RemoteFacet, ServiceError>>>,
    download_record_responses: Mutex<VecDeque<Result<RemoteEntity, ServiceError>>>,
    delete_record_responses: Mutex<VecDeque<Result<(), ServiceError>>>,
    upload_file_responses: Mutex<VecDeque<Result<RemoteFile, ServiceError>>>,
    download_file_responses: Mutex<VecDeque<Result<FileContent, ServiceError>>>,
    delete_file_responses: Mutex<VecDeque<Result<(), ServiceError>>>,
    update_metadata_responses: Mutex<VecDeque<Result<(), ServiceError>>>,
    fetch_versions_responses: Mutex<VecDeque<Result<Vec<Version>, ServiceError>>>,

    remote_entities: Mutex<BTreeMap<RecordID, RemoteEntity>>,
    file_contents: Mutex<BTreeMap<(RecordID, String), FileContent>>,

    authenticate_calls: AtomicUsize,
    deauthenticate_calls: AtomicUsize,
    full_fetch_calls: AtomicUsize,
    incremental_fetch_calls: AtomicUsize,
    upload_record_calls: AtomicUsize,
    download_record_calls: AtomicUsize,
    delete_record_calls: AtomicUsize,
    upload_file_calls: AtomicUsize,
    download_file_calls: AtomicUsize,
    delete_file_calls: AtomicUsize,
    update_metadata_calls: AtomicUsize,
    fetch_versions_calls: AtomicUsize,

    gate: Mutex<Option<watch::Receiver<bool>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockService {
    /// Creates a mock service with empty queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an authentication response.
    pub fn push_authenticate_response(&self, response: Result<Account, AuthenticationError>) {
        self.authenticate_responses.lock().push_back(response);
    }

    /// Queues a deauthentication response.
    pub fn push_deauthenticate_response(&self, response: Result<(), DeauthenticationError>) {
        self.deauthenticate_responses.lock().push_back(response);
    }

    /// Queues a fetch response, shared by full and incremental fetches.
    pub fn push_fetch_response(&self, response: Result<ChangeSet, FetchError>) {
        self.fetch_responses.lock().push_back(response);
    }

    /// Queues a record-upload response.
    pub fn push_upload_record_response(&self, response: Result<RemoteFacet, ServiceError>) {
        self.upload_record_responses.lock().push_back(response);
    }

    /// Queues a record-download response.
    pub fn push_download_record_response(&self, response: Result<RemoteEntity, ServiceError>) {
        self.download_record_responses.lock().push_back(response);
    }

    /// Queues a record-deletion response.
    pub fn push_delete_record_response(&self, response: Result<(), ServiceError>) {
        self.delete_record_responses.lock().push_back(response);
    }

    /// Queues a file-upload response.
    pub fn push_upload_file_response(&self, response: Result<RemoteFile, ServiceError>) {
        self.upload_file_responses.lock().push_back(response);
    }

    /// Queues a file-download response.
    pub fn push_download_file_response(&self, response: Result<FileContent, ServiceError>) {
        self.download_file_responses.lock().push_back(response);
    }

    /// Queues a file-deletion response.
    pub fn push_delete_file_response(&self, response: Result<(), ServiceError>) {
        self.delete_file_responses.lock().push_back(response);
    }

    /// Queues a metadata-update response.
    pub fn push_update_metadata_response(&self, response: Result<(), ServiceError>) {
        self.update_metadata_responses.lock().push_back(response);
    }

    /// Queues a fetch-versions response.
    pub fn push_fetch_versions_response(&self, response: Result<Vec<Version>, ServiceError>) {
        self.fetch_versions_responses.lock().push_back(response);
    }

    /// Seeds the record body served for download requests.
    pub fn seed_remote_entity(&self, record_id: RecordID, entity: RemoteEntity) {
        self.remote_entities.lock().insert(record_id, entity);
    }

    /// Seeds the content served for file download requests.
    pub fn seed_file_content(&self, record_id: RecordID, content: FileContent) {
        self.file_contents
            .lock()
            .insert((record_id, content.identifier.clone()), content);
    }

    /// Holds every record and file call until the returned sender is given
    /// `true`. Fetch and authentication calls are not held.
    pub fn hold_calls(&self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        *self.gate.lock() = Some(rx);
        tx
    }

    /// Number of authentication calls made.
    pub fn authenticate_calls(&self) -> usize {
        self.authenticate_calls.load(Ordering::SeqCst)
    }

    /// Number of deauthentication calls made.
    pub fn deauthenticate_calls(&self) -> usize {
        self.deauthenticate_calls.load(Ordering::SeqCst)
    }

    /// Number of fetch calls made, full and incremental combined.
    pub fn fetch_calls(&self) -> usize {
        self.full_fetch_calls() + self.incremental_fetch_calls()
    }

    /// Number of full (tokenless) fetch calls made.
    pub fn full_fetch_calls(&self) -> usize {
        self.full_fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of incremental fetch calls made.
    pub fn incremental_fetch_calls(&self) -> usize {
        self.incremental_fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of record uploads attempted.
    pub fn upload_record_calls(&self) -> usize {
        self.upload_record_calls.load(Ordering::SeqCst)
    }

    /// Number of record downloads attempted.
    pub fn download_record_calls(&self) -> usize {
        self.download_record_calls.load(Ordering::SeqCst)
    }

    /// Number of record deletions attempted.
    pub fn delete_record_calls(&self) -> usize {
        self.delete_record_calls.load(Ordering::SeqCst)
    }

    /// Number of file uploads attempted.
    pub fn upload_file_calls(&self) -> usize {
        self.upload_file_calls.load(Ordering::SeqCst)
    }

    /// Number of file downloads attempted.
    pub fn download_file_calls(&self) -> usize {
        self.download_file_calls.load(Ordering::SeqCst)
    }

    /// Number of file deletions attempted.
    pub fn delete_file_calls(&self) -> usize {
        self.delete_file_calls.load(Ordering::SeqCst)
    }

    /// Number of metadata updates attempted.
    pub fn update_metadata_calls(&self) -> usize {
        self.update_metadata_calls.load(Ordering::SeqCst)
    }

    /// Number of fetch-versions calls made.
    pub fn fetch_versions_calls(&self) -> usize {
        self.fetch_versions_calls.load(Ordering::SeqCst)
    }

    /// The highest number of record/file calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn begin_call(&self) -> InFlightGuard<'_> {
        let gate = self.gate.lock().clone();
        if let Some(mut rx) = gate {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        InFlightGuard { service: self }
    }

    fn next_fetch_response(&self) -> Result<ChangeSet, FetchError> {
        let call = self.fetch_calls();
        self.fetch_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(ChangeSet::empty(ChangeToken::new(format!("token-{call}")))))
    }

    fn mint_remote_facet(&self, record_id: &RecordID, metadata: &RecordMetadata) -> RemoteFacet {
        RemoteFacet {
            identifier: format!("remote-{record_id}"),
            status: RecordStatus::Normal,
            version: Version::new(Uuid::new_v4().to_string(), Utc::now()),
            sha1_hash: metadata.sha1_hash.clone(),
            is_locked: metadata.is_locked,
            previous_unlocked_version: metadata.previous_version.clone(),
            author: metadata.author.clone(),
            display_name: metadata.display_name.clone(),
            metadata: metadata.extra.clone(),
        }
    }
}

struct InFlightGuard<'a> {
    service: &'a MockService,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.service.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Service for MockService {
    fn identifier(&self) -> &str {
        "mock"
    }

    async fn authenticate(&self) -> Result<Account, AuthenticationError> {
        self.authenticate_calls.fetch_add(1, Ordering::SeqCst);
        self.authenticate_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Account::new("tester", self.identifier())))
    }

    async fn authenticate_in_background(&self) -> Result<Account, AuthenticationError> {
        self.authenticate().await
    }

    async fn deauthenticate(&self) -> Result<(), DeauthenticationError> {
        self.deauthenticate_calls.fetch_add(1, Ordering::SeqCst);
        self.deauthenticate_responses
            .lock()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn fetch_all_records(&self) -> Result<ChangeSet, FetchError> {
        self.full_fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.next_fetch_response()
    }

    async fn fetch_changed_records(&self, _since: &ChangeToken) -> Result<ChangeSet, FetchError> {
        self.incremental_fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.next_fetch_response()
    }

    async fn upload_record(
        &self,
        record_id: &RecordID,
        _payload: &[u8],
        metadata: &RecordMetadata,
    ) -> Result<RemoteFacet, ServiceError> {
        let _guard = self.begin_call().await;
        self.upload_record_calls.fetch_add(1, Ordering::SeqCst);
        self.upload_record_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(self.mint_remote_facet(record_id, metadata)))
    }

    async fn download_record(
        &self,
        record_id: &RecordID,
        _version: &Version,
    ) -> Result<RemoteEntity, ServiceError> {
        let _guard = self.begin_call().await;
        self.download_record_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = self.download_record_responses.lock().pop_front() {
            return response;
        }
        self.remote_entities
            .lock()
            .get(record_id)
            .cloned()
            .ok_or(ServiceError::ItemDoesNotExist)
    }

    async fn delete_record(&self, _record_id: &RecordID) -> Result<(), ServiceError> {
        let _guard = self.begin_call().await;
        self.delete_record_calls.fetch_add(1, Ordering::SeqCst);
        self.delete_record_responses
            .lock()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn upload_file(
        &self,
        _record_id: &RecordID,
        file: &LocalFile,
        metadata: &FileMetadata,
    ) -> Result<RemoteFile, ServiceError> {
        let _guard = self.begin_call().await;
        self.upload_file_calls.fetch_add(1, Ordering::SeqCst);
        self.upload_file_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(RemoteFile {
                    identifier: metadata.identifier.clone(),
                    sha1_hash: metadata.sha1_hash.clone(),
                    remote_identifier: Uuid::new_v4().to_string(),
                    version_identifier: Uuid::new_v4().to_string(),
                    size: file.data.len() as u64,
                })
            })
    }

    async fn download_file(
        &self,
        record_id: &RecordID,
        file: &RemoteFile,
    ) -> Result<FileContent, ServiceError> {
        let _guard = self.begin_call().await;
        self.download_file_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = self.download_file_responses.lock().pop_front() {
            return response;
        }
        self.file_contents
            .lock()
            .get(&(record_id.clone(), file.identifier.clone()))
            .cloned()
            .ok_or(ServiceError::ItemDoesNotExist)
    }

    async fn delete_file(
        &self,
        _record_id: &RecordID,
        _file: &RemoteFile,
    ) -> Result<(), ServiceError> {
        let _guard = self.begin_call().await;
        self.delete_file_calls.fetch_add(1, Ordering::SeqCst);
        self.delete_file_responses
            .lock()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn update_metadata(
        &self,
        _record_id: &RecordID,
        _metadata: &RecordMetadata,
    ) -> Result<(), ServiceError> {
        let _guard = self.begin_call().await;
        self.update_metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.update_metadata_responses
            .lock()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn fetch_versions(&self, _record_id: &RecordID) -> Result<Vec<Version>, ServiceError> {
        let _guard = self.begin_call().await;
        self.fetch_versions_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch_versions_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}
