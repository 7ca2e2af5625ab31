//! Error taxonomy for sync operations.
//!
//! Errors are normalized to the most specific known kind as they cross
//! layers: a `ServiceError::ItemDoesNotExist` raised while operating on a
//! record becomes `RecordError::DoesNotExist`, and the same error raised for
//! a file becomes `FileError::DoesNotExist`. Callers pattern-match on the
//! normalized kind without caring which layer produced it.

use crate::record::RecordID;
use std::collections::BTreeMap;
use thiserror::Error;

/// Per-record outcome map produced by a batch or a whole session.
pub type RecordResults = BTreeMap<RecordID, Result<(), RecordError>>;

/// Errors with no more specific home.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeneralError {
    /// The operation was cancelled.
    #[error("the operation was cancelled")]
    Cancelled,

    /// An unknown error occurred.
    #[error("an unknown error occurred")]
    Unknown,
}

/// Errors surfaced by the remote service transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The server returned a response the client could not interpret.
    #[error("the server returned an invalid response")]
    InvalidResponse,

    /// The request rate exceeded the server's rate limit.
    #[error("the request rate exceeded the server's rate limit")]
    RateLimitExceeded,

    /// The requested item does not exist on the server.
    #[error("the requested item does not exist")]
    ItemDoesNotExist,

    /// The requested item has been restricted by the sync provider.
    #[error("the requested item has been restricted by the sync provider")]
    RestrictedContent,

    /// The connection to the server failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The authentication token has expired.
    #[error("the authentication token has expired")]
    TokenExpired,

    /// The call was cancelled before completing.
    #[error("the request was cancelled")]
    Cancelled,

    /// Any other service failure.
    #[error("service error: {0}")]
    Other(String),
}

impl ServiceError {
    /// Creates a connection-failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Creates an uninterpreted service error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// Errors raised while authenticating.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthenticationError {
    /// The current user is not authenticated.
    #[error("the current user is not authenticated")]
    NotAuthenticated,

    /// There are no saved credentials for the current user.
    #[error("there are no saved credentials for the current user")]
    NoSavedCredentials,

    /// The authentication token has expired.
    #[error("the authentication token has expired")]
    TokenExpired,

    /// The underlying service call failed.
    #[error("failed to authenticate: {0}")]
    Service(#[source] ServiceError),

    /// Any other authentication failure.
    #[error("failed to authenticate: {0}")]
    Other(String),
}

impl AuthenticationError {
    /// Normalizes a service error into its authentication kind.
    pub fn normalize(error: ServiceError) -> Self {
        match error {
            ServiceError::TokenExpired => Self::TokenExpired,
            error => Self::Service(error),
        }
    }
}

/// Errors raised while deauthenticating.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeauthenticationError {
    /// Any deauthentication failure.
    #[error("failed to deauthenticate: {0}")]
    Other(String),
}

impl DeauthenticationError {
    /// Creates a deauthentication error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// Errors raised while fetching remote changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The provided change token was rejected by the server.
    #[error("the provided change token was invalid")]
    InvalidChangeToken,

    /// The underlying service call failed.
    #[error("failed to fetch remote changes: {0}")]
    Service(#[source] ServiceError),

    /// Any other fetch failure.
    #[error("failed to fetch remote changes: {0}")]
    Other(String),
}

impl FetchError {
    /// Returns true if the fetch failed because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Service(ServiceError::Cancelled))
    }
}

/// State-invariant violations detected while resolving a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The record has no local facet.
    #[error("the record's local data could not be found")]
    MissingLocalFacet,

    /// The record has no remote facet.
    #[error("the record's remote data could not be found")]
    MissingRemoteFacet,

    /// The record's domain entity could not be found.
    #[error("the record's entity could not be found")]
    MissingEntity,

    /// The record names a type the store does not know.
    #[error("record has unknown type '{0}'")]
    UnknownRecordType(String),

    /// The entity's primary key is missing or malformed.
    #[error("the entity's identifier is invalid")]
    InvalidIdentifier,

    /// The record's remote metadata is missing required keys.
    #[error("the record's remote metadata is invalid")]
    InvalidMetadata,
}

/// Errors raised while syncing one file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileError {
    /// The remote side names a file the local entity does not declare.
    #[error("file '{0}' is unknown")]
    UnknownFile(String),

    /// The file does not exist.
    #[error("file '{0}' does not exist")]
    DoesNotExist(String),

    /// The file has been restricted by the sync provider.
    #[error("file '{0}' has been restricted by the sync provider")]
    Restricted(String),

    /// The underlying service call failed.
    #[error("failed to sync file '{0}': {1}")]
    Service(String, #[source] ServiceError),

    /// Any other file failure.
    #[error("failed to sync file '{0}': {1}")]
    Other(String, String),
}

impl FileError {
    /// The identifier of the file this error concerns.
    pub fn file_identifier(&self) -> &str {
        match self {
            FileError::UnknownFile(id)
            | FileError::DoesNotExist(id)
            | FileError::Restricted(id)
            | FileError::Service(id, _)
            | FileError::Other(id, _) => id,
        }
    }

    /// Normalizes a service error into its file kind.
    pub fn normalize(identifier: impl Into<String>, error: ServiceError) -> Self {
        let identifier = identifier.into();
        match error {
            ServiceError::ItemDoesNotExist => Self::DoesNotExist(identifier),
            ServiceError::RestrictedContent => Self::Restricted(identifier),
            error => Self::Service(identifier, error),
        }
    }
}

/// Errors raised while syncing one record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// The record is write-protected on the server.
    #[error("record {0} is locked")]
    Locked(RecordID),

    /// The record does not exist.
    #[error("record {0} does not exist")]
    DoesNotExist(RecordID),

    /// Syncing is disabled for this record.
    #[error("syncing is disabled for record {0}")]
    SyncingDisabled(RecordID),

    /// The record is conflicted and must be resolved explicitly.
    #[error("record {0} is conflicted")]
    Conflicted(RecordID),

    /// One or more of the record's files failed to sync.
    #[error("failed to sync {} file(s) for record {0}", .1.len())]
    FilesFailed(RecordID, Vec<FileError>),

    /// The underlying service call failed.
    #[error("failed to sync record {0}: {1}")]
    Service(RecordID, #[source] ServiceError),

    /// The record's state violated an invariant.
    #[error("failed to sync record {0}: {1}")]
    Validation(RecordID, #[source] ValidationError),

    /// The operation on this record was cancelled.
    #[error("the operation on record {0} was cancelled")]
    Cancelled(RecordID),

    /// Any other record failure.
    #[error("failed to sync record {0}: {1}")]
    Other(RecordID, String),
}

impl RecordError {
    /// The ID of the record this error concerns.
    pub fn record_id(&self) -> &RecordID {
        match self {
            RecordError::Locked(id)
            | RecordError::DoesNotExist(id)
            | RecordError::SyncingDisabled(id)
            | RecordError::Conflicted(id)
            | RecordError::FilesFailed(id, _)
            | RecordError::Service(id, _)
            | RecordError::Validation(id, _)
            | RecordError::Cancelled(id)
            | RecordError::Other(id, _) => id,
        }
    }

    /// Normalizes a service error into its record kind.
    pub fn normalize(record_id: RecordID, error: ServiceError) -> Self {
        match error {
            ServiceError::ItemDoesNotExist => Self::DoesNotExist(record_id),
            ServiceError::Cancelled => Self::Cancelled(record_id),
            error => Self::Service(record_id, error),
        }
    }

    /// Wraps an uninterpreted failure.
    pub fn other(record_id: RecordID, message: impl ToString) -> Self {
        Self::Other(record_id, message.to_string())
    }

    /// The placeholder failure a batch seeds every selected record with
    /// before any work starts.
    pub fn unknown(record_id: RecordID) -> Self {
        Self::Other(record_id, GeneralError::Unknown.to_string())
    }
}

/// The top-level outcome kind for a sync session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Authentication failed before or during the session.
    #[error("failed to sync: {0}")]
    Authentication(#[from] AuthenticationError),

    /// Fetching remote changes failed; the session was aborted.
    #[error("failed to sync: {0}")]
    Fetch(#[from] FetchError),

    /// The session completed with per-record failures.
    #[error("failed to sync {} of {} record(s)", failure_count(.0), .0.len())]
    Partial(RecordResults),

    /// The session was cancelled.
    #[error("the sync session was cancelled")]
    Cancelled,

    /// Any other session failure.
    #[error("failed to sync: {0}")]
    Other(String),
}

impl SyncError {
    /// Creates an uninterpreted session error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// The per-record results of a partial failure, if any.
    pub fn partial_results(&self) -> Option<&RecordResults> {
        match self {
            SyncError::Partial(results) => Some(results),
            _ => None,
        }
    }
}

fn failure_count(results: &RecordResults) -> usize {
    results.values().filter(|result| result.is_err()).count()
}
