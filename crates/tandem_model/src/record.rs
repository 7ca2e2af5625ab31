//! Records and their local/remote facets.

use crate::file::RemoteFile;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Globally unique identifier for one syncable entity.
///
/// Stable across the local and remote representations of the entity, and
/// never reused for a different entity. Equality, hashing, and ordering are
/// by `(record_type, identifier)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordID {
    /// Domain entity type name.
    pub record_type: String,
    /// Stable primary-key value of the entity.
    pub identifier: String,
}

impl RecordID {
    /// Creates a new record ID.
    pub fn new(record_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for RecordID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.record_type, self.identifier)
    }
}

/// Per-facet lifecycle marker.
///
/// `Updated` and `Deleted` mark work pending on that side; `Normal` means
/// the facet matches its last synced version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    /// Facet matches its last synced version.
    #[default]
    Normal,
    /// Facet has changes not yet synced to the other side.
    Updated,
    /// Facet is tombstoned and pending deletion.
    Deleted,
}

/// Sync bookkeeping for the local half of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFacet {
    /// Lifecycle status of the local entity.
    pub status: RecordStatus,
    /// Last server-accepted version of the local entity, if any.
    pub version: Option<Version>,
    /// SHA-1 hex digest of the entity content at the last sync.
    pub sha1_hash: Option<String>,
    /// Bookkeeping for blobs uploaded on behalf of this entity.
    pub remote_files: Vec<RemoteFile>,
}

impl LocalFacet {
    /// Creates a facet with the given status and no sync history.
    pub fn with_status(status: RecordStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Looks up a remote file by its domain-side identifier.
    pub fn remote_file(&self, identifier: &str) -> Option<&RemoteFile> {
        self.remote_files.iter().find(|f| f.identifier == identifier)
    }
}

/// Server-known metadata for the remote half of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFacet {
    /// Server-issued identifier of the remote record.
    pub identifier: String,
    /// Lifecycle status of the remote record.
    pub status: RecordStatus,
    /// Latest server-accepted version.
    pub version: Version,
    /// SHA-1 hex digest of the content at `version`, if the server reports one.
    pub sha1_hash: Option<String>,
    /// Whether the record is write-protected on the server.
    pub is_locked: bool,
    /// Last version known to be unlocked, kept so a locked record can still
    /// be read at its previous state.
    pub previous_unlocked_version: Option<Version>,
    /// Device or user that produced `version`.
    pub author: Option<String>,
    /// Human-readable name reported by the uploader.
    pub display_name: Option<String>,
    /// Free-form domain metadata attached to the remote record.
    pub metadata: BTreeMap<String, String>,
}

impl RemoteFacet {
    /// Creates a minimal facet at the given version.
    pub fn new(identifier: impl Into<String>, status: RecordStatus, version: Version) -> Self {
        Self {
            identifier: identifier.into(),
            status,
            version,
            sha1_hash: None,
            is_locked: false,
            previous_unlocked_version: None,
            author: None,
            display_name: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// The store's row for one record: shared flags plus the two facets.
///
/// An entry is a value snapshot, not a live reference. Code that crosses an
/// execution-context boundary re-fetches the entry by ID rather than holding
/// on to a stale copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    /// The record's identity.
    pub record_id: RecordID,
    /// Whether local and remote have diverged and need explicit resolution.
    /// A conflicted record is excluded from every sync phase.
    pub is_conflicted: bool,
    /// Whether the record participates in syncing at all.
    pub is_syncing_enabled: bool,
    /// Local facet, absent until the record exists locally.
    pub local: Option<LocalFacet>,
    /// Remote facet, absent until the server knows about the record.
    pub remote: Option<RemoteFacet>,
}

impl RecordEntry {
    /// Creates an empty entry for the given record ID.
    pub fn new(record_id: RecordID) -> Self {
        Self {
            record_id,
            is_conflicted: false,
            is_syncing_enabled: true,
            local: None,
            remote: None,
        }
    }

    /// Status of the local facet, if present.
    pub fn local_status(&self) -> Option<RecordStatus> {
        self.local.as_ref().map(|f| f.status)
    }

    /// Status of the remote facet, if present.
    pub fn remote_status(&self) -> Option<RecordStatus> {
        self.remote.as_ref().map(|f| f.status)
    }

    /// Version identifier the local facet was last synced against.
    pub fn local_version_identifier(&self) -> Option<&str> {
        self.local
            .as_ref()
            .and_then(|f| f.version.as_ref())
            .map(|v| v.identifier.as_str())
    }
}
