//! Typed metadata attached to uploads.

use crate::version::Version;
use std::collections::BTreeMap;

/// Metadata accompanying a record upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Domain entity type name.
    pub record_type: String,
    /// Stable primary-key value of the entity.
    pub identifier: String,
    /// Device or user performing the upload.
    pub author: Option<String>,
    /// Human-readable name of the entity.
    pub display_name: Option<String>,
    /// Whether the uploaded version should be write-protected on the server.
    pub is_locked: bool,
    /// The previous non-locked version, kept so the record can be restored
    /// if it ends up locked indefinitely.
    pub previous_version: Option<Version>,
    /// SHA-1 hex digest of the uploaded content.
    pub sha1_hash: Option<String>,
    /// Identifier/hash pairs for the blobs uploaded with this record.
    pub files: Vec<FileMetadata>,
    /// Free-form domain metadata.
    pub extra: BTreeMap<String, String>,
}

/// Metadata accompanying a file upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Domain-side file identifier.
    pub identifier: String,
    /// SHA-1 hex digest of the content being uploaded.
    pub sha1_hash: String,
}

impl FileMetadata {
    /// Creates file metadata.
    pub fn new(identifier: impl Into<String>, sha1_hash: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            sha1_hash: sha1_hash.into(),
        }
    }
}
