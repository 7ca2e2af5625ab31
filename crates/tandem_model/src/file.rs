//! File bookkeeping for record blobs.

use serde::{Deserialize, Serialize};

/// One uploaded blob belonging to a record's local facet.
///
/// A remote file is bookkeeping only: it records which version of a blob the
/// server knows about so uploads and downloads can skip unchanged content by
/// hash comparison. It never outlives the local facet that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Domain-side file identifier (stable across versions).
    pub identifier: String,
    /// SHA-1 hex digest of the uploaded content.
    pub sha1_hash: String,
    /// Server-issued identifier for the uploaded blob.
    pub remote_identifier: String,
    /// Identifier of the record version this blob belongs to.
    pub version_identifier: String,
    /// Size of the uploaded content in bytes.
    pub size: u64,
}

/// A local blob handed to the engine by a [`Syncable`](crate::Syncable)
/// entity for hashing and upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// Domain-side file identifier.
    pub identifier: String,
    /// Raw content.
    pub data: Vec<u8>,
}

impl LocalFile {
    /// Creates a new local file.
    pub fn new(identifier: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            identifier: identifier.into(),
            data,
        }
    }
}

/// A downloaded blob, cached by the store for the domain to consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    /// Domain-side file identifier.
    pub identifier: String,
    /// Identifier of the record version this content was downloaded for.
    pub version_identifier: String,
    /// Raw content.
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_file_roundtrips_through_serde() {
        let file = RemoteFile {
            identifier: "artwork".into(),
            sha1_hash: "da39a3ee5e6b4b0d3255bfef95601890afd80709".into(),
            remote_identifier: "blob-1".into(),
            version_identifier: "v1".into(),
            size: 42,
        };

        let json = serde_json::to_string(&file).unwrap();
        let decoded: RemoteFile = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, file);
    }
}
