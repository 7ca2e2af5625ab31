//! Content hashing for change detection.
//!
//! Record payloads and file contents are identified by SHA-1 hex digests so
//! uploads and downloads can skip unchanged data cheaply.

use sha1::{Digest, Sha1};

/// Computes the SHA-1 hex digest of the given bytes.
pub fn sha1_hex(data: &[u8]) -> String {
    use std::fmt::Write;

    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
