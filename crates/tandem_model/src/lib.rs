//! # Tandem Model
//!
//! Record, version, and conflict data model for the Tandem sync engine.
//!
//! This crate provides:
//! - `RecordID` and the local/remote record facets
//! - `Version` snapshot markers and content hashes
//! - `RemoteFile` / `LocalFile` / `FileContent` blob bookkeeping
//! - `Account` and `ChangeToken` persistence types
//! - Record selection predicates for the sync phases
//! - The `Syncable` capability trait implemented by domain entities
//! - The full sync error taxonomy
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod account;
mod error;
mod file;
mod metadata;
mod predicate;
mod record;
mod syncable;
mod version;

pub use account::{Account, ChangeToken};
pub use error::{
    AuthenticationError, DeauthenticationError, FetchError, FileError, GeneralError, RecordError,
    RecordResults, ServiceError, SyncError, ValidationError,
};
pub use file::{FileContent, LocalFile, RemoteFile};
pub use metadata::{FileMetadata, RecordMetadata};
pub use predicate::RecordPredicate;
pub use record::{LocalFacet, RecordEntry, RecordID, RecordStatus, RemoteFacet};
pub use syncable::{BoxError, ConflictAction, Syncable};
pub use version::Version;
