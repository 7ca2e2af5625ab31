//! The capability trait implemented by syncable domain entities.

use crate::file::LocalFile;
use crate::record::{RecordEntry, RecordID};
use std::collections::BTreeMap;

/// Boxed error type for domain-side hook failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// How a divergent record should be resolved when it is discovered.
///
/// Returned by [`Syncable::resolve_conflict`]; `Flag` defers resolution to
/// an explicit external decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    /// Keep the local state and upload it over the remote version.
    UseLocal,
    /// Discard local changes and download the remote version.
    UseRemote,
    /// Keep whichever side carries the newer version date.
    UseNewest,
    /// Keep whichever side carries the older version date.
    UseOldest,
    /// Flag the record as conflicted and exclude it from syncing until
    /// resolved externally.
    Flag,
}

/// Capabilities a domain entity exposes to the sync engine.
///
/// The engine only ever sees this interface; concrete entity types live
/// entirely on the application side. Entities that mutate state inside the
/// lifecycle hooks use interior mutability, since the engine shares entities
/// across execution contexts behind `Arc`.
pub trait Syncable: Send + Sync {
    /// Domain entity type name. Must be stable across runs.
    fn record_type(&self) -> &str;

    /// Stable primary-key value of the entity.
    fn identifier(&self) -> String;

    /// The record ID derived from type and primary key.
    fn record_id(&self) -> RecordID {
        RecordID::new(self.record_type(), self.identifier())
    }

    /// Serializes the fields eligible for sync.
    fn syncable_data(&self) -> Result<Vec<u8>, BoxError>;

    /// Local blobs associated with the entity.
    fn syncable_files(&self) -> Vec<LocalFile> {
        Vec::new()
    }

    /// Free-form metadata uploaded alongside the entity.
    fn syncable_metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Human-readable name, if the entity has one.
    fn display_name(&self) -> Option<String> {
        None
    }

    /// Whether this entity participates in syncing.
    fn is_syncing_enabled(&self) -> bool {
        true
    }

    /// Called before the entity is hashed and uploaded; lets the entity
    /// materialize derived data first.
    fn prepare_for_sync(&self, _entry: &RecordEntry) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called after the entity has been created or replaced from a download.
    fn awake_from_sync(&self, _entry: &RecordEntry) -> Result<(), BoxError> {
        Ok(())
    }

    /// Decides how a divergence discovered for this entity should be
    /// resolved.
    fn resolve_conflict(&self, _entry: &RecordEntry) -> ConflictAction {
        ConflictAction::Flag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    impl Syncable for Plain {
        fn record_type(&self) -> &str {
            "Plain"
        }

        fn identifier(&self) -> String {
            "1".into()
        }

        fn syncable_data(&self) -> Result<Vec<u8>, BoxError> {
            Ok(vec![1, 2, 3])
        }
    }

    #[test]
    fn defaults_flag_conflicts_and_enable_syncing() {
        let entity = Plain;
        let entry = RecordEntry::new(entity.record_id());

        assert!(entity.is_syncing_enabled());
        assert!(entity.syncable_files().is_empty());
        assert_eq!(entity.resolve_conflict(&entry), ConflictAction::Flag);
        assert_eq!(entity.record_id(), RecordID::new("Plain", "1"));
    }
}
