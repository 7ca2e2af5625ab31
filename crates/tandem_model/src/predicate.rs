//! Record selection predicates for the sync phases.

use crate::record::{RecordEntry, RecordStatus};

/// Selects the subset of records a sync phase operates on.
///
/// A conflicted or syncing-disabled record never matches `Upload`,
/// `Download`, or `Delete`; conflicts must be resolved explicitly before the
/// record re-enters any phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPredicate {
    /// Records with pending local changes, or local records the server has
    /// never seen.
    Upload,
    /// Records with pending remote changes, or remote records with no local
    /// counterpart yet.
    Download,
    /// Records tombstoned on either side.
    Delete,
    /// Records flagged as conflicted.
    Conflicted,
    /// Records eligible for syncing at all.
    Syncable,
    /// Every record.
    All,
}

impl RecordPredicate {
    /// Returns true if the entry matches this predicate.
    pub fn matches(&self, entry: &RecordEntry) -> bool {
        let syncable = !entry.is_conflicted && entry.is_syncing_enabled;

        match self {
            RecordPredicate::Upload => {
                syncable
                    && match entry.local_status() {
                        Some(RecordStatus::Updated) => true,
                        Some(RecordStatus::Normal) => entry.remote.is_none(),
                        Some(RecordStatus::Deleted) | None => false,
                    }
            }
            RecordPredicate::Download => {
                syncable
                    && match entry.remote_status() {
                        Some(RecordStatus::Updated) => true,
                        Some(RecordStatus::Normal) => entry.local.is_none(),
                        Some(RecordStatus::Deleted) | None => false,
                    }
            }
            RecordPredicate::Delete => {
                syncable
                    && (entry.local_status() == Some(RecordStatus::Deleted)
                        || entry.remote_status() == Some(RecordStatus::Deleted))
            }
            RecordPredicate::Conflicted => entry.is_conflicted,
            RecordPredicate::Syncable => syncable,
            RecordPredicate::All => true,
        }
    }
}
