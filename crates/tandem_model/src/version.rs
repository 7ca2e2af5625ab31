//! Server-stamped version snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One server-accepted state of a record.
///
/// A version is an immutable value: the server mints a new identifier for
/// every accepted upload, and both facets of a record remember the last
/// version they were synced against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Server-issued version identifier.
    pub identifier: String,
    /// Timestamp at which the server accepted this version.
    pub date: DateTime<Utc>,
}

impl Version {
    /// Creates a new version.
    pub fn new(identifier: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.into(),
            date,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.identifier, self.date.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_equality_is_by_value() {
        let date = Utc::now();
        let a = Version::new("v1", date);
        let b = Version::new("v1", date);
        assert_eq!(a, b);

        let c = Version::new("v2", date);
        assert_ne!(a, c);
    }

    #[test]
    fn version_display_includes_identifier() {
        let version = Version::new("abc123", Utc::now());
        assert!(version.to_string().contains("abc123"));
    }
}
