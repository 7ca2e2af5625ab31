//! Accounts and change tokens.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque server-issued watermark for incremental change queries.
///
/// Persisted on the [`Account`] only after a fetch-changes call has fully
/// committed, and advances monotonically from the caller's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeToken(Vec<u8>);

impl ChangeToken {
    /// Wraps raw token bytes received from the server.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for ChangeToken {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// One authenticated service session.
///
/// Created on successful authentication and destroyed on deauthentication,
/// which also resets all local sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account name as reported by the service.
    pub name: String,
    /// Email address, when the service provides one.
    pub email_address: Option<String>,
    /// Identifier of the service this account belongs to.
    pub service_identifier: String,
    /// Watermark of the last fully-committed fetch, if any.
    pub change_token: Option<ChangeToken>,
}

impl Account {
    /// Creates an account with no change token.
    pub fn new(name: impl Into<String>, service_identifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email_address: None,
            service_identifier: service_identifier.into(),
            change_token: None,
        }
    }
}
