//! Peer identity — the address-like key every peer is known by.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a link-local peer, e.g. `juliet@capulet`.
///
/// Identities are compared and hashed by their exact string form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Create an identity from an existing string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The part before `@`, or the whole identity when there is none.
    pub fn local_part(&self) -> &str {
        self.0.split_once('@').map_or(self.0.as_str(), |(local, _)| local)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeerIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
