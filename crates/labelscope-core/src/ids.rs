//! Execution-context identifiers.
//!
//! A [`ContextId`] is an opaque, monotonically assigned `u64`. Two values are
//! reserved by the external-read surface and can never name a context: `0`
//! marks a never-used slot and `u64::MAX` marks a released one.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one node in the host's execution-context tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct ContextId(u64);

impl ContextId {
    /// The permanent root context. Work running outside any reported
    /// context operates on the root.
    pub const ROOT: Self = Self(1);

    /// Slot marker for a never-used table entry.
    pub const EMPTY_RAW: u64 = 0;

    /// Slot marker for a released table entry.
    pub const TOMBSTONE_RAW: u64 = u64::MAX;

    /// Create an id from a raw value, rejecting the two reserved markers.
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        if raw == Self::EMPTY_RAW || raw == Self::TOMBSTONE_RAW {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// The raw `u64` value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is [`ContextId::ROOT`].
    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0 == Self::ROOT.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

impl TryFrom<u64> for ContextId {
    type Error = String;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or_else(|| format!("{raw} is a reserved context id"))
    }
}

impl From<ContextId> for u64 {
    fn from(id: ContextId) -> Self {
        id.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
