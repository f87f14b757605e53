//! Error hierarchy for labelscope.
//!
//! Failures split into two groups with opposite visibility:
//!
//! - **Loud**: [`LabelError`] is returned to application code. The only
//!   failure an application can see from the scoped API is
//!   [`LabelError::CapabilityMissing`]; [`LabelError::Surface`] comes
//!   from tooling that decodes a published surface.
//! - **Silent**: [`EventFault`] classifies malformed scheduler events. These
//!   are logged and counted but never returned to the host.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::ContextId;

/// A host-runtime capability the engine depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Reliable per-continuation execution-context tracking.
    ContextTracking,
    /// A before-run notification for every resumption, or an explicit clear
    /// of the current pointer between resumptions.
    RunNotifications,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextTracking => write!(f, "per-continuation context tracking"),
            Self::RunNotifications => write!(f, "before-run notifications"),
        }
    }
}

/// Errors surfaced to callers.
#[derive(Debug, Error)]
pub enum LabelError {
    /// The host runtime lacks a capability the engine requires.
    #[error("labelscope requires {capability} from the host runtime: {detail}")]
    CapabilityMissing {
        /// The unmet capability.
        capability: Capability,
        /// What was observed about the host.
        detail: String,
    },

    /// Decoding the external-read surface failed.
    #[error("{0}")]
    Surface(#[from] SurfaceError),
}

impl LabelError {
    /// Whether this is a missing-capability error.
    #[must_use]
    pub fn is_capability_missing(&self) -> bool {
        matches!(self, Self::CapabilityMissing { .. })
    }
}

/// Errors from decoding a published surface.
#[derive(Debug, Error)]
pub enum SurfaceError {
    /// The anchor or header does not carry the expected magic value.
    #[error("bad surface magic {found:#018x} at {addr:#x}")]
    BadMagic {
        /// Address that was read.
        addr: u64,
        /// The value found there.
        found: u64,
    },

    /// The surface schema is newer or older than this reader understands.
    #[error("unsupported surface schema version {found} (reader supports {supported})")]
    UnsupportedVersion {
        /// Version found in the header.
        found: u32,
        /// Version this reader decodes.
        supported: u32,
    },

    /// The anchor exists but no registry has been published yet.
    #[error("no registry has been published through the anchor")]
    NotPublished,

    /// Reading target memory failed.
    #[error("failed to read {len} bytes at {addr:#x}: {source}")]
    Io {
        /// Address that was read.
        addr: u64,
        /// Requested length.
        len: usize,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Memory was readable but did not decode (typically a torn read).
    #[error("corrupt surface data at {addr:#x}: {reason}")]
    Corrupt {
        /// Address of the offending structure.
        addr: u64,
        /// What failed to decode.
        reason: String,
    },

    /// The context has no published slot.
    #[error("{0} has no published slot")]
    NotFound(ContextId),
}

/// Result type for labelscope operations.
pub type Result<T> = std::result::Result<T, LabelError>;

/// Classification of a scheduler event the registry could not honor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFault {
    /// Creation referenced a trigger with no slot; the child starts empty.
    OrphanedTrigger,
    /// Before-run, after-run, or destroy for an id with no slot.
    UnknownContext,
    /// Creation for an id that is already live.
    DuplicateContext,
    /// After-run for a context that is not running.
    NotRunning,
    /// Destroy targeting the permanent root context.
    RootDestroy,
    /// The fixed slot table is full; the context is tracked but not
    /// published to external readers.
    CapacityExhausted,
}

impl fmt::Display for EventFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrphanedTrigger => write!(f, "orphaned_trigger"),
            Self::UnknownContext => write!(f, "unknown_context"),
            Self::DuplicateContext => write!(f, "duplicate_context"),
            Self::NotRunning => write!(f, "not_running"),
            Self::RootDestroy => write!(f, "root_destroy"),
            Self::CapacityExhausted => write!(f, "capacity_exhausted"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_missing_names_the_capability() {
        let err = LabelError::CapabilityMissing {
            capability: Capability::ContextTracking,
            detail: "no host scheduler adapter is bound".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("per-continuation context tracking"));
        assert!(msg.contains("no host scheduler adapter is bound"));
        assert!(err.is_capability_missing());
    }

    #[test]
    fn surface_error_converts() {
        let err: LabelError = SurfaceError::NotPublished.into();
        assert!(matches!(err, LabelError::Surface(SurfaceError::NotPublished)));
        assert!(!err.is_capability_missing());
    }

    #[test]
    fn bad_magic_display() {
        let err = SurfaceError::BadMagic {
            addr: 0x1000,
            found: 0xdead,
        };
        assert_eq!(
            err.to_string(),
            "bad surface magic 0x000000000000dead at 0x1000"
        );
    }

    #[test]
    fn not_found_display() {
        let err = SurfaceError::NotFound(ContextId::new(5).unwrap());
        assert_eq!(err.to_string(), "ctx#5 has no published slot");
    }

    #[test]
    fn event_fault_display_matches_serde() {
        for fault in [
            EventFault::OrphanedTrigger,
            EventFault::UnknownContext,
            EventFault::DuplicateContext,
            EventFault::NotRunning,
            EventFault::RootDestroy,
            EventFault::CapacityExhausted,
        ] {
            let json = serde_json::to_value(fault).unwrap();
            assert_eq!(json.as_str().unwrap(), fault.to_string());
        }
    }
}
