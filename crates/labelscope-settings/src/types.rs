//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so a settings file only needs the fields it changes.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Smallest accepted slot table capacity.
pub const MIN_CAPACITY: usize = 16;
/// Largest accepted slot table capacity.
pub const MAX_CAPACITY: usize = 1 << 24;

/// Root settings type.
///
/// ```json
/// {
///   "registry": { "capacity": 4096, "retireDepth": 128 },
///   "labels": { "dedup": false }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelscopeSettings {
    /// Settings schema version.
    pub version: String,
    /// Context registry sizing and publication.
    pub registry: RegistrySettings,
    /// Label set derivation behavior.
    pub labels: LabelSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl Default for LabelscopeSettings {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            registry: RegistrySettings::default(),
            labels: LabelSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl LabelscopeSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let capacity = self.registry.capacity;
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(SettingsError::InvalidValue(format!(
                "registry.capacity must be within {MIN_CAPACITY}..={MAX_CAPACITY}, got {capacity}"
            )));
        }
        if self.labels.max_chain_depth == 0 {
            return Err(SettingsError::InvalidValue(
                "labels.maxChainDepth must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Context registry settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrySettings {
    /// Number of slots in the fixed, non-relocating slot table.
    pub capacity: usize,
    /// How many displaced label sets are kept alive before release.
    pub retire_depth: usize,
    /// Whether the global registry publishes itself through the anchor.
    pub publish_anchor: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            capacity: 16_384,
            retire_depth: 64,
            publish_anchor: true,
        }
    }
}

/// Label derivation settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelSettings {
    /// Share identical derivations through the interner.
    pub dedup: bool,
    /// Chains deeper than this are compacted when installed.
    pub max_chain_depth: usize,
}

impl Default for LabelSettings {
    fn default() -> Self {
        Self {
            dedup: true,
            max_chain_depth: 32,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
