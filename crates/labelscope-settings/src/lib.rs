//! # labelscope-settings
//!
//! Configuration for the labelscope registry.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`LabelscopeSettings::default()`]
//! 2. **User file**: `~/.labelscope/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `LABELSCOPE_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

/// Global settings singleton.
///
/// Initialized on first access via [`get_settings`], falling back to
/// compiled defaults if loading fails.
static SETTINGS: OnceLock<LabelscopeSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads settings from `~/.labelscope/settings.json` with env
/// var overrides. Later calls return the cached value.
pub fn get_settings() -> &'static LabelscopeSettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to load settings, using defaults");
            LabelscopeSettings::default()
        })
    })
}

/// Initialize the global settings with a specific value.
///
/// Returns the provided settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: LabelscopeSettings) -> std::result::Result<(), LabelscopeSettings> {
    SETTINGS.set(settings)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
