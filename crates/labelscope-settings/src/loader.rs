//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LabelscopeSettings::default()`]
//! 2. If `~/.labelscope/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{LabelscopeSettings, MAX_CAPACITY, MIN_CAPACITY};

/// Resolve the path to the settings file (`~/.labelscope/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".labelscope").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LabelscopeSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. Invalid JSON or values
/// outside accepted ranges are errors.
pub fn load_settings_from_path(path: &Path) -> Result<LabelscopeSettings> {
    let defaults = serde_json::to_value(LabelscopeSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: LabelscopeSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Integers must parse and fall within range; booleans accept
/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`. Invalid values are
/// warned about and ignored.
pub fn apply_env_overrides(settings: &mut LabelscopeSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

fn apply_overrides_from(
    settings: &mut LabelscopeSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let usize_var = |name: &str, min: usize, max: usize| {
        let val = lookup(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    };
    let bool_var = |name: &str| {
        let val = lookup(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    };

    // ── Registry ────────────────────────────────────────────────────
    if let Some(v) = usize_var("LABELSCOPE_CAPACITY", MIN_CAPACITY, MAX_CAPACITY) {
        settings.registry.capacity = v;
    }
    if let Some(v) = usize_var("LABELSCOPE_RETIRE_DEPTH", 0, 1 << 20) {
        settings.registry.retire_depth = v;
    }
    if let Some(v) = bool_var("LABELSCOPE_PUBLISH_ANCHOR") {
        settings.registry.publish_anchor = v;
    }

    // ── Labels ──────────────────────────────────────────────────────
    if let Some(v) = bool_var("LABELSCOPE_DEDUP") {
        settings.labels.dedup = v;
    }
    if let Some(v) = usize_var("LABELSCOPE_MAX_CHAIN_DEPTH", 1, 4096) {
        settings.labels.max_chain_depth = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = lookup("LABELSCOPE_LOG_LEVEL").filter(|v| !v.is_empty()) {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `usize` within an inclusive range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
