//! Label values, overrides, and lookup outcomes.
//!
//! A key in a [`LabelSet`](crate::LabelSet) is in one of three states:
//!
//! - bound to a [`LabelValue`],
//! - explicitly **absent** (deleted in this set or an ancestor and not re-set),
//! - **unset** (no node along the chain mentions it).
//!
//! "Absent" and "unset" are deliberately distinct outcomes of
//! [`LabelSet::get`](crate::LabelSet::get).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A label value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelValue {
    /// UTF-8 string.
    Str(Arc<str>),
    /// Boolean.
    Bool(bool),
    /// Number (stored as `f64`).
    Num(f64),
}

impl LabelValue {
    /// The string payload, if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Bool(_) | Self::Num(_) => None,
        }
    }

    /// Identity used for hash-consing. Numbers compare by bit pattern so
    /// that `NaN` can be interned like any other value.
    pub(crate) fn same_content(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Num(a), Self::Num(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl fmt::Display for LabelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Num(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for LabelValue {
    fn from(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }
}

impl From<String> for LabelValue {
    fn from(s: String) -> Self {
        Self::Str(Arc::from(s))
    }
}

impl From<Arc<str>> for LabelValue {
    fn from(s: Arc<str>) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for LabelValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for LabelValue {
    fn from(n: f64) -> Self {
        Self::Num(n)
    }
}

#[allow(clippy::cast_precision_loss)]
impl From<i64> for LabelValue {
    fn from(n: i64) -> Self {
        Self::Num(n as f64)
    }
}

#[allow(clippy::cast_precision_loss)]
impl From<u64> for LabelValue {
    fn from(n: u64) -> Self {
        Self::Num(n as f64)
    }
}

impl From<i32> for LabelValue {
    fn from(n: i32) -> Self {
        Self::Num(f64::from(n))
    }
}

impl From<u32> for LabelValue {
    fn from(n: u32) -> Self {
        Self::Num(f64::from(n))
    }
}

/// What a chain node records for its key.
#[derive(Clone, Debug, PartialEq)]
pub enum Binding {
    /// The key maps to a value.
    Value(LabelValue),
    /// The key was explicitly deleted.
    Absent,
}

impl Binding {
    pub(crate) fn same_content(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => a.same_content(b),
            (Self::Absent, Self::Absent) => true,
            _ => false,
        }
    }
}

/// One entry of a scoped override sequence: set a value or delete the key.
#[derive(Clone, Debug, PartialEq)]
pub enum Override {
    /// Bind the key to a value.
    Set(LabelValue),
    /// Mark the key absent.
    Delete,
}

impl From<LabelValue> for Override {
    fn from(v: LabelValue) -> Self {
        Self::Set(v)
    }
}

impl From<&str> for Override {
    fn from(s: &str) -> Self {
        Self::Set(s.into())
    }
}

impl From<String> for Override {
    fn from(s: String) -> Self {
        Self::Set(s.into())
    }
}

impl From<Arc<str>> for Override {
    fn from(s: Arc<str>) -> Self {
        Self::Set(s.into())
    }
}

impl From<bool> for Override {
    fn from(b: bool) -> Self {
        Self::Set(b.into())
    }
}

impl From<f64> for Override {
    fn from(n: f64) -> Self {
        Self::Set(n.into())
    }
}

impl From<i64> for Override {
    fn from(n: i64) -> Self {
        Self::Set(n.into())
    }
}

impl From<u64> for Override {
    fn from(n: u64) -> Self {
        Self::Set(n.into())
    }
}

impl From<i32> for Override {
    fn from(n: i32) -> Self {
        Self::Set(n.into())
    }
}

impl From<u32> for Override {
    fn from(n: u32) -> Self {
        Self::Set(n.into())
    }
}

/// Outcome of resolving a key against a label set.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Lookup<'a> {
    /// The key is bound.
    Value(&'a LabelValue),
    /// The key was explicitly deleted.
    Absent,
    /// No binding for the key exists anywhere along the chain.
    Unset,
}

impl<'a> Lookup<'a> {
    /// The bound value, if any.
    #[must_use]
    pub fn value(self) -> Option<&'a LabelValue> {
        match self {
            Self::Value(v) => Some(v),
            Self::Absent | Self::Unset => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
