//! Scoped application API.
//!
//! [`Registry::with_labels`] installs a derived label set on the current
//! context for the duration of a closure and restores the previous set when
//! the closure exits, whether it returns, returns an `Err`, or panics.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use labelscope_core::{Capability, ContextId, LabelError, LabelSet, Override, Result};
use tracing::error;

use crate::hooks::RunNotifications;
use crate::registry::Registry;

/// Restores a context's previous label set on drop.
pub(crate) struct ScopeGuard<'r> {
    registry: &'r Registry,
    ctx: ContextId,
    previous: Option<LabelSet>,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.registry.restore(self.ctx, previous);
        }
    }
}

impl Registry {
    /// Run `work` with `overrides` applied on top of the current labels.
    ///
    /// Overrides apply in order, so a later entry for the same key wins.
    /// An empty override list runs `work` unchanged. The return value of
    /// `work` is passed through; the only error is a missing host
    /// capability, reported before `work` runs.
    pub fn with_labels<I, K, V, F, R>(&self, overrides: I, work: F) -> Result<R>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Arc<str>>,
        V: Into<Override>,
        F: FnOnce() -> R,
    {
        self.check_host()?;
        let _scope = self.enter_scope(normalize(overrides));
        Ok(work())
    }

    /// [`with_labels`](Self::with_labels) for a single label.
    pub fn with_label<K, V, F, R>(&self, key: K, value: V, work: F) -> Result<R>
    where
        K: Into<Arc<str>>,
        V: Into<Override>,
        F: FnOnce() -> R,
    {
        self.with_labels([(key, value)], work)
    }

    /// The current context's active labels.
    pub fn cur_labels(&self) -> Result<LabelSet> {
        self.check_host()?;
        Ok(self.current_labels())
    }

    pub(crate) fn enter_scope(&self, overrides: Vec<(Arc<str>, Override)>) -> ScopeGuard<'_> {
        let installed = if overrides.is_empty() {
            None
        } else {
            self.push_overrides(overrides)
        };
        let (ctx, previous) = match installed {
            Some((ctx, previous)) => (ctx, Some(previous)),
            None => (ContextId::ROOT, None),
        };
        ScopeGuard {
            registry: self,
            ctx,
            previous,
        }
    }

    /// Fail unless a host with context tracking and run notifications is
    /// bound. The first failure is also logged.
    pub(crate) fn check_host(&self) -> Result<()> {
        let missing = match self.host() {
            None => Some((
                Capability::ContextTracking,
                "no host scheduler adapter is bound to this registry",
            )),
            Some(caps) if !caps.context_tracking => Some((
                Capability::ContextTracking,
                "the host does not track an execution context per continuation",
            )),
            Some(caps) if caps.run_notifications == RunNotifications::None => Some((
                Capability::RunNotifications,
                "the host neither notifies before each resumption nor clears between resumptions",
            )),
            Some(_) => None,
        };
        let Some((capability, detail)) = missing else {
            return Ok(());
        };
        if !self.capability_reported.swap(true, Ordering::Relaxed) {
            error!(%capability, detail, "labelscope cannot run on this host");
        }
        Err(LabelError::CapabilityMissing {
            capability,
            detail: detail.to_string(),
        })
    }
}

pub(crate) fn normalize<I, K, V>(overrides: I) -> Vec<(Arc<str>, Override)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<Arc<str>>,
    V: Into<Override>,
{
    overrides
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
