//! Propagation boundary between a host scheduler and the registry.
//!
//! The host reports three things: a context was created (and by whom), a
//! context is about to run, and a context is gone. Hosts that cannot report
//! every resumption instead report when a context stops running, which
//! clears the current pointer between resumptions.
//!
//! None of these calls return anything to the host. Malformed events are
//! logged and counted, and a panic inside the registry is caught here so
//! that it never unwinds into the scheduler.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use labelscope_core::{ContextId, EventFault, Override};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::registry::{EventOutcome, Registry};
use crate::scope::normalize;

/// How the host signals which context is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunNotifications {
    /// A before-run notification for every resumption, and nothing when a
    /// context yields. Each notification replaces the running context.
    BeforeEachResume,
    /// Before-run and after-run notifications bracketing each resumption.
    /// Runs nest, and after-run clears the current pointer back to the
    /// enclosing run.
    ClearBetweenResumes,
    /// Neither.
    None,
}

/// Capabilities a host scheduler declares when it binds to a registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapabilities {
    /// The host tracks an execution context per continuation.
    pub context_tracking: bool,
    /// How run transitions are reported.
    pub run_notifications: RunNotifications,
}

impl HostCapabilities {
    /// Full tracking with bracketed runs, as the bundled adapters provide.
    pub const fn full() -> Self {
        Self {
            context_tracking: true,
            run_notifications: RunNotifications::ClearBetweenResumes,
        }
    }
}

/// Scheduler-facing event interface.
pub trait ContextHooks {
    /// `child` was created by `trigger`. Called before any code of `child`
    /// runs.
    fn on_create(&self, child: ContextId, trigger: ContextId);

    /// `ctx` is about to run.
    fn on_before_run(&self, ctx: ContextId);

    /// `ctx` stopped running.
    fn on_after_run(&self, ctx: ContextId);

    /// `ctx` will never run again.
    fn on_destroy(&self, ctx: ContextId);
}

impl ContextHooks for Registry {
    fn on_create(&self, child: ContextId, trigger: ContextId) {
        guarded("create", child, || self.create(child, trigger, Vec::new()));
    }

    fn on_before_run(&self, ctx: ContextId) {
        guarded("before_run", ctx, || self.before_run(ctx));
    }

    fn on_after_run(&self, ctx: ContextId) {
        guarded("after_run", ctx, || self.after_run(ctx));
    }

    fn on_destroy(&self, ctx: ContextId) {
        guarded("destroy", ctx, || self.destroy(ctx));
    }
}

impl<H: ContextHooks + ?Sized> ContextHooks for Arc<H> {
    fn on_create(&self, child: ContextId, trigger: ContextId) {
        (**self).on_create(child, trigger);
    }

    fn on_before_run(&self, ctx: ContextId) {
        (**self).on_before_run(ctx);
    }

    fn on_after_run(&self, ctx: ContextId) {
        (**self).on_after_run(ctx);
    }

    fn on_destroy(&self, ctx: ContextId) {
        (**self).on_destroy(ctx);
    }
}

impl Registry {
    /// Create `child` from `trigger` and apply creation-time overrides in
    /// the same step.
    pub fn on_create_with<I, K, V>(&self, child: ContextId, trigger: ContextId, overrides: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Arc<str>>,
        V: Into<Override>,
    {
        let overrides = normalize(overrides);
        guarded("create", child, || self.create(child, trigger, overrides));
    }
}

/// Run one registry event, logging its outcome and swallowing panics.
pub(crate) fn guarded(event: &'static str, ctx: ContextId, f: impl FnOnce() -> EventOutcome) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(notes)) => {
            debug!(event, context = %ctx, "context event");
            for note in notes {
                match note {
                    EventFault::CapacityExhausted => {
                        warn!(event, context = %ctx, fault = %note, "slot table full, context not published");
                    }
                    _ => debug!(event, context = %ctx, fault = %note, "trigger has no labels, child starts empty"),
                }
            }
        }
        Ok(Err(fault)) => {
            warn!(event, context = %ctx, fault = %fault, "ignoring scheduler event");
        }
        Err(_) => {
            error!(event, context = %ctx, "registry panicked while handling scheduler event");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
