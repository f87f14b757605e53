use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use labelscope_core::ContextId;
use pin_project_lite::pin_project;

use crate::hooks::{ContextHooks, HostCapabilities};
use crate::registry::Registry;

pin_project! {
    /// A future tracked as its own execution context.
    ///
    /// The context is created in [`LabeledTask::new`] and inherits the
    /// labels current at that moment, so spawning inside a
    /// [`with_labels`](Registry::with_labels) scope carries the scope's
    /// labels into the task.
    ///
    /// Every poll is reported as a run on the polling thread. A task may
    /// move between threads across polls, but the executor must never poll
    /// the same task on two threads at once, and work on a thread that is
    /// not inside a poll operates on the root context.
    #[must_use = "futures do nothing unless polled"]
    pub struct LabeledTask<F> {
        registry: Arc<Registry>,
        id: ContextId,
        #[pin]
        inner: F,
    }

    impl<F> PinnedDrop for LabeledTask<F> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            this.registry.on_destroy(*this.id);
        }
    }
}

impl<F> LabeledTask<F> {
    /// Register a context for `inner`, created by the current context.
    /// Binds full host capabilities if no host has been bound yet.
    pub fn new(registry: Arc<Registry>, inner: F) -> Self {
        let _ = registry.bind_host_if_unbound(HostCapabilities::full());
        let id = registry.next_context_id();
        let trigger = registry.current_context();
        registry.on_create(id, trigger);
        Self {
            registry,
            id,
            inner,
        }
    }

    /// The context that represents this task.
    pub fn id(&self) -> ContextId {
        self.id
    }
}

/// Reports after-run even if the poll panics.
struct RunGuard<'a> {
    registry: &'a Registry,
    id: ContextId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.registry.on_after_run(self.id);
    }
}

impl<F: Future> Future for LabeledTask<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.registry.on_before_run(*this.id);
        let _run = RunGuard {
            registry: this.registry,
            id: *this.id,
        };
        this.inner.poll(cx)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
