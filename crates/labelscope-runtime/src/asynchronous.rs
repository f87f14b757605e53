//! Scoped labels for futures.
//!
//! [`with_labels`] applies a set of overrides around every poll of the
//! wrapped future, so the labels are in place whenever the future's code
//! runs and gone whenever it is suspended.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use labelscope_core::{Override, Result};
use pin_project_lite::pin_project;

use crate::registry::Registry;
use crate::scope::normalize;

pin_project! {
    /// Future returned by [`with_labels`].
    #[must_use = "futures do nothing unless polled"]
    pub struct WithLabels<F> {
        registry: Arc<Registry>,
        overrides: Vec<(Arc<str>, Override)>,
        #[pin]
        inner: F,
    }
}

/// Wrap `fut` so each poll runs with `overrides` applied.
///
/// Resolves to `Err` without polling `fut` if the host lacks a required
/// capability.
pub fn with_labels<I, K, V, F>(registry: Arc<Registry>, overrides: I, fut: F) -> WithLabels<F>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<Arc<str>>,
    V: Into<Override>,
    F: Future,
{
    WithLabels {
        registry,
        overrides: normalize(overrides),
        inner: fut,
    }
}

/// [`with_labels`] for a single label.
pub fn with_label<K, V, F>(registry: Arc<Registry>, key: K, value: V, fut: F) -> WithLabels<F>
where
    K: Into<Arc<str>>,
    V: Into<Override>,
    F: Future,
{
    with_labels(registry, [(key, value)], fut)
}

impl<F: Future> Future for WithLabels<F> {
    type Output = Result<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Err(err) = this.registry.check_host() {
            return Poll::Ready(Err(err));
        }
        let _scope = this.registry.enter_scope(this.overrides.clone());
        this.inner.poll(cx).map(Ok)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
