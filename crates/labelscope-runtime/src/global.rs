//! Process-wide registry and convenience functions over it.
//!
//! The global registry is built on first use from
//! [`labelscope_settings::get_settings`] and lives for the rest of the
//! process. It is the registry the exported anchor points at.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use labelscope_core::{LabelSet, Override, Result};
use tracing::debug;

use crate::adapters::{LabelLayer, LabeledTask};
use crate::registry::Registry;

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

/// The process-wide registry.
pub fn global() -> &'static Arc<Registry> {
    let mut fresh = false;
    let registry = GLOBAL.get_or_init(|| {
        fresh = true;
        let settings = labelscope_settings::get_settings();
        debug!(capacity = settings.registry.capacity, "initializing global label registry");
        Arc::new(Registry::from_settings(settings))
    });
    if fresh && labelscope_settings::get_settings().registry.publish_anchor {
        let registry: &'static Registry = registry;
        let _ = registry.publish_anchor();
    }
    registry
}

/// [`Registry::with_labels`] on the global registry.
pub fn with_labels<I, K, V, F, R>(overrides: I, work: F) -> Result<R>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<Arc<str>>,
    V: Into<Override>,
    F: FnOnce() -> R,
{
    global().with_labels(overrides, work)
}

/// [`Registry::with_label`] on the global registry.
pub fn with_label<K, V, F, R>(key: K, value: V, work: F) -> Result<R>
where
    K: Into<Arc<str>>,
    V: Into<Override>,
    F: FnOnce() -> R,
{
    global().with_label(key, value, work)
}

/// [`Registry::cur_labels`] on the global registry.
pub fn cur_labels() -> Result<LabelSet> {
    global().cur_labels()
}

/// Track `fut` as its own context of the global registry.
///
/// Each poll runs the task's context on the polling thread only, so the
/// executor must not poll one task on two threads at the same time. See
/// [`LabeledTask`].
pub fn labeled<F: Future>(fut: F) -> LabeledTask<F> {
    LabeledTask::new(Arc::clone(global()), fut)
}

/// A `tracing` layer driving the global registry.
pub fn layer() -> LabelLayer {
    LabelLayer::new(Arc::clone(global()))
}
