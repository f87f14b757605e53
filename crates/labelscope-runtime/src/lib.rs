//! # labelscope-runtime
//!
//! Context registry, propagation boundary, scoped label API, and the
//! external-read surface.
//!
//! - **Registry**: [`Registry`] maps each live execution context to its
//!   active [`LabelSet`](labelscope_core::LabelSet) and tracks which context
//!   is running.
//! - **Boundary**: [`ContextHooks`] is how a host scheduler reports context
//!   creation, runs, and destruction. [`adapters`] ships two hosts: futures
//!   ([`LabeledTask`]) and `tracing` spans ([`LabelLayer`]).
//! - **Scopes**: [`Registry::with_labels`] and [`asynchronous::with_labels`]
//!   apply overrides for the duration of a closure or of each poll.
//! - **Surface**: [`surface`] lays out the slot table and header that an
//!   out-of-process reader decodes, and [`surface::reader`] decodes them.
//! - **Global**: [`global()`] and the free functions built on it.

#![deny(unsafe_code)]

pub mod adapters;
pub mod asynchronous;
pub mod global;
pub mod hooks;
pub mod registry;
mod scope;
pub mod surface;

pub use adapters::{LabelLayer, LabeledTask};
pub use global::{cur_labels, global, labeled, with_label, with_labels};
pub use hooks::{ContextHooks, HostCapabilities, RunNotifications};
pub use registry::{ContextSnapshot, Registry, RegistryConfig, RegistryStats};
#[cfg(target_os = "linux")]
pub use surface::reader::ProcMemory;
pub use surface::reader::{CurrentView, MemorySource, SurfaceReader};
pub use surface::{ANCHOR_SYMBOL, LABELSCOPE_ANCHOR, SCHEMA_VERSION, SURFACE_MAGIC};
