//! # labelscope-core
//!
//! Foundation types for labelscope: immutable label sets, execution-context
//! identifiers, the error hierarchy, and logging setup.
//!
//! - **Label sets**: [`LabelSet`] is a persistent, reference-counted chain of
//!   bindings. Every change derives a new node; nothing is edited in place.
//! - **Hash-consing**: [`Interner`] shares identical derivations by content.
//! - **Values**: [`LabelValue`], [`Override`], and [`Lookup`] distinguish a
//!   bound value, an explicit "absent" marker, and a key that was never set.
//! - **Ids**: [`ContextId`] names one node of the host's execution-context tree.
//! - **Errors**: [`LabelError`] and [`SurfaceError`] via `thiserror`.
//! - **Logging**: [`logging::init_subscriber`] and test capture utilities.

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod intern;
pub mod labelset;
pub mod logging;
pub mod value;

pub use errors::{Capability, EventFault, LabelError, Result, SurfaceError};
pub use ids::ContextId;
pub use intern::Interner;
pub use labelset::{Label, LabelSet, RawNode, ValueTag};
pub use value::{Binding, LabelValue, Lookup, Override};
