//! Host adapters that drive the propagation boundary.
//!
//! - [`LabeledTask`]: a future is one execution context. Created when the
//!   wrapper is built, running for the duration of each poll, destroyed on
//!   drop.
//! - [`LabelLayer`]: a `tracing` span is one execution context. Created
//!   with the span, running while it is entered, destroyed when it closes.

mod layer;
mod task;

pub use layer::LabelLayer;
pub use task::LabeledTask;
