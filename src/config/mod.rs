//! Routing configuration model.
//!
//! The types here are pure data: backends with their per-route options, and
//! the immutable [`Snapshot`] the reconciler publishes for the request path.

mod backend;
mod options;
mod snapshot;

pub use backend::Backend;
pub use options::{annotation_names, BackendOptions};
pub use snapshot::Snapshot;
