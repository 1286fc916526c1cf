//! Aggregation of every runtime behind one accessor per concern.
//!
//! Registries never own server or application state: reads go through the
//! engines' snapshots and each engine change is re-published as the full
//! aggregated snapshot.

pub mod application;
pub mod inference;

pub use application::ApplicationRegistry;
pub use inference::InferenceServerRegistry;
