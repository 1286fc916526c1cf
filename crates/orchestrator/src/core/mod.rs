//! Core building blocks shared by the reconciliation engines
//!
//! - [`error`]: the error taxonomy every command reports
//! - [`types`]: runtime instances, application states, labels and timings
//! - [`notifier`]: full-snapshot change fan-out
//! - [`engine`]: runtime engine traits and their type-erased views
//! - [`tasks`]: user visible task tracking
//! - [`catalog`]: collaborator interfaces (catalog, models, recipes)

pub mod catalog;
pub mod engine;
pub mod error;
pub mod notifier;
pub(crate) mod sync;
pub mod tasks;
pub mod types;

pub use engine::{
    ApplicationCommands, ApplicationRuntime, ApplicationRuntimeEngine, EngineIdentity,
    InferenceCommands, InferenceRuntime, InferenceServerConfig, RuntimeEngine,
};
pub use error::{OrchestratorError, Result};
pub use notifier::UpdateNotifier;
pub use tasks::TaskRegistry;
pub use types::{ApplicationState, ReconcileConfig, RuntimeInstance};
