//! Runtime engine traits.
//!
//! Every engine owns the authoritative map of what it manages for one
//! runtime. The generic traits ([`RuntimeEngine`], [`ApplicationRuntimeEngine`])
//! expose runtime-specific details; the type-erased views
//! ([`InferenceRuntime`], [`ApplicationRuntime`]) are what the aggregating
//! registries hold, and are implemented for every engine automatically.

use api_types::{ApplicationInfo, InferenceServerInfo, Labels, ModelInfo, RuntimeType};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::core::{ApplicationState, OrchestratorError, Result, RuntimeInstance};

/// Input of an inference server creation.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceServerConfig {
    /// Host port the server is published on
    pub port: u16,
    pub models_info: Vec<ModelInfo>,
    /// Explicit provider; the first enabled provider for the backend otherwise
    pub provider_id: Option<String>,
    /// Overrides the provider's default image
    pub image: Option<String>,
    pub labels: Labels,
    pub gpu: bool,
}

/// Identity and lifecycle shared by every engine.
pub trait EngineIdentity: Send + Sync {
    fn id(&self) -> &str;

    fn runtime(&self) -> RuntimeType;

    /// Starts listening to the runtime. Calling it twice has no effect.
    fn init(&self);

    /// Cancels every timer and subscription owned by the engine.
    fn dispose(&self);
}

/// Commands accepted by an inference runtime.
#[async_trait]
pub trait InferenceCommands: EngineIdentity {
    async fn create_server(&self, config: InferenceServerConfig) -> Result<InferenceServerInfo>;

    async fn start_server(&self, id: &str) -> Result<()>;

    async fn stop_server(&self, id: &str) -> Result<()>;

    async fn remove_server(&self, id: &str) -> Result<()>;
}

pub trait RuntimeEngine: InferenceCommands + 'static {
    type Details: Clone + Send + Sync + 'static;

    fn servers(&self) -> Vec<RuntimeInstance<Self::Details>>;

    /// Receives the full server list after every change.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<RuntimeInstance<Self::Details>>>;
}

/// Type-erased view of a [`RuntimeEngine`].
pub trait InferenceRuntime: InferenceCommands {
    fn server_infos(&self) -> Vec<InferenceServerInfo>;

    /// Yields once per change of the engine's server map.
    fn changes(&self) -> BoxStream<'static, ()>;
}

impl<E: RuntimeEngine> InferenceRuntime for E {
    fn server_infos(&self) -> Vec<InferenceServerInfo> {
        self.servers().iter().map(RuntimeInstance::info).collect()
    }

    fn changes(&self) -> BoxStream<'static, ()> {
        UnboundedReceiverStream::new(self.subscribe())
            .map(|_| ())
            .boxed()
    }
}

/// Commands accepted by an application runtime.
///
/// Only starting a recipe and removing an application are supported by every
/// runtime; the other commands report [`OrchestratorError::Unsupported`]
/// unless the runtime overrides them.
#[async_trait]
pub trait ApplicationCommands: EngineIdentity {
    /// Kicks off the recipe pipeline in the background and returns the
    /// tracking id carried by its tasks.
    fn request_start(&self, recipe_id: &str, model_id: &str) -> Result<String>;

    async fn remove_application(&self, recipe_id: &str, model_id: &str) -> Result<()>;

    async fn stop_application(&self, _recipe_id: &str, _model_id: &str) -> Result<()> {
        Err(OrchestratorError::Unsupported {
            message: format!("{} applications cannot be stopped", self.runtime()),
        })
    }

    async fn start_application(&self, _recipe_id: &str, _model_id: &str) -> Result<()> {
        Err(OrchestratorError::Unsupported {
            message: format!("{} applications cannot be started", self.runtime()),
        })
    }

    async fn restart_application(&self, _recipe_id: &str, _model_id: &str) -> Result<()> {
        Err(OrchestratorError::Unsupported {
            message: format!("{} applications cannot be restarted", self.runtime()),
        })
    }
}

pub trait ApplicationRuntimeEngine: ApplicationCommands + 'static {
    type Details: Clone + Send + Sync + 'static;

    fn applications(&self) -> Vec<ApplicationState<Self::Details>>;

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<ApplicationState<Self::Details>>>;
}

/// Type-erased view of an [`ApplicationRuntimeEngine`].
pub trait ApplicationRuntime: ApplicationCommands {
    fn application_infos(&self) -> Vec<ApplicationInfo>;

    fn changes(&self) -> BoxStream<'static, ()>;
}

impl<E: ApplicationRuntimeEngine> ApplicationRuntime for E {
    fn application_infos(&self) -> Vec<ApplicationInfo> {
        self.applications().iter().map(ApplicationState::info).collect()
    }

    fn changes(&self) -> BoxStream<'static, ()> {
        UnboundedReceiverStream::new(self.subscribe())
            .map(|_| ())
            .boxed()
    }
}
