//! Provider strategies materializing workloads on one runtime.
//!
//! Inference providers turn an [`InferenceServerConfig`] into a container
//! or a pod; application providers turn a built recipe into an application
//! pod. Managers pick an inference provider through a [`ProviderRegistry`].

pub mod kubernetes_application;
pub mod kubernetes_llamacpp;
pub mod podman_application;
pub mod podman_llamacpp;

use std::path::PathBuf;
use std::sync::Arc;

use api_types::{InferenceType, Labels, ModelInfo, RuntimeType};
use async_trait::async_trait;

pub use kubernetes_application::KubernetesApplicationProvider;
pub use kubernetes_llamacpp::KubernetesLlamaCppProvider;
pub use podman_application::PodmanApplicationProvider;
pub use podman_llamacpp::PodmanLlamaCppProvider;

use crate::core::catalog::{Recipe, RecipeImage};
use crate::core::{InferenceServerConfig, OrchestratorError, Result};

/// Identity shared by every provider.
pub trait ProviderInfo: Send + Sync {
    fn id(&self) -> &str;

    fn inference_type(&self) -> InferenceType;

    fn enabled(&self) -> bool;
}

#[async_trait]
pub trait InferenceProvider: ProviderInfo {
    /// Handle of the created workload: a container or a pod.
    type Output: Send;

    async fn perform(&self, config: &InferenceServerConfig) -> Result<Self::Output>;
}

/// What an application provider needs to materialize a recipe.
#[derive(Debug, Clone)]
pub struct ApplicationConfig {
    pub recipe: Recipe,
    pub model: ModelInfo,
    pub images: Vec<RecipeImage>,
    /// Model file path as seen by the runtime
    pub model_path: PathBuf,
    pub labels: Labels,
}

#[async_trait]
pub trait ApplicationProvider: Send + Sync {
    type Output: Send;

    async fn perform(&self, config: &ApplicationConfig) -> Result<Self::Output>;
}

/// Ordered inference providers of one runtime.
pub struct ProviderRegistry<P: ?Sized> {
    runtime: RuntimeType,
    providers: Vec<Arc<P>>,
}

impl<P: ProviderInfo + ?Sized> ProviderRegistry<P> {
    pub fn new(runtime: RuntimeType) -> Self {
        Self {
            runtime,
            providers: Vec::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<P>) {
        tracing::debug!(runtime = %self.runtime, provider = provider.id(), "Registering inference provider");
        self.providers.push(provider);
    }

    pub fn with(mut self, provider: Arc<P>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<P>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }

    pub fn by_type(&self, inference_type: InferenceType) -> Vec<Arc<P>> {
        self.providers
            .iter()
            .filter(|p| p.inference_type() == inference_type)
            .cloned()
            .collect()
    }

    pub fn select(&self, explicit_id: Option<&str>, inference_type: InferenceType) -> Result<Arc<P>> {
        select_provider(&self.providers, explicit_id, inference_type).cloned()
    }
}

/// Picks the explicitly requested provider, or the first enabled provider
/// serving `inference_type`.
pub fn select_provider<'a, P: ProviderInfo + ?Sized>(
    providers: &'a [Arc<P>],
    explicit_id: Option<&str>,
    inference_type: InferenceType,
) -> Result<&'a Arc<P>> {
    if let Some(id) = explicit_id {
        let provider = providers
            .iter()
            .find(|p| p.id() == id)
            .ok_or_else(|| OrchestratorError::ProviderUnavailable {
                message: format!("provider {id} does not exist"),
            })?;
        if !provider.enabled() {
            return Err(OrchestratorError::ProviderUnavailable {
                message: format!("provider {id} is disabled"),
            });
        }
        return Ok(provider);
    }

    providers
        .iter()
        .find(|p| p.inference_type() == inference_type && p.enabled())
        .ok_or_else(|| OrchestratorError::ProviderUnavailable {
            message: format!("no enabled provider for {inference_type} models"),
        })
}

/// Asks the OS for a currently unused local TCP port.
pub fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| OrchestratorError::external("allocate local port", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| OrchestratorError::external("allocate local port", e))?
        .port();
    Ok(port)
}

/// The single model a llama.cpp server is started with.
pub(crate) fn single_model(config: &InferenceServerConfig) -> Result<&ModelInfo> {
    match config.models_info.as_slice() {
        [model] => Ok(model),
        [] => Err(OrchestratorError::InvalidInput {
            message: "at least one model is required to start an inference server".to_string(),
        }),
        _ => Err(OrchestratorError::InvalidInput {
            message: "serving several models from one inference server is not supported".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    struct Fake {
        id: &'static str,
        inference_type: InferenceType,
        enabled: bool,
    }

    impl ProviderInfo for Fake {
        fn id(&self) -> &str {
            self.id
        }

        fn inference_type(&self) -> InferenceType {
            self.inference_type
        }

        fn enabled(&self) -> bool {
            self.enabled
        }
    }

    fn providers() -> Vec<Arc<Fake>> {
        vec![
            Arc::new(Fake {
                id: "llama-disabled",
                inference_type: InferenceType::LlamaCpp,
                enabled: false,
            }),
            Arc::new(Fake {
                id: "whisper",
                inference_type: InferenceType::WhisperCpp,
                enabled: true,
            }),
            Arc::new(Fake {
                id: "llama",
                inference_type: InferenceType::LlamaCpp,
                enabled: true,
            }),
            Arc::new(Fake {
                id: "llama-second",
                inference_type: InferenceType::LlamaCpp,
                enabled: true,
            }),
        ]
    }

    #[test]
    fn first_enabled_provider_of_the_type_wins() {
        let providers = providers();
        let selected = select_provider(&providers, None, InferenceType::LlamaCpp).unwrap();
        assert_eq!(selected.id(), "llama");
    }

    #[test]
    fn explicit_provider_overrides_the_type() {
        let providers = providers();
        let selected = select_provider(&providers, Some("whisper"), InferenceType::LlamaCpp).unwrap();
        assert_eq!(selected.id(), "whisper");
    }

    #[test]
    fn disabled_or_missing_providers_are_unavailable() {
        let providers = providers();

        let disabled = select_provider(&providers, Some("llama-disabled"), InferenceType::LlamaCpp);
        assert!(matches!(disabled, Err(OrchestratorError::ProviderUnavailable { .. })));

        let missing = select_provider(&providers, Some("vllm"), InferenceType::LlamaCpp);
        assert!(matches!(missing, Err(OrchestratorError::ProviderUnavailable { .. })));

        let none = select_provider(&providers, None, InferenceType::OpenVino);
        assert!(matches!(none, Err(OrchestratorError::ProviderUnavailable { .. })));
    }

    #[test]
    fn registry_filters_by_type() {
        let mut registry = ProviderRegistry::new(RuntimeType::Podman);
        for provider in providers() {
            registry.register(provider);
        }

        assert_eq!(registry.by_type(InferenceType::LlamaCpp).len(), 3);
        assert!(registry.get("whisper").is_some());
        assert_eq!(registry.select(None, InferenceType::WhisperCpp).unwrap().id(), "whisper");
    }

    #[test]
    fn free_port_is_non_zero() {
        assert!(free_port().unwrap() > 0);
    }
}
