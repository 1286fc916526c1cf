use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use api_types::InferenceType;
use async_trait::async_trait;
use tracing::info;

use super::{single_model, InferenceProvider, ProviderInfo};
use crate::core::types::{LABEL_INFERENCE_SERVER, MODEL_SERVICE_PORT};
use crate::core::{InferenceServerConfig, OrchestratorError, Result, TaskRegistry};
use crate::platform::container::{
    ContainerCreateOptions, ContainerEngine, CreatedContainer, HealthCheck, Mount, PortMapping,
};

pub const LLAMACPP_IMAGE: &str = "quay.io/ai-lab/llamacpp_python:latest";

/// Runs a llama.cpp server container on the local engine.
pub struct PodmanLlamaCppProvider {
    engine: Arc<dyn ContainerEngine>,
    tasks: Arc<TaskRegistry>,
    image: String,
    enabled: bool,
}

impl PodmanLlamaCppProvider {
    pub fn new(engine: Arc<dyn ContainerEngine>, tasks: Arc<TaskRegistry>) -> Self {
        Self {
            engine,
            tasks,
            image: LLAMACPP_IMAGE.to_string(),
            enabled: true,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn container_options(&self, config: &InferenceServerConfig, image: String) -> Result<ContainerCreateOptions> {
        let model = single_model(config)?;
        let file = model.file.as_ref().ok_or_else(|| OrchestratorError::InvalidInput {
            message: format!("model {} is not available on the container host", model.id),
        })?;

        let model_ids: Vec<&str> = config.models_info.iter().map(|m| m.id.as_str()).collect();
        let mut labels = config.labels.clone();
        labels.insert(
            LABEL_INFERENCE_SERVER.to_string(),
            serde_json::to_string(&model_ids).map_err(|e| OrchestratorError::InvalidInput {
                message: e.to_string(),
            })?,
        );
        labels.insert("api".to_string(), format!("http://localhost:{}/v1", config.port));
        labels.insert("docs".to_string(), format!("http://localhost:{}/docs", config.port));

        let env = BTreeMap::from([
            ("MODEL_PATH".to_string(), format!("/models/{}", file.file)),
            ("HOST".to_string(), "0.0.0.0".to_string()),
            ("PORT".to_string(), MODEL_SERVICE_PORT.to_string()),
        ]);

        Ok(ContainerCreateOptions {
            name: Some(format!("inference-server-{}", short_id())),
            image,
            labels,
            env,
            command: vec![],
            ports: vec![PortMapping {
                container_port: MODEL_SERVICE_PORT,
                host_port: Some(config.port),
            }],
            mounts: vec![Mount {
                source: file.path.clone(),
                target: "/models".to_string(),
                read_only: true,
            }],
            pod: None,
            health_check: Some(HealthCheck {
                command: format!("curl -sSf localhost:{MODEL_SERVICE_PORT}/docs > /dev/null"),
                interval: Duration::from_secs(5),
                retries: 20,
            }),
            auto_remove: false,
            gpu: config.gpu,
        })
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl ProviderInfo for PodmanLlamaCppProvider {
    fn id(&self) -> &str {
        "podman-llamacpp"
    }

    fn inference_type(&self) -> InferenceType {
        InferenceType::LlamaCpp
    }

    fn enabled(&self) -> bool {
        self.enabled
    }
}

#[async_trait]
impl InferenceProvider for PodmanLlamaCppProvider {
    type Output = CreatedContainer;

    #[tracing::instrument(skip_all, fields(port = config.port))]
    async fn perform(&self, config: &InferenceServerConfig) -> Result<CreatedContainer> {
        let image = config.image.clone().unwrap_or_else(|| self.image.clone());
        let options = self.container_options(config, image.clone())?;

        self.tasks
            .track(format!("Pulling {image}."), config.labels.clone(), self.engine.pull_image(&image))
            .await?;

        let created = self
            .tasks
            .track("Creating container.", config.labels.clone(), async {
                let created = self.engine.create_container(options).await?;
                self.engine.start_container(&created.id).await?;
                Ok::<_, OrchestratorError>(created)
            })
            .await?;

        info!(container_id = %created.id, %image, "Inference server container started");
        Ok(created)
    }
}
