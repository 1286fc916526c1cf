use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{free_port, ApplicationConfig, ApplicationProvider};
use crate::core::types::{
    POD_LABEL_APP_PORTS, POD_LABEL_MODEL_ID, POD_LABEL_MODEL_PORTS, POD_LABEL_RECIPE_ID,
};
use crate::core::{OrchestratorError, Result, TaskRegistry};
use crate::platform::container::{
    ContainerCreateOptions, ContainerEngine, Mount, PodCreateOptions, PortMapping,
};

/// Pod created for a recipe application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationPod {
    pub pod_id: String,
    pub app_ports: Vec<u16>,
    pub model_ports: Vec<u16>,
}

/// Joins ports the way they are stored in pod labels.
pub fn format_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses a port label; malformed entries are skipped.
pub fn parse_ports(value: Option<&String>) -> Vec<u16> {
    value
        .map(|v| v.split(',').filter_map(|p| p.trim().parse().ok()).collect())
        .unwrap_or_default()
}

/// Materializes a recipe as one pod on the local engine: the model service
/// container plus every application container.
pub struct PodmanApplicationProvider {
    engine: Arc<dyn ContainerEngine>,
    tasks: Arc<TaskRegistry>,
}

impl PodmanApplicationProvider {
    pub fn new(engine: Arc<dyn ContainerEngine>, tasks: Arc<TaskRegistry>) -> Self {
        Self { engine, tasks }
    }

    async fn create_containers(&self, config: &ApplicationConfig, pod_id: &str, model_port: Option<u16>) -> Result<()> {
        let model_dir = config
            .model_path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".to_string());
        let model_file = config
            .model_path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .ok_or_else(|| OrchestratorError::InvalidInput {
                message: format!("model path {} has no file name", config.model_path.display()),
            })?;

        // model service first so the application finds its endpoint
        let mut images = config.images.clone();
        images.sort_by_key(|image| !image.model_service);

        for image in &images {
            let mut options = ContainerCreateOptions {
                name: Some(format!("{}-{}", image.app_name, short_suffix(pod_id))),
                image: image.name.clone(),
                labels: config.labels.clone(),
                pod: Some(pod_id.to_string()),
                ..Default::default()
            };
            if image.model_service {
                options.mounts.push(Mount {
                    source: model_dir.clone(),
                    target: "/models".to_string(),
                    read_only: true,
                });
                options.env = BTreeMap::from([
                    ("MODEL_PATH".to_string(), format!("/models/{model_file}")),
                    ("HOST".to_string(), "0.0.0.0".to_string()),
                ]);
                if let Some(port) = image.ports.first() {
                    options.env.insert("PORT".to_string(), port.to_string());
                }
            } else if let Some(port) = model_port {
                options
                    .env
                    .insert("MODEL_ENDPOINT".to_string(), format!("http://localhost:{port}"));
            }
            self.engine.create_container(options).await?;
        }
        Ok(())
    }
}

fn short_suffix(id: &str) -> &str {
    &id[..id.len().min(8)]
}

#[async_trait]
impl ApplicationProvider for PodmanApplicationProvider {
    type Output = ApplicationPod;

    #[tracing::instrument(skip_all, fields(recipe_id = %config.recipe.id, model_id = %config.model.id))]
    async fn perform(&self, config: &ApplicationConfig) -> Result<ApplicationPod> {
        let mut ports = Vec::new();
        let mut app_ports = Vec::new();
        let mut model_ports = Vec::new();
        let mut model_container_port = None;
        for image in &config.images {
            for &container_port in &image.ports {
                let host_port = free_port()?;
                ports.push(PortMapping {
                    container_port,
                    host_port: Some(host_port),
                });
                if image.model_service {
                    model_ports.push(host_port);
                    model_container_port.get_or_insert(container_port);
                } else {
                    app_ports.push(host_port);
                }
            }
        }

        let labels = BTreeMap::from([
            (POD_LABEL_RECIPE_ID.to_string(), config.recipe.id.clone()),
            (POD_LABEL_MODEL_ID.to_string(), config.model.id.clone()),
            (POD_LABEL_APP_PORTS.to_string(), format_ports(&app_ports)),
            (POD_LABEL_MODEL_PORTS.to_string(), format_ports(&model_ports)),
        ]);

        let pod_id = self
            .tasks
            .track("Creating AI App", config.labels.clone(), async {
                let pod_id = self
                    .engine
                    .create_pod(PodCreateOptions {
                        name: format!("{}-{}", config.recipe.id, uuid::Uuid::new_v4().simple()),
                        labels,
                        ports,
                    })
                    .await?;
                if let Err(e) = self.create_containers(config, &pod_id, model_container_port).await {
                    if let Err(cleanup) = self.engine.remove_pod(&pod_id).await {
                        warn!(%pod_id, "Failed to remove partially created pod: {cleanup}");
                    }
                    return Err(e);
                }
                Ok::<_, OrchestratorError>(pod_id)
            })
            .await?;

        info!(%pod_id, ?app_ports, ?model_ports, "Application pod created");
        Ok(ApplicationPod {
            pod_id,
            app_ports,
            model_ports,
        })
    }
}
