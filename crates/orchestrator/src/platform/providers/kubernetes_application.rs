use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Pod, PodSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{info, warn};

use super::{free_port, ApplicationConfig, ApplicationProvider, KubernetesLlamaCppProvider};
use crate::core::types::{
    K8S_ANNOTATION_LOCAL_PORT, K8S_ANNOTATION_MODEL_POD, K8S_ANNOTATION_MODEL_SERVICE,
    K8S_CREATOR_LABEL, K8S_CREATOR_VALUE, MODEL_SERVICE_PORT, POD_LABEL_MODEL_ID,
    POD_LABEL_RECIPE_ID,
};
use crate::core::{InferenceServerConfig, OrchestratorError, Result, TaskRegistry};
use crate::platform::container::ContainerEngine;
use crate::platform::k8s::KubernetesApi;

/// Label tying the model service to the pod serving the model.
pub const LABEL_MODEL_SERVICE: &str = "ai-lab-model-service";

/// Model server pod and the service in front of it.
struct ModelService {
    pod: String,
    service: String,
}

/// Materializes a recipe on the cluster: a model server pod, a service in
/// front of it, and the application pod pointing at the service.
pub struct KubernetesApplicationProvider {
    api: Arc<dyn KubernetesApi>,
    engine: Option<Arc<dyn ContainerEngine>>,
    model_provider: Arc<KubernetesLlamaCppProvider>,
    tasks: Arc<TaskRegistry>,
}

impl KubernetesApplicationProvider {
    /// `engine` pushes locally built images; without it images must already
    /// be reachable from the cluster.
    pub fn new(
        api: Arc<dyn KubernetesApi>,
        engine: Option<Arc<dyn ContainerEngine>>,
        model_provider: Arc<KubernetesLlamaCppProvider>,
        tasks: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            api,
            engine,
            model_provider,
            tasks,
        }
    }

    async fn push_images(&self, config: &ApplicationConfig) -> Result<()> {
        let Some(engine) = &self.engine else {
            return Ok(());
        };
        for image in config.images.iter().filter(|i| !i.model_service) {
            self.tasks
                .track(format!("Pushing {}", image.name), config.labels.clone(), engine.push_image(&image.name))
                .await?;
        }
        Ok(())
    }

    async fn create_model_service(&self, config: &ApplicationConfig) -> Result<ModelService> {
        let selector = uuid::Uuid::new_v4().simple().to_string();
        let model_image = config
            .images
            .iter()
            .find(|i| i.model_service)
            .map(|i| i.name.clone());
        let server_config = InferenceServerConfig {
            port: free_port()?,
            models_info: vec![config.model.clone()],
            provider_id: None,
            image: model_image,
            labels: config.labels.clone(),
            gpu: false,
        };
        let model_pod = self
            .model_provider
            .create_server_pod(
                &server_config,
                BTreeMap::from([(LABEL_MODEL_SERVICE.to_string(), selector.clone())]),
            )
            .await?
            .metadata
            .name
            .ok_or_else(|| OrchestratorError::external("create pod", "model pod has no name"))?;

        let service = Service {
            metadata: ObjectMeta {
                generate_name: Some("ai-lab-model-".to_string()),
                labels: Some(creator_labels()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([(LABEL_MODEL_SERVICE.to_string(), selector)])),
                ports: Some(vec![ServicePort {
                    port: i32::from(MODEL_SERVICE_PORT),
                    target_port: Some(IntOrString::Int(i32::from(MODEL_SERVICE_PORT))),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = match self.api.create_service(service).await {
            Ok(created) => created,
            Err(e) => {
                self.discard(&model_pod, None).await;
                return Err(e);
            }
        };
        let service = created
            .metadata
            .name
            .ok_or_else(|| OrchestratorError::external("create service", "service has no name"))?;
        Ok(ModelService { pod: model_pod, service })
    }

    /// Best effort removal of the model resources of an application that
    /// failed to start.
    async fn discard(&self, model_pod: &str, service: Option<&str>) {
        if let Some(service) = service {
            if let Err(e) = self.api.delete_service(service).await {
                warn!(%service, "Failed to delete model service: {e}");
            }
        }
        if let Err(e) = self.api.delete_pod(model_pod).await {
            warn!(pod = %model_pod, "Failed to delete model pod: {e}");
        }
    }

    fn application_pod(&self, config: &ApplicationConfig, model: &ModelService, local_port: u16) -> Pod {
        let endpoint = format!("http://{}:{MODEL_SERVICE_PORT}", model.service);
        let containers = config
            .images
            .iter()
            .filter(|i| !i.model_service)
            .map(|image| Container {
                name: image.app_name.clone(),
                image: Some(image.name.clone()),
                env: Some(vec![EnvVar {
                    name: "MODEL_ENDPOINT".to_string(),
                    value: Some(endpoint.clone()),
                    ..Default::default()
                }]),
                ports: Some(
                    image
                        .ports
                        .iter()
                        .map(|port| ContainerPort {
                            container_port: i32::from(*port),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            })
            .collect();

        Pod {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", config.recipe.id)),
                labels: Some(creator_labels()),
                annotations: Some(BTreeMap::from([
                    (POD_LABEL_RECIPE_ID.to_string(), config.recipe.id.clone()),
                    (POD_LABEL_MODEL_ID.to_string(), config.model.id.clone()),
                    (K8S_ANNOTATION_LOCAL_PORT.to_string(), local_port.to_string()),
                    (K8S_ANNOTATION_MODEL_POD.to_string(), model.pod.clone()),
                    (K8S_ANNOTATION_MODEL_SERVICE.to_string(), model.service.clone()),
                ])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn creator_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(K8S_CREATOR_LABEL.to_string(), K8S_CREATOR_VALUE.to_string())])
}

#[async_trait]
impl ApplicationProvider for KubernetesApplicationProvider {
    type Output = Pod;

    #[tracing::instrument(skip_all, fields(recipe_id = %config.recipe.id, model_id = %config.model.id))]
    async fn perform(&self, config: &ApplicationConfig) -> Result<Pod> {
        self.push_images(config).await?;
        let model = self.create_model_service(config).await?;
        let created = async {
            let local_port = free_port()?;
            let pod = self.application_pod(config, &model, local_port);
            let created = self
                .tasks
                .track("Creating AI App", config.labels.clone(), self.api.create_pod(pod))
                .await?;
            info!(pod = ?created.metadata.name, service = %model.service, local_port, "Application pod created");
            Ok::<_, OrchestratorError>(created)
        }
        .await;
        if created.is_err() {
            self.discard(&model.pod, Some(&model.service)).await;
        }
        created
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::core::catalog::RecipeManager;
    use crate::testing::{labels, model, recipe, MockCatalog, MockContainerEngine, MockKubernetes};

    #[tokio::test]
    async fn wires_application_to_the_model_service() {
        let api = Arc::new(MockKubernetes::new());
        let engine = Arc::new(MockContainerEngine::new());
        let tasks = Arc::new(TaskRegistry::new());
        let model_provider = Arc::new(KubernetesLlamaCppProvider::new(api.clone(), tasks.clone()));
        let provider = KubernetesApplicationProvider::new(api.clone(), Some(engine.clone()), model_provider, tasks);
        let recipe = recipe("chatbot");
        let images = MockCatalog::new().build_recipe(&recipe, &labels(&[])).await.unwrap();
        let config = ApplicationConfig {
            recipe,
            model: model("granite"),
            images,
            model_path: PathBuf::from("/models/granite/granite.gguf"),
            labels: labels(&[]),
        };

        let app_pod = provider.perform(&config).await.unwrap();

        assert_eq!(engine.count_calls("push_image"), 1);
        let pods = api.pods.lock().unwrap().clone();
        assert_eq!(pods.len(), 2);
        let model_selector = pods[0].metadata.labels.clone().unwrap()[LABEL_MODEL_SERVICE].clone();

        let services = api.services.lock().unwrap().clone();
        let spec = services[0].spec.clone().unwrap();
        assert_eq!(spec.selector.unwrap()[LABEL_MODEL_SERVICE], model_selector);

        let annotations = app_pod.metadata.annotations.clone().unwrap();
        assert_eq!(annotations[POD_LABEL_RECIPE_ID], "chatbot");
        assert!(annotations[K8S_ANNOTATION_LOCAL_PORT].parse::<u16>().is_ok());
        let service_name = services[0].metadata.name.clone().unwrap();
        assert_eq!(annotations[K8S_ANNOTATION_MODEL_SERVICE], service_name);
        assert_eq!(
            Some(&annotations[K8S_ANNOTATION_MODEL_POD]),
            pods[0].metadata.name.as_ref()
        );
        let env = app_pod.spec.unwrap().containers[0].env.clone().unwrap();
        assert_eq!(env[0].value.clone().unwrap(), format!("http://{service_name}:8000"));
    }
}
