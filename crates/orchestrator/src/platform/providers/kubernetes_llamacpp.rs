use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::{InferenceType, Labels, ModelInfo};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::info;

use super::podman_llamacpp::LLAMACPP_IMAGE;
use super::{single_model, InferenceProvider, ProviderInfo};
use crate::core::types::{
    K8S_ANNOTATION_MODEL, K8S_ANNOTATION_PORT, K8S_CREATOR_LABEL, K8S_CREATOR_VALUE,
    MODEL_SERVICE_PORT,
};
use crate::core::{InferenceServerConfig, OrchestratorError, Result, TaskRegistry};
use crate::platform::k8s::KubernetesApi;

/// PVC annotation naming the model stored in the claim.
pub const PVC_ANNOTATION_MODEL: &str = "podman-ai-lab-model";

const DOWNLOADER_IMAGE: &str = "quay.io/curl/curl:latest";
const GIB: u64 = 1024 * 1024 * 1024;

/// Runs a llama.cpp server pod with its model on a persistent volume.
pub struct KubernetesLlamaCppProvider {
    api: Arc<dyn KubernetesApi>,
    tasks: Arc<TaskRegistry>,
    image: String,
    enabled: bool,
}

impl KubernetesLlamaCppProvider {
    pub fn new(api: Arc<dyn KubernetesApi>, tasks: Arc<TaskRegistry>) -> Self {
        Self {
            api,
            tasks,
            image: LLAMACPP_IMAGE.to_string(),
            enabled: true,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Claim holding `model`, created on first use.
    async fn model_volume(&self, model: &ModelInfo) -> Result<String> {
        let existing = self.api.list_pvcs().await?.into_iter().find(|pvc| {
            pvc.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(PVC_ANNOTATION_MODEL))
                == Some(&model.id)
        });
        if let Some(name) = existing.and_then(|pvc| pvc.metadata.name) {
            return Ok(name);
        }

        let created = self.api.create_pvc(model_claim(model)).await?;
        created.metadata.name.ok_or_else(|| {
            OrchestratorError::external("create persistent volume claim", "claim has no name")
        })
    }

    /// Pod specification of a server for `model` backed by `claim`.
    fn server_pod(&self, config: &InferenceServerConfig, model: &ModelInfo, claim: &str, labels: Labels) -> Result<Pod> {
        let url = model.url.as_deref().ok_or_else(|| OrchestratorError::InvalidInput {
            message: format!("model {} has no download url", model.id),
        })?;
        let file = model_file_name(model, url);
        let image = config.image.clone().unwrap_or_else(|| self.image.clone());

        let mut pod_labels: BTreeMap<String, String> = labels;
        pod_labels.insert(K8S_CREATOR_LABEL.to_string(), K8S_CREATOR_VALUE.to_string());
        let annotations = BTreeMap::from([
            (K8S_ANNOTATION_MODEL.to_string(), model.id.clone()),
            (K8S_ANNOTATION_PORT.to_string(), config.port.to_string()),
        ]);

        let mount = VolumeMount {
            name: "models".to_string(),
            mount_path: "/models".to_string(),
            ..Default::default()
        };
        let limits = config.gpu.then(|| {
            BTreeMap::from([("nvidia.com/gpu".to_string(), Quantity("1".to_string()))])
        });

        Ok(Pod {
            metadata: ObjectMeta {
                generate_name: Some("inference-server-".to_string()),
                labels: Some(pod_labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                init_containers: Some(vec![Container {
                    name: "model-downloader".to_string(),
                    image: Some(DOWNLOADER_IMAGE.to_string()),
                    command: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        format!("[ -f /models/{file} ] || curl -sSL -o /models/{file} {url}"),
                    ]),
                    volume_mounts: Some(vec![mount.clone()]),
                    ..Default::default()
                }]),
                containers: vec![Container {
                    name: "llamacpp-server".to_string(),
                    image: Some(image),
                    env: Some(vec![
                        env("MODEL_PATH", &format!("/models/{file}")),
                        env("HOST", "0.0.0.0"),
                        env("PORT", &MODEL_SERVICE_PORT.to_string()),
                    ]),
                    ports: Some(vec![ContainerPort {
                        container_port: i32::from(MODEL_SERVICE_PORT),
                        ..Default::default()
                    }]),
                    volume_mounts: Some(vec![mount]),
                    resources: limits.map(|limits| ResourceRequirements {
                        limits: Some(limits),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "models".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim.to_string(),
                        read_only: Some(false),
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn model_file_name(model: &ModelInfo, url: &str) -> String {
    model
        .file
        .as_ref()
        .map(|f| f.file.clone())
        .or_else(|| url.rsplit('/').next().filter(|s| !s.is_empty()).map(str::to_string))
        .unwrap_or_else(|| format!("{}.gguf", model.id))
}

/// Claim sized to hold the model, rounded up to whole GiB.
fn model_claim(model: &ModelInfo) -> PersistentVolumeClaim {
    let size_gib = model.memory.map(|bytes| bytes.div_ceil(GIB)).unwrap_or(1).max(1);
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            generate_name: Some("ai-lab-model-".to_string()),
            labels: Some(BTreeMap::from([(
                K8S_CREATOR_LABEL.to_string(),
                K8S_CREATOR_VALUE.to_string(),
            )])),
            annotations: Some(BTreeMap::from([(
                PVC_ANNOTATION_MODEL.to_string(),
                model.id.clone(),
            )])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(format!("{size_gib}Gi")),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl ProviderInfo for KubernetesLlamaCppProvider {
    fn id(&self) -> &str {
        "kubernetes-llamacpp"
    }

    fn inference_type(&self) -> InferenceType {
        InferenceType::LlamaCpp
    }

    fn enabled(&self) -> bool {
        self.enabled
    }
}

#[async_trait]
impl InferenceProvider for KubernetesLlamaCppProvider {
    type Output = Pod;

    async fn perform(&self, config: &InferenceServerConfig) -> Result<Pod> {
        self.create_server_pod(config, Labels::new()).await
    }
}

impl KubernetesLlamaCppProvider {
    /// Creates the server pod with extra `pod_labels`, used as service selectors.
    #[tracing::instrument(skip_all, fields(namespace = self.api.namespace()))]
    pub async fn create_server_pod(&self, config: &InferenceServerConfig, pod_labels: Labels) -> Result<Pod> {
        let model = single_model(config)?;
        self.tasks
            .track("Creating pod.", config.labels.clone(), async {
                let claim = self.model_volume(model).await?;
                let pod = self.server_pod(config, model, &claim, pod_labels)?;
                let created = self.api.create_pod(pod).await?;
                info!(pod = ?created.metadata.name, %claim, "Inference server pod created");
                Ok::<_, OrchestratorError>(created)
            })
            .await
    }
}
