use std::time::Duration;

use api_types::{
    ApplicationInfo, ApplicationStatus, Connection, HealthSnapshot, InferenceServerInfo,
    InferenceServerStatus, InferenceType, Labels, ModelInfo, PodHealth, RuntimeType,
};
use rand::Rng;

/// Container label marking an inference server; the value is a JSON array of model ids.
pub const LABEL_INFERENCE_SERVER: &str = "ai-studio-inference-server";

/// Pod labels written on recipe application pods.
pub const POD_LABEL_RECIPE_ID: &str = "ai-lab-recipe-id";
pub const POD_LABEL_MODEL_ID: &str = "ai-lab-model-id";
pub const POD_LABEL_APP_PORTS: &str = "ai-lab-app-ports";
pub const POD_LABEL_MODEL_PORTS: &str = "ai-lab-model-ports";

/// Image labels written by recipe builds.
pub const IMAGE_LABEL_RECIPE_ID: &str = "ai-lab-recipe-id";
pub const IMAGE_LABEL_MODEL_ID: &str = "ai-lab-model-id";

/// Kubernetes metadata shared by every pod this orchestrator creates.
pub const K8S_CREATOR_LABEL: &str = "creator";
pub const K8S_CREATOR_VALUE: &str = "podman-ai-lab";
pub const K8S_ANNOTATION_MODEL: &str = "podman-ai-lab-inference-model";
pub const K8S_ANNOTATION_PORT: &str = "podman-ai-lab-inference-port";
pub const K8S_ANNOTATION_LOCAL_PORT: &str = "ai-lab-local-port";
/// Model server pod and service created for an application pod
pub const K8S_ANNOTATION_MODEL_POD: &str = "ai-lab-model-pod";
pub const K8S_ANNOTATION_MODEL_SERVICE: &str = "ai-lab-model-service-name";
pub const K8S_DEFAULT_NAMESPACE: &str = "default";

/// Port every model server listens on inside its container.
pub const MODEL_SERVICE_PORT: u16 = 8000;

/// Task labels.
pub const TASK_LABEL_TRACKING_ID: &str = "trackingId";
pub const TASK_LABEL_RECIPE_PULLING: &str = "recipe-pulling";

/// An inference server as tracked by a runtime engine.
///
/// `details` carries what the owning runtime needs to act on the server
/// (container id, pod name...) and never leaves the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeInstance<D> {
    pub id: String,
    pub runtime: RuntimeType,
    pub status: InferenceServerStatus,
    pub health: Option<HealthSnapshot>,
    pub models: Vec<ModelInfo>,
    pub connection: Connection,
    pub labels: Labels,
    pub inference_type: InferenceType,
    pub details: D,
}

impl<D> RuntimeInstance<D> {
    /// Changes the status and forgets the last health report, which no
    /// longer describes the server.
    pub fn set_status(&mut self, status: InferenceServerStatus) {
        self.status = status;
        self.health = None;
    }

    pub fn info(&self) -> InferenceServerInfo {
        InferenceServerInfo {
            id: self.id.clone(),
            runtime: self.runtime,
            status: self.status,
            health: self.health.clone(),
            models: self.models.clone(),
            connection: self.connection.clone(),
            labels: self.labels.clone(),
            inference_type: self.inference_type,
        }
    }
}

/// A recipe application as tracked by an application engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationState<D> {
    pub recipe_id: String,
    pub model_id: String,
    pub runtime: RuntimeType,
    pub status: ApplicationStatus,
    pub health: PodHealth,
    pub app_ports: Vec<u16>,
    pub model_ports: Vec<u16>,
    pub details: D,
}

impl<D> ApplicationState<D> {
    pub fn key(&self) -> String {
        application_key(&self.recipe_id, &self.model_id)
    }

    pub fn info(&self) -> ApplicationInfo {
        ApplicationInfo {
            recipe_id: self.recipe_id.clone(),
            model_id: self.model_id.clone(),
            runtime: self.runtime,
            status: self.status,
            health: self.health,
            app_ports: self.app_ports.clone(),
            model_ports: self.model_ports.clone(),
        }
    }
}

/// Map key of an application: one per recipe/model pair.
pub fn application_key(recipe_id: &str, model_id: &str) -> String {
    format!("{recipe_id}:{model_id}")
}

/// Timings driving the reconciliation loops.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Per-server status poll
    pub poll_interval: Duration,
    /// Lower and upper bound of the jittered delay between refresh retries
    pub retry_backoff: (Duration, Duration),
    /// Retries used when the catalog changes
    pub refresh_retries: u32,
    /// Delay before the first application health check
    pub health_first_tick: Duration,
    /// Delay between the end of a health check and the next one
    pub health_interval: Duration,
    /// Poll interval while waiting for application containers
    pub container_wait_interval: Duration,
    /// Give up waiting for application containers after this long
    pub container_wait_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            retry_backoff: (Duration::from_millis(2000), Duration::from_millis(3000)),
            refresh_retries: 3,
            health_first_tick: Duration::from_secs(1),
            health_interval: Duration::from_secs(10),
            container_wait_interval: Duration::from_secs(5),
            container_wait_timeout: Duration::from_secs(3600),
        }
    }
}

impl ReconcileConfig {
    /// Random delay in `retry_backoff`.
    pub fn retry_delay(&self) -> Duration {
        let (min, max) = self.retry_backoff;
        if max <= min {
            return min;
        }
        rand::thread_rng().gen_range(min..max)
    }
}
