use std::sync::Arc;

use crate::core::TaskRegistry;
use crate::domain::application::{KubernetesApplicationManager, PodmanApplicationManager};
use crate::domain::inference::{KubernetesInferenceManager, PodmanInferenceManager};
use crate::domain::instructlab::InstructLabManager;
use crate::domain::monitoring::MonitoringManager;
use crate::domain::registry::{ApplicationRegistry, InferenceServerRegistry};
use crate::infrastructure::LocalCatalog;
use crate::platform::container::{ContainerEngine, ContainerEventRegistry};
use crate::platform::k8s::{KubeCluster, KubernetesPodRegistry};

/// Services of the local container engine.
pub struct PodmanServices {
    pub engine: Arc<dyn ContainerEngine>,
    pub events: Arc<ContainerEventRegistry>,
    pub inference: Arc<PodmanInferenceManager>,
    pub applications: Arc<PodmanApplicationManager>,
    pub instructlab: Arc<InstructLabManager>,
    pub monitoring: Arc<MonitoringManager>,
}

/// Services of the Kubernetes cluster.
pub struct KubernetesServices {
    pub cluster: Arc<KubeCluster>,
    pub informer: Arc<KubernetesPodRegistry>,
    pub inference: Arc<KubernetesInferenceManager>,
    pub applications: Arc<KubernetesApplicationManager>,
}

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub catalog: Arc<LocalCatalog>,
    pub tasks: Arc<TaskRegistry>,
    pub inference: Arc<InferenceServerRegistry>,
    pub applications: Arc<ApplicationRegistry>,
    pub podman: Option<PodmanServices>,
    pub kubernetes: Option<KubernetesServices>,
}

impl ApplicationServices {
    /// Starts every engine listening to its runtime.
    pub fn init(&self) {
        self.inference.init();
        self.applications.init();
        if let Some(podman) = &self.podman {
            podman.instructlab.init();
        }
    }

    /// Cancels the timers and subscriptions of every engine.
    pub fn dispose(&self) {
        if let Some(podman) = &self.podman {
            podman.monitoring.dispose();
            podman.instructlab.dispose();
        }
        self.applications.dispose();
        self.inference.dispose();
    }

    pub fn instructlab(&self) -> Option<Arc<InstructLabManager>> {
        self.podman.as_ref().map(|p| Arc::clone(&p.instructlab))
    }

    pub fn monitoring(&self) -> Option<Arc<MonitoringManager>> {
        self.podman.as_ref().map(|p| Arc::clone(&p.monitoring))
    }
}
