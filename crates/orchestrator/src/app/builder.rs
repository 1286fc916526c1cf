use std::sync::Arc;

use anyhow::{Context, Result};
use api_types::RuntimeType;
use k8s_openapi::api::core::v1::Pod;

use crate::app::services::{ApplicationServices, KubernetesServices, PodmanServices};
use crate::app::Application;
use crate::config::DaemonArgs;
use crate::core::catalog::{CatalogManager, ModelsManager, RecipeManager};
use crate::core::{ApplicationRuntime, InferenceRuntime, ReconcileConfig, TaskRegistry};
use crate::domain::application::{KubernetesApplicationManager, PodmanApplicationManager};
use crate::domain::inference::{
    ContainerProviders, KubernetesInferenceManager, PodProviders, PodmanInferenceManager,
};
use crate::domain::instructlab::{InstructLabManager, InstructLabRegistry};
use crate::domain::monitoring::MonitoringManager;
use crate::domain::registry::{ApplicationRegistry, InferenceServerRegistry};
use crate::infrastructure::{LocalCatalog, LocalRecipeManager};
use crate::platform::container::{
    ContainerEngine, ContainerEventRegistry, CreatedContainer, PodmanApiClient,
};
use crate::platform::k8s::{KubeCluster, KubernetesApi, KubernetesPodRegistry, PortForwarder};
use crate::platform::providers::{
    InferenceProvider, KubernetesApplicationProvider, KubernetesLlamaCppProvider,
    PodmanApplicationProvider, PodmanLlamaCppProvider, ProviderRegistry,
};

/// Engine id of the local Podman connection.
pub const PODMAN_ENGINE_ID: &str = "podman";

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

/// Collaborators every engine shares.
struct Shared {
    catalog: Arc<LocalCatalog>,
    tasks: Arc<TaskRegistry>,
    config: ReconcileConfig,
}

impl Shared {
    fn catalog(&self) -> Arc<dyn CatalogManager> {
        self.catalog.clone()
    }

    fn models(&self) -> Arc<dyn ModelsManager> {
        self.catalog.clone()
    }
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let catalog = LocalCatalog::load(&self.daemon_args.catalog_path, &self.daemon_args.models_dir)
            .with_context(|| format!("failed to load catalog {}", self.daemon_args.catalog_path.display()))?;
        let shared = Shared {
            catalog: Arc::new(catalog),
            tasks: Arc::new(TaskRegistry::new()),
            config: ReconcileConfig::from(&self.daemon_args),
        };

        let podman = self.daemon_args.enable_podman.then(|| self.create_podman_services(&shared));
        let kubernetes = if self.daemon_args.enable_k8s {
            self.create_kubernetes_services(&shared, podman.as_ref()).await
        } else {
            None
        };

        let mut inference_engines: Vec<Arc<dyn InferenceRuntime>> = Vec::new();
        let mut application_engines: Vec<Arc<dyn ApplicationRuntime>> = Vec::new();
        if let Some(podman) = &podman {
            inference_engines.push(podman.inference.clone());
            application_engines.push(podman.applications.clone());
        }
        if let Some(kubernetes) = &kubernetes {
            inference_engines.push(kubernetes.inference.clone());
            application_engines.push(kubernetes.applications.clone());
        }
        if inference_engines.is_empty() {
            tracing::warn!("No runtime enabled, only the catalog is served");
        }

        let services = ApplicationServices {
            catalog: shared.catalog,
            tasks: shared.tasks,
            inference: Arc::new(InferenceServerRegistry::new(inference_engines)),
            applications: Arc::new(ApplicationRegistry::new(application_engines)),
            podman,
            kubernetes,
        };
        Ok(Application::new(services, self.daemon_args))
    }

    fn create_podman_services(&self, shared: &Shared) -> PodmanServices {
        let socket = self.daemon_args.podman_socket_path();
        tracing::info!(socket = %socket.display(), "Using Podman API socket");
        let engine: Arc<dyn ContainerEngine> = Arc::new(PodmanApiClient::new(PODMAN_ENGINE_ID, socket));
        let events = Arc::new(ContainerEventRegistry::new());

        let mut llamacpp = PodmanLlamaCppProvider::new(engine.clone(), shared.tasks.clone());
        if let Some(image) = &self.daemon_args.llamacpp_image {
            llamacpp = llamacpp.with_image(image.clone());
        }
        let llamacpp: Arc<dyn InferenceProvider<Output = CreatedContainer>> = Arc::new(llamacpp);
        let providers: ContainerProviders = ProviderRegistry::new(RuntimeType::Podman).with(llamacpp);

        let inference = Arc::new(PodmanInferenceManager::new(
            engine.clone(),
            events.clone(),
            providers,
            shared.models(),
            shared.catalog(),
            shared.tasks.clone(),
            shared.config.clone(),
        ));

        let recipes: Arc<dyn RecipeManager> =
            Arc::new(LocalRecipeManager::new(Some(engine.clone()), shared.tasks.clone()));
        let applications = Arc::new(PodmanApplicationManager::new(
            engine.clone(),
            events.clone(),
            Arc::new(PodmanApplicationProvider::new(engine.clone(), shared.tasks.clone())),
            shared.catalog(),
            shared.models(),
            recipes,
            shared.tasks.clone(),
            shared.config.clone(),
        ));

        let instructlab = Arc::new(InstructLabManager::new(
            engine.clone(),
            events.clone(),
            inference.clone(),
            shared.models(),
            shared.tasks.clone(),
            Arc::new(InstructLabRegistry::new()),
        ));

        let monitoring = Arc::new(MonitoringManager::new(engine.clone(), events.clone()));

        PodmanServices {
            engine,
            events,
            inference,
            applications,
            instructlab,
            monitoring,
        }
    }

    /// Connects to the cluster. A cluster that cannot be reached disables
    /// the Kubernetes runtime instead of failing the daemon.
    async fn create_kubernetes_services(
        &self,
        shared: &Shared,
        podman: Option<&PodmanServices>,
    ) -> Option<KubernetesServices> {
        let cluster = match KubeCluster::connect(
            self.daemon_args.kubeconfig.clone(),
            self.daemon_args.k8s_namespace.clone(),
        )
        .await
        {
            Ok(cluster) => Arc::new(cluster),
            Err(e) => {
                tracing::warn!("Kubernetes runtime disabled, cluster unreachable: {e:?}");
                return None;
            }
        };
        let api: Arc<dyn KubernetesApi> = cluster.clone();
        let forwarder: Arc<dyn PortForwarder> = cluster.clone();
        let informer = Arc::new(KubernetesPodRegistry::new());

        let llamacpp = Arc::new(KubernetesLlamaCppProvider::new(api.clone(), shared.tasks.clone()));
        let pod_provider: Arc<dyn InferenceProvider<Output = Pod>> = llamacpp.clone();
        let providers: PodProviders = ProviderRegistry::new(RuntimeType::Kubernetes).with(pod_provider);

        let inference = Arc::new(KubernetesInferenceManager::new(
            api.clone(),
            forwarder.clone(),
            informer.clone(),
            providers,
            shared.models(),
            shared.tasks.clone(),
        ));

        let engine = podman.map(|p| p.engine.clone());
        let recipes: Arc<dyn RecipeManager> =
            Arc::new(LocalRecipeManager::new(engine.clone(), shared.tasks.clone()));
        let applications = Arc::new(KubernetesApplicationManager::new(
            api.clone(),
            forwarder,
            informer.clone(),
            Arc::new(KubernetesApplicationProvider::new(
                api,
                engine,
                llamacpp,
                shared.tasks.clone(),
            )),
            shared.catalog(),
            shared.models(),
            recipes,
            shared.tasks.clone(),
        ));

        Some(KubernetesServices {
            cluster,
            informer,
            inference,
            applications,
        })
    }
}
