use std::sync::Arc;

use api_types::{InferenceServerInfo, RuntimeType};
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::{InferenceRuntime, InferenceServerConfig, OrchestratorError, Result, UpdateNotifier};

/// Every inference runtime, addressed by runtime type or server id.
pub struct InferenceServerRegistry {
    engines: Vec<Arc<dyn InferenceRuntime>>,
    notifier: UpdateNotifier<Vec<InferenceServerInfo>>,
}

impl InferenceServerRegistry {
    pub fn new(engines: Vec<Arc<dyn InferenceRuntime>>) -> Self {
        Self {
            engines,
            notifier: UpdateNotifier::new(),
        }
    }

    /// Servers of every runtime, ordered by runtime then id.
    pub fn servers(&self) -> Vec<InferenceServerInfo> {
        let mut servers: Vec<_> = self.engines.iter().flat_map(|e| e.server_infos()).collect();
        servers.sort_by(|a, b| {
            a.runtime
                .to_string()
                .cmp(&b.runtime.to_string())
                .then_with(|| a.id.cmp(&b.id))
        });
        servers
    }

    pub fn get(&self, id: &str) -> Option<InferenceServerInfo> {
        self.engines
            .iter()
            .flat_map(|e| e.server_infos())
            .find(|s| s.id == id)
    }

    pub fn engine(&self, runtime: RuntimeType) -> Result<Arc<dyn InferenceRuntime>> {
        self.engines
            .iter()
            .find(|e| e.runtime() == runtime)
            .cloned()
            .ok_or_else(|| OrchestratorError::ProviderUnavailable {
                message: format!("no {runtime} inference runtime configured"),
            })
    }

    fn owner(&self, id: &str) -> Result<&Arc<dyn InferenceRuntime>> {
        self.engines
            .iter()
            .find(|e| e.server_infos().iter().any(|s| s.id == id))
            .ok_or_else(|| OrchestratorError::not_found("inference server", id))
    }

    pub async fn create_server(&self, runtime: RuntimeType, config: InferenceServerConfig) -> Result<InferenceServerInfo> {
        self.engine(runtime)?.create_server(config).await
    }

    pub async fn start_server(&self, id: &str) -> Result<()> {
        self.owner(id)?.start_server(id).await
    }

    pub async fn stop_server(&self, id: &str) -> Result<()> {
        self.owner(id)?.stop_server(id).await
    }

    pub async fn remove_server(&self, id: &str) -> Result<()> {
        self.owner(id)?.remove_server(id).await
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<InferenceServerInfo>> {
        self.notifier.subscribe()
    }

    pub fn init(&self) {
        for engine in &self.engines {
            info!(engine = engine.id(), runtime = %engine.runtime(), "Starting inference runtime");
            engine.init();
        }
    }

    pub fn dispose(&self) {
        for engine in &self.engines {
            engine.dispose();
        }
    }

    /// Re-publishes the aggregated snapshot after every engine change until
    /// `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut changes = stream::select_all(self.engines.iter().map(|e| e.changes()));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                change = changes.next() => match change {
                    Some(()) => self.notifier.notify(self.servers()),
                    None => break,
                },
            }
        }
        debug!("Inference server registry stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::core::{ReconcileConfig, TaskRegistry};
    use crate::domain::inference::{ContainerProviders, PodmanInferenceManager};
    use crate::platform::container::{ContainerEventRegistry, CreatedContainer};
    use crate::platform::providers::{free_port, InferenceProvider, PodmanLlamaCppProvider, ProviderRegistry};
    use crate::testing::{model, MockCatalog, MockContainerEngine};

    async fn registry() -> (Arc<InferenceServerRegistry>, Arc<MockContainerEngine>) {
        let engine = Arc::new(MockContainerEngine::new());
        let tasks = Arc::new(TaskRegistry::new());
        let catalog = Arc::new(MockCatalog::new());
        catalog.add_model(model("granite"), true);
        let providers: ContainerProviders = ProviderRegistry::new(RuntimeType::Podman).with(Arc::new(
            PodmanLlamaCppProvider::new(engine.clone(), tasks.clone()),
        )
            as Arc<dyn InferenceProvider<Output = CreatedContainer>>);
        let podman = Arc::new(PodmanInferenceManager::new(
            engine.clone(),
            Arc::new(ContainerEventRegistry::new()),
            providers,
            catalog.clone(),
            catalog,
            tasks,
            ReconcileConfig {
                poll_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        ));
        podman.refresh().await.unwrap();
        (Arc::new(InferenceServerRegistry::new(vec![podman as Arc<dyn InferenceRuntime>])), engine)
    }

    fn config(port: u16) -> InferenceServerConfig {
        InferenceServerConfig {
            port,
            models_info: vec![model("granite")],
            provider_id: None,
            image: None,
            labels: Default::default(),
            gpu: false,
        }
    }

    #[tokio::test]
    async fn commands_are_routed_to_the_owning_runtime() {
        let (registry, engine) = registry().await;
        let port = free_port().unwrap();

        let created = registry.create_server(RuntimeType::Podman, config(port)).await.unwrap();
        registry.stop_server(&created.id).await.unwrap();

        assert_eq!(registry.servers().len(), 1);
        assert_eq!(registry.get(&created.id).unwrap().connection.port, Some(port));
        assert_eq!(engine.count_calls(&format!("stop_container:{}", created.id)), 1);
        assert!(matches!(
            registry.start_server("missing").await,
            Err(OrchestratorError::NotFound { .. })
        ));
        assert!(matches!(
            registry.create_server(RuntimeType::Kubernetes, config(port)).await,
            Err(OrchestratorError::ProviderUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn engine_changes_publish_the_aggregated_snapshot() {
        let (registry, _) = registry().await;
        let mut updates = registry.subscribe();
        let token = CancellationToken::new();
        let runner = {
            let registry = registry.clone();
            let token = token.clone();
            tokio::spawn(async move { registry.run(token).await })
        };
        tokio::task::yield_now().await;

        registry
            .create_server(RuntimeType::Podman, config(free_port().unwrap()))
            .await
            .unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(2), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        token.cancel();
        runner.await.unwrap();
    }
}
