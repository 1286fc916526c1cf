//! Inference servers running as containers on the local engine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use api_types::{
    Connection, InferenceServerInfo, InferenceServerStatus, Labels, ModelFile, ModelInfo,
    RuntimeType,
};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::inference_type_of;
use crate::core::catalog::{CatalogManager, ModelsManager};
use crate::core::sync;
use crate::core::types::LABEL_INFERENCE_SERVER;
use crate::core::{
    EngineIdentity, InferenceCommands, InferenceServerConfig, OrchestratorError, ReconcileConfig,
    Result, RuntimeEngine, RuntimeInstance, TaskRegistry, UpdateNotifier,
};
use crate::platform::container::{
    ContainerEngine, ContainerEventRegistry, ContainerStatus, ContainerSummary, CreatedContainer,
};
use crate::platform::providers::{InferenceProvider, ProviderRegistry};

/// Where a server container lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub engine_id: String,
    pub container_id: String,
}

pub type PodmanInstance = RuntimeInstance<ContainerDetails>;

pub type ContainerProviders = ProviderRegistry<dyn InferenceProvider<Output = CreatedContainer>>;

/// Tracks inference server containers.
///
/// The server map is rebuilt from the container list on every refresh and
/// kept current between refreshes by a poll per container plus its `die`
/// and `remove` events. Commands move a server through a transient status
/// first; polls and events leave transitioning servers alone.
pub struct PodmanInferenceManager {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<dyn ContainerEngine>,
    events: Arc<ContainerEventRegistry>,
    providers: ContainerProviders,
    models: Arc<dyn ModelsManager>,
    catalog: Arc<dyn CatalogManager>,
    tasks: Arc<TaskRegistry>,
    config: ReconcileConfig,
    servers: RwLock<HashMap<String, PodmanInstance>>,
    watchers: Mutex<HashMap<String, CancellationToken>>,
    initialized: AtomicBool,
    listening: AtomicBool,
    token: CancellationToken,
    notifier: UpdateNotifier<Vec<PodmanInstance>>,
}

impl PodmanInferenceManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        events: Arc<ContainerEventRegistry>,
        providers: ContainerProviders,
        models: Arc<dyn ModelsManager>,
        catalog: Arc<dyn CatalogManager>,
        tasks: Arc<TaskRegistry>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                events,
                providers,
                models,
                catalog,
                tasks,
                config,
                servers: RwLock::new(HashMap::new()),
                watchers: Mutex::new(HashMap::new()),
                initialized: AtomicBool::new(false),
                listening: AtomicBool::new(false),
                token: CancellationToken::new(),
                notifier: UpdateNotifier::new(),
            }),
        }
    }

    /// True once a refresh succeeded and until retries are exhausted.
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: &str) -> Option<PodmanInstance> {
        sync::read(&self.inner.servers).get(id).cloned()
    }

    /// First server serving `model_id`.
    pub fn find_server_by_model(&self, model_id: &str) -> Option<InferenceServerInfo> {
        self.servers()
            .into_iter()
            .find(|s| s.models.iter().any(|m| m.id == model_id))
            .map(|s| s.info())
    }

    /// Resynchronizes with the engine in the background, giving up after
    /// `retries` failed attempts.
    pub fn retryable_refresh(&self, retries: u32) -> JoinHandle<()> {
        Inner::retryable_refresh(&self.inner, retries)
    }

    pub async fn refresh(&self) -> Result<()> {
        Inner::refresh(&self.inner).await
    }

    #[cfg(test)]
    pub(crate) async fn poll(&self, id: &str) {
        Inner::update_server_status(&self.inner, id).await;
    }

    /// Moves `id` to `status` unless it is absent or already transitioning.
    /// Returns the server as it was before.
    fn begin_transition(&self, id: &str, status: InferenceServerStatus, verb: &str) -> Result<PodmanInstance> {
        if !self.is_initialized() {
            return Err(OrchestratorError::NotInitialized {
                component: "podman inference manager".to_string(),
            });
        }
        let previous = {
            let mut servers = sync::write(&self.inner.servers);
            let server = servers
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::not_found("inference server", id))?;
            if server.status.is_transitioning() {
                return Err(OrchestratorError::invalid_transition(format!(
                    "cannot {verb} a transitioning server ({})",
                    server.status
                )));
            }
            let previous = server.clone();
            server.set_status(status);
            previous
        };
        self.inner.notify();
        Ok(previous)
    }

    fn task_labels(server: &PodmanInstance) -> Labels {
        Labels::from([(
            "containerId".to_string(),
            server.details.container_id.clone(),
        )])
    }
}

impl Inner {
    fn servers(&self) -> Vec<PodmanInstance> {
        let mut servers: Vec<_> = sync::read(&self.servers).values().cloned().collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    fn notify(&self) {
        self.notifier.notify(self.servers());
    }

    /// Sets `status` on a known server and publishes the change.
    fn set_status(&self, id: &str, status: InferenceServerStatus) {
        let changed = match sync::write(&self.servers).get_mut(id) {
            Some(server) => {
                server.set_status(status);
                true
            }
            None => false,
        };
        if changed {
            self.notify();
        }
    }

    fn retryable_refresh(self: &Arc<Self>, retries: u32) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.refresh_with_retry(retries).await })
    }

    async fn refresh_with_retry(self: Arc<Self>, mut retries: u32) {
        loop {
            if retries == 0 {
                error!("Cannot refresh inference servers: retry limit reached, resetting manager");
                self.reset();
                return;
            }
            match Inner::refresh(&self).await {
                Ok(()) => return,
                Err(e) => warn!(retries_left = retries, "Failed to refresh inference servers: {e}"),
            }
            retries -= 1;
            let delay = self.config.retry_delay();
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Forgets every server and stops every watcher.
    fn reset(&self) {
        for (_, token) in sync::lock(&self.watchers).drain() {
            token.cancel();
        }
        sync::write(&self.servers).clear();
        self.initialized.store(false, Ordering::SeqCst);
        self.notify();
    }

    async fn refresh(self: &Arc<Self>) -> Result<()> {
        let containers = self.engine.list_containers().await?;
        let servers: HashMap<String, PodmanInstance> = containers
            .iter()
            .filter_map(|c| self.to_instance(c))
            .map(|s| (s.id.clone(), s))
            .collect();
        debug!(count = servers.len(), "Inference servers refreshed");

        let ids: Vec<String> = servers.keys().cloned().collect();
        *sync::write(&self.servers) = servers;

        {
            let mut watchers = sync::lock(&self.watchers);
            watchers.retain(|id, token| {
                let keep = ids.contains(id);
                if !keep {
                    token.cancel();
                }
                keep
            });
        }
        for id in ids {
            self.watch(id);
        }

        self.initialized.store(true, Ordering::SeqCst);
        self.notify();
        Ok(())
    }

    fn to_instance(&self, container: &ContainerSummary) -> Option<PodmanInstance> {
        let label = container.labels.get(LABEL_INFERENCE_SERVER)?;
        let model_ids: Vec<String> = serde_json::from_str(label).unwrap_or_else(|e| {
            warn!(container_id = %container.id, "Malformed {LABEL_INFERENCE_SERVER} label: {e}");
            Vec::new()
        });
        let models: Vec<ModelInfo> = model_ids
            .iter()
            .filter(|id| self.models.is_model_on_disk(id))
            .filter_map(|id| self.models.get_model_info(id))
            .collect();
        let status = if container.state == "running" {
            InferenceServerStatus::Running
        } else {
            InferenceServerStatus::Stopped
        };

        Some(RuntimeInstance {
            id: container.id.clone(),
            runtime: RuntimeType::Podman,
            status,
            health: None,
            inference_type: inference_type_of(&models),
            models,
            connection: Connection {
                host: "localhost".to_string(),
                port: container.ports.iter().find_map(|p| p.host_port),
            },
            labels: container.labels.clone(),
            details: ContainerDetails {
                engine_id: container.engine_id.clone(),
                container_id: container.id.clone(),
            },
        })
    }

    /// Starts the poll and event watch of one container; no-op if watched.
    fn watch(self: &Arc<Self>, id: String) {
        let token = {
            let mut watchers = sync::lock(&self.watchers);
            if watchers.contains_key(&id) {
                return;
            }
            let token = self.token.child_token();
            watchers.insert(id.clone(), token.clone());
            token
        };
        let mut events = self.events.subscribe(&id);
        let inner = Arc::clone(self);
        let poll_interval = self.config.poll_interval;

        tokio::spawn(async move {
            // first tick completes immediately
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => Inner::update_server_status(&inner, &id).await,
                    status = events.recv() => match status {
                        Some(ContainerStatus::Die) => Inner::update_server_status(&inner, &id).await,
                        Some(ContainerStatus::Remove) | None => {
                            inner.forget(&id);
                            break;
                        }
                        Some(_) => {}
                    },
                }
            }
            debug!(container_id = %id, "Stopped watching inference server");
        });
    }

    fn forget(&self, id: &str) {
        if let Some(token) = sync::lock(&self.watchers).remove(id) {
            token.cancel();
        }
        if sync::write(&self.servers).remove(id).is_some() {
            info!(container_id = %id, "Inference server container removed");
            self.notify();
        }
    }

    async fn update_server_status(self: &Arc<Self>, id: &str) {
        let container_id = match sync::read(&self.servers).get(id) {
            Some(server) if !server.status.is_transitioning() => server.details.container_id.clone(),
            _ => return,
        };

        let inspect = match self.engine.inspect_container(&container_id).await {
            Ok(inspect) => inspect,
            Err(e) => {
                warn!(%container_id, "Failed to inspect inference server: {e}");
                self.retryable_refresh(2);
                return;
            }
        };

        let changed = {
            let mut servers = sync::write(&self.servers);
            match servers.get_mut(id) {
                // a command may have started while inspecting
                Some(server) if !server.status.is_transitioning() => {
                    let status = if inspect.running {
                        InferenceServerStatus::Running
                    } else {
                        InferenceServerStatus::Stopped
                    };
                    let changed = server.status != status || server.health != inspect.health;
                    server.status = status;
                    server.health = inspect.health;
                    changed
                }
                _ => false,
            }
        };
        if changed {
            self.notify();
        }
    }

    async fn on_started_container(self: &Arc<Self>, container_id: &str) {
        if sync::read(&self.servers).contains_key(container_id) {
            return;
        }
        match self.engine.list_containers().await {
            Ok(containers) => {
                let labelled = containers
                    .iter()
                    .any(|c| c.id == container_id && c.labels.contains_key(LABEL_INFERENCE_SERVER));
                if labelled {
                    info!(%container_id, "Adopting externally started inference server");
                    self.retryable_refresh(2);
                }
            }
            Err(e) => warn!(%container_id, "Failed to list containers: {e}"),
        }
    }

    fn spawn_listeners(self: &Arc<Self>) {
        let mut catalog = self.catalog.subscribe();
        let mut started = self.events.on_start_container_event();
        let mut machine = self.events.on_machine_event();
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.token.cancelled() => break,
                    Some(()) = catalog.recv() => {
                        debug!("Catalog changed, refreshing inference servers");
                        inner.retryable_refresh(inner.config.refresh_retries);
                    }
                    Some(event) = started.recv() => inner.on_started_container(&event.id).await,
                    Some(status) = machine.recv() => {
                        info!(?status, "Container machine changed, refreshing inference servers");
                        inner.retryable_refresh(2);
                    }
                    else => break,
                }
            }
        });
    }
}

impl EngineIdentity for PodmanInferenceManager {
    fn id(&self) -> &str {
        self.inner.engine.id()
    }

    fn runtime(&self) -> RuntimeType {
        RuntimeType::Podman
    }

    fn init(&self) {
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.spawn_listeners();
        self.inner.retryable_refresh(self.inner.config.refresh_retries);
    }

    fn dispose(&self) {
        self.inner.token.cancel();
        sync::lock(&self.inner.watchers).clear();
        sync::write(&self.inner.servers).clear();
        self.inner.initialized.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceCommands for PodmanInferenceManager {
    #[tracing::instrument(skip_all, fields(port = config.port))]
    async fn create_server(&self, mut config: InferenceServerConfig) -> Result<InferenceServerInfo> {
        if !self.is_initialized() {
            return Err(OrchestratorError::NotInitialized {
                component: "podman inference manager".to_string(),
            });
        }
        let inference_type = inference_type_of(&config.models_info);
        let provider = self
            .inner
            .providers
            .select(config.provider_id.as_deref(), inference_type)?;

        for model in &mut config.models_info {
            let path = self.inner.models.upload_model(model, &config.labels).await?;
            model.file = Some(model_file(&path));
        }

        let created = provider.perform(&config).await.inspect_err(|e| {
            info!(target: "telemetry", event = "inference.start", error = %e, "usage error");
        })?;

        let model_ids: Vec<&str> = config.models_info.iter().map(|m| m.id.as_str()).collect();
        let mut labels = config.labels.clone();
        labels.insert(
            LABEL_INFERENCE_SERVER.to_string(),
            serde_json::to_string(&model_ids).unwrap_or_default(),
        );
        let server = RuntimeInstance {
            id: created.id.clone(),
            runtime: RuntimeType::Podman,
            status: InferenceServerStatus::Running,
            health: None,
            models: config.models_info.clone(),
            connection: Connection {
                host: "localhost".to_string(),
                port: Some(config.port),
            },
            labels,
            inference_type,
            details: ContainerDetails {
                engine_id: created.engine_id,
                container_id: created.id.clone(),
            },
        };
        let info = server.info();
        sync::write(&self.inner.servers).insert(created.id.clone(), server);
        self.inner.watch(created.id.clone());

        info!(
            target: "telemetry",
            event = "inference.start",
            models = %model_ids.join(","),
            provider = provider.id(),
            "usage"
        );
        self.inner.notify();
        Ok(info)
    }

    async fn start_server(&self, id: &str) -> Result<()> {
        let server = self.begin_transition(id, InferenceServerStatus::Starting, "start")?;
        let result = self
            .inner
            .tasks
            .track(
                "Starting inference server",
                Self::task_labels(&server),
                self.inner.engine.start_container(&server.details.container_id),
            )
            .await;
        match result {
            Ok(()) => {
                self.inner.set_status(id, InferenceServerStatus::Running);
                Ok(())
            }
            Err(e) => {
                self.inner.set_status(id, InferenceServerStatus::Error);
                info!(target: "telemetry", event = "inference.start", error = %e, "usage error");
                self.inner.retryable_refresh(1);
                Err(e)
            }
        }
    }

    async fn stop_server(&self, id: &str) -> Result<()> {
        let server = self.begin_transition(id, InferenceServerStatus::Stopping, "stop")?;
        let result = self
            .inner
            .tasks
            .track(
                "Stopping inference server",
                Self::task_labels(&server),
                self.inner.engine.stop_container(&server.details.container_id),
            )
            .await;
        match result {
            Ok(()) => {
                self.inner.set_status(id, InferenceServerStatus::Stopped);
                Ok(())
            }
            Err(e) => {
                self.inner.set_status(id, InferenceServerStatus::Error);
                info!(target: "telemetry", event = "inference.stop", error = %e, "usage error");
                self.inner.retryable_refresh(1);
                Err(e)
            }
        }
    }

    async fn remove_server(&self, id: &str) -> Result<()> {
        let server = self.begin_transition(id, InferenceServerStatus::Deleting, "remove")?;
        let container_id = server.details.container_id.clone();
        let result = self
            .inner
            .tasks
            .track("Deleting inference server", Self::task_labels(&server), async {
                if server.status == InferenceServerStatus::Running {
                    self.inner.engine.stop_container(&container_id).await?;
                }
                self.inner.engine.delete_container(&container_id).await
            })
            .await;
        match result {
            Ok(()) => {
                self.inner.forget(id);
                Ok(())
            }
            Err(e) => {
                self.inner.set_status(id, InferenceServerStatus::Error);
                self.inner.retryable_refresh(2);
                Err(e)
            }
        }
    }
}

impl RuntimeEngine for PodmanInferenceManager {
    type Details = ContainerDetails;

    fn servers(&self) -> Vec<PodmanInstance> {
        self.inner.servers()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<PodmanInstance>> {
        self.inner.notifier.subscribe()
    }
}

fn model_file(path: &Path) -> ModelFile {
    ModelFile {
        path: path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        file: path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default(),
    }
}
