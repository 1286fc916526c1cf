//! Test adapters implementing the collaborator traits
//!
//! In-memory container engine, Kubernetes API, port forwarder, catalog,
//! models and recipe managers with scriptable failures.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use api_types::{HealthSnapshot, InferenceType, Labels, ModelFile, ModelInfo};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::core::catalog::{CatalogManager, ModelsManager, Recipe, RecipeContainer, RecipeImage, RecipeManager};
use crate::core::{OrchestratorError, Result, UpdateNotifier};
use crate::platform::container::{
    ContainerCreateOptions, ContainerEngine, ContainerInspect, ContainerStats, ContainerSummary,
    CreatedContainer, EngineEvent, PodContainer, PodCreateOptions, PodSummary, PortMapping,
};
use crate::platform::k8s::{ForwardTarget, KubernetesApi, PortForwarder};

pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn model(id: &str) -> ModelInfo {
    ModelInfo {
        id: id.to_string(),
        name: format!("Model {id}"),
        description: String::new(),
        backend: Some(InferenceType::LlamaCpp),
        memory: Some(4 * 1024 * 1024 * 1024),
        url: Some(format!("https://models.example/{id}.gguf")),
        file: None,
        properties: BTreeMap::new(),
    }
}

pub fn recipe(id: &str) -> Recipe {
    Recipe {
        id: id.to_string(),
        name: format!("Recipe {id}"),
        description: String::new(),
        repository: format!("https://git.example/{id}"),
        backend: Some(InferenceType::LlamaCpp),
        containers: vec![
            RecipeContainer {
                name: format!("{id}-app"),
                image: format!("quay.io/ai-lab/{id}-app:latest"),
                ports: vec![8501],
                model_service: false,
            },
            RecipeContainer {
                name: format!("{id}-model"),
                image: "quay.io/ai-lab/llamacpp:latest".to_string(),
                ports: vec![8000],
                model_service: true,
            },
        ],
    }
}

/// Polls `check` until it holds or two seconds elapse.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Mock container engine backed by in-memory containers and pods
pub struct MockContainerEngine {
    containers: Mutex<Vec<ContainerSummary>>,
    inspects: Mutex<HashMap<String, ContainerInspect>>,
    pods: Mutex<Vec<PodSummary>>,
    created: Mutex<Vec<ContainerCreateOptions>>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    holds: Mutex<HashMap<String, Arc<Notify>>>,
    events: Mutex<Option<mpsc::UnboundedSender<Result<EngineEvent>>>>,
    pending_events: Mutex<Vec<EngineEvent>>,
    stats: Mutex<HashMap<String, mpsc::UnboundedSender<Result<ContainerStats>>>>,
    next_id: AtomicUsize,
}

impl MockContainerEngine {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(Vec::new()),
            inspects: Mutex::new(HashMap::new()),
            pods: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            holds: Mutex::new(HashMap::new()),
            events: Mutex::new(None),
            pending_events: Mutex::new(Vec::new()),
            stats: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Adds a container; its inspection reports the same state.
    pub fn add_container(&self, id: &str, labels: Labels, state: &str, host_port: Option<u16>) {
        self.containers.lock().unwrap().push(ContainerSummary {
            id: id.to_string(),
            engine_id: "podman".to_string(),
            names: vec![id.to_string()],
            image: "quay.io/ai-lab/llamacpp:latest".to_string(),
            labels,
            state: state.to_string(),
            ports: vec![PortMapping {
                container_port: 8000,
                host_port,
            }],
            pod_id: None,
        });
        self.set_inspect(id, state, 0);
    }

    pub fn set_inspect(&self, id: &str, status: &str, exit_code: i64) {
        self.inspects.lock().unwrap().insert(
            id.to_string(),
            ContainerInspect {
                id: id.to_string(),
                status: status.to_string(),
                running: status == "running",
                exit_code,
                health: None,
            },
        );
    }

    pub fn set_health(&self, id: &str, status: &str) {
        if let Some(inspect) = self.inspects.lock().unwrap().get_mut(id) {
            inspect.health = Some(HealthSnapshot {
                status: status.to_string(),
                failing_streak: 0,
                log: vec![],
            });
        }
    }

    pub fn forget_inspect(&self, id: &str) {
        self.inspects.lock().unwrap().remove(id);
    }

    pub fn add_pod(&self, id: &str, labels: Labels, status: &str, containers: &[&str]) {
        for container in containers {
            self.set_inspect(container, "running", 0);
        }
        self.pods.lock().unwrap().push(PodSummary {
            id: id.to_string(),
            name: id.to_string(),
            engine_id: "podman".to_string(),
            status: status.to_string(),
            labels,
            containers: containers
                .iter()
                .map(|c| PodContainer {
                    id: c.to_string(),
                    name: c.to_string(),
                    status: "running".to_string(),
                })
                .collect(),
        });
    }

    pub fn pods(&self) -> Vec<PodSummary> {
        self.pods.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<ContainerCreateOptions> {
        self.created.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Makes every call of `operation` fail.
    pub fn fail_on(&self, operation: &str) {
        self.failing.lock().unwrap().insert(operation.to_string());
    }

    pub fn recover(&self, operation: &str) {
        self.failing.lock().unwrap().remove(operation);
    }

    /// Blocks calls of `operation` until the returned handle is notified.
    pub fn hold(&self, operation: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.holds
            .lock()
            .unwrap()
            .insert(operation.to_string(), notify.clone());
        notify
    }

    pub fn emit(&self, event: EngineEvent) {
        let sender = self.events.lock().unwrap().clone();
        match sender {
            Some(sender) if sender.send(Ok(event.clone())).is_ok() => {}
            _ => self.pending_events.lock().unwrap().push(event),
        }
    }

    /// Ends the current event stream.
    pub fn disconnect_events(&self) {
        self.events.lock().unwrap().take();
    }

    /// Sends one sample on the stats stream of `container_id`.
    pub fn emit_stats(&self, container_id: &str, cpu_usage: u64, memory_usage: u64) {
        if let Some(sender) = self.stats.lock().unwrap().get(container_id) {
            let _ = sender.send(Ok(ContainerStats {
                cpu_usage,
                memory_usage,
            }));
        }
    }

    pub fn fail_stats(&self, container_id: &str) {
        if let Some(sender) = self.stats.lock().unwrap().get(container_id) {
            let _ = sender.send(Err(OrchestratorError::external("read stats stream", "mock failure")));
        }
    }

    async fn enter(&self, operation: &str, target: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{operation}:{target}"));
        let hold = self.holds.lock().unwrap().remove(operation);
        if let Some(hold) = hold {
            hold.notified().await;
        }
        if self.failing.lock().unwrap().contains(operation) {
            return Err(OrchestratorError::external(operation, "mock failure"));
        }
        Ok(())
    }

    fn set_state(&self, id: &str, state: &str) {
        if let Some(container) = self
            .containers
            .lock()
            .unwrap()
            .iter_mut()
            .find(|c| c.id == id)
        {
            container.state = state.to_string();
        }
        self.set_inspect(id, state, 0);
    }

    fn set_pod_status(&self, id: &str, status: &str) {
        if let Some(pod) = self.pods.lock().unwrap().iter_mut().find(|p| p.id == id) {
            pod.status = status.to_string();
        }
    }
}

#[async_trait]
impl ContainerEngine for MockContainerEngine {
    fn id(&self) -> &str {
        "podman"
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        self.enter("list_containers", "").await?;
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInspect> {
        self.enter("inspect_container", container_id).await?;
        self.inspects
            .lock()
            .unwrap()
            .get(container_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("container", container_id))
    }

    async fn create_container(&self, options: ContainerCreateOptions) -> Result<CreatedContainer> {
        self.enter("create_container", &options.image).await?;
        let id = format!("container-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let host_port = options.ports.first().and_then(|p| p.host_port);
        self.add_container(&id, options.labels.clone(), "created", host_port);
        if let Some(pod_id) = &options.pod {
            if let Some(pod) = self.pods.lock().unwrap().iter_mut().find(|p| &p.id == pod_id) {
                pod.containers.push(PodContainer {
                    id: id.clone(),
                    name: options.name.clone().unwrap_or_else(|| id.clone()),
                    status: "created".to_string(),
                });
            }
        }
        self.created.lock().unwrap().push(options);
        Ok(CreatedContainer {
            id,
            engine_id: "podman".to_string(),
        })
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.enter("start_container", container_id).await?;
        self.set_state(container_id, "running");
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.enter("stop_container", container_id).await?;
        self.set_state(container_id, "exited");
        Ok(())
    }

    async fn delete_container(&self, container_id: &str) -> Result<()> {
        self.enter("delete_container", container_id).await?;
        self.containers.lock().unwrap().retain(|c| c.id != container_id);
        self.inspects.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.enter("pull_image", image).await
    }

    async fn push_image(&self, image: &str) -> Result<()> {
        self.enter("push_image", image).await
    }

    async fn list_pods(&self) -> Result<Vec<PodSummary>> {
        self.enter("list_pods", "").await?;
        Ok(self.pods())
    }

    async fn create_pod(&self, options: PodCreateOptions) -> Result<String> {
        self.enter("create_pod", &options.name).await?;
        let id = format!("pod-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.pods.lock().unwrap().push(PodSummary {
            id: id.clone(),
            name: options.name,
            engine_id: "podman".to_string(),
            status: "Created".to_string(),
            labels: options.labels,
            containers: vec![],
        });
        Ok(id)
    }

    async fn start_pod(&self, pod_id: &str) -> Result<()> {
        self.enter("start_pod", pod_id).await?;
        self.set_pod_status(pod_id, "Running");
        let containers: Vec<String> = self
            .pods()
            .iter()
            .filter(|p| p.id == pod_id)
            .flat_map(|p| p.containers.iter().map(|c| c.id.clone()))
            .collect();
        for container in containers {
            self.set_inspect(&container, "running", 0);
        }
        Ok(())
    }

    async fn stop_pod(&self, pod_id: &str) -> Result<()> {
        self.enter("stop_pod", pod_id).await?;
        self.set_pod_status(pod_id, "Exited");
        Ok(())
    }

    async fn remove_pod(&self, pod_id: &str) -> Result<()> {
        self.enter("remove_pod", pod_id).await?;
        self.pods.lock().unwrap().retain(|p| p.id != pod_id);
        Ok(())
    }

    async fn events(&self) -> Result<BoxStream<'static, Result<EngineEvent>>> {
        self.enter("events", "").await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        for event in self.pending_events.lock().unwrap().drain(..) {
            let _ = sender.send(Ok(event));
        }
        *self.events.lock().unwrap() = Some(sender);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn stats_container(&self, container_id: &str) -> Result<BoxStream<'static, Result<ContainerStats>>> {
        self.enter("stats_container", container_id).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.stats.lock().unwrap().insert(container_id.to_string(), sender);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }
}

/// Mock Kubernetes API recording every object it receives
pub struct MockKubernetes {
    pub pods: Mutex<Vec<Pod>>,
    pub deleted: Mutex<Vec<String>>,
    pub pvcs: Mutex<Vec<PersistentVolumeClaim>>,
    pub services: Mutex<Vec<Service>>,
    pub deleted_services: Mutex<Vec<String>>,
    error_mode: Mutex<bool>,
    next_uid: AtomicUsize,
}

impl MockKubernetes {
    pub fn new() -> Self {
        Self {
            pods: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            pvcs: Mutex::new(Vec::new()),
            services: Mutex::new(Vec::new()),
            deleted_services: Mutex::new(Vec::new()),
            error_mode: Mutex::new(false),
            next_uid: AtomicUsize::new(1),
        }
    }

    pub fn set_error_mode(&self, enabled: bool) {
        *self.error_mode.lock().unwrap() = enabled;
    }

    fn check(&self, operation: &str) -> Result<()> {
        if *self.error_mode.lock().unwrap() {
            return Err(OrchestratorError::external(operation, "mock kubernetes failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl KubernetesApi for MockKubernetes {
    fn namespace(&self) -> &str {
        "default"
    }

    fn current_context(&self) -> String {
        "test-context".to_string()
    }

    async fn create_pod(&self, mut pod: Pod) -> Result<Pod> {
        self.check("create pod")?;
        let n = self.next_uid.fetch_add(1, Ordering::SeqCst);
        if pod.metadata.name.is_none() {
            let prefix = pod.metadata.generate_name.clone().unwrap_or_default();
            pod.metadata.name = Some(format!("{prefix}{n}"));
        }
        pod.metadata.uid = Some(format!("uid-{n}"));
        pod.metadata.namespace = Some("default".to_string());
        self.pods.lock().unwrap().push(pod.clone());
        Ok(pod)
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.check("delete pod")?;
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn list_pvcs(&self) -> Result<Vec<PersistentVolumeClaim>> {
        self.check("list persistent volume claims")?;
        Ok(self.pvcs.lock().unwrap().clone())
    }

    async fn create_pvc(&self, mut pvc: PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        self.check("create persistent volume claim")?;
        if pvc.metadata.name.is_none() {
            let n = self.next_uid.fetch_add(1, Ordering::SeqCst);
            let prefix = pvc.metadata.generate_name.clone().unwrap_or_default();
            pvc.metadata.name = Some(format!("{prefix}{n}"));
        }
        self.pvcs.lock().unwrap().push(pvc.clone());
        Ok(pvc)
    }

    async fn create_service(&self, mut service: Service) -> Result<Service> {
        self.check("create service")?;
        if service.metadata.name.is_none() {
            let n = self.next_uid.fetch_add(1, Ordering::SeqCst);
            let prefix = service.metadata.generate_name.clone().unwrap_or_default();
            service.metadata.name = Some(format!("{prefix}{n}"));
        }
        self.services.lock().unwrap().push(service.clone());
        Ok(service)
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        self.check("delete service")?;
        self.deleted_services.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

/// Port forwarder answering every connection with a fixed greeting
pub struct GreetingForwarder {
    pub forwards: AtomicUsize,
}

impl GreetingForwarder {
    pub fn new() -> Self {
        Self {
            forwards: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PortForwarder for GreetingForwarder {
    async fn forward(&self, target: &ForwardTarget, mut client: TcpStream) -> Result<()> {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        client
            .write_all(format!("hello from {}:{}", target.pod_name, target.port).as_bytes())
            .await
            .map_err(|e| OrchestratorError::external("forward", e))?;
        // keep the connection open until the proxy drops it
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// In-memory catalog, models and recipes
pub struct MockCatalog {
    recipes: Mutex<HashMap<String, Recipe>>,
    models: Mutex<HashMap<String, ModelInfo>>,
    on_disk: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<String>>,
    notifier: UpdateNotifier<()>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self {
            recipes: Mutex::new(HashMap::new()),
            models: Mutex::new(HashMap::new()),
            on_disk: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            notifier: UpdateNotifier::new(),
        }
    }

    pub fn add_model(&self, model: ModelInfo, on_disk: bool) {
        if on_disk {
            self.on_disk.lock().unwrap().insert(model.id.clone());
        }
        self.models.lock().unwrap().insert(model.id.clone(), model);
    }

    pub fn add_recipe(&self, recipe: Recipe) {
        self.recipes.lock().unwrap().insert(recipe.id.clone(), recipe);
    }

    pub fn fail_on(&self, operation: &str) {
        self.failing.lock().unwrap().insert(operation.to_string());
    }

    pub fn changed(&self) {
        self.notifier.notify(());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn enter(&self, operation: &str, target: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{operation}:{target}"));
        if self.failing.lock().unwrap().contains(operation) {
            return Err(OrchestratorError::external(operation, "mock failure"));
        }
        Ok(())
    }
}

impl CatalogManager for MockCatalog {
    fn get_recipe_by_id(&self, recipe_id: &str) -> Option<Recipe> {
        self.recipes.lock().unwrap().get(recipe_id).cloned()
    }

    fn get_model_by_id(&self, model_id: &str) -> Option<ModelInfo> {
        self.models.lock().unwrap().get(model_id).cloned()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<()> {
        self.notifier.subscribe()
    }
}

#[async_trait]
impl ModelsManager for MockCatalog {
    fn get_model_info(&self, model_id: &str) -> Option<ModelInfo> {
        self.get_model_by_id(model_id)
    }

    fn is_model_on_disk(&self, model_id: &str) -> bool {
        self.on_disk.lock().unwrap().contains(model_id)
    }

    async fn upload_model(&self, model: &ModelInfo, _labels: &Labels) -> Result<PathBuf> {
        self.enter("upload_model", &model.id)?;
        Ok(PathBuf::from(format!("/models/{}/{}.gguf", model.id, model.id)))
    }

    async fn request_download_model(&self, model: &ModelInfo, _labels: &Labels) -> Result<PathBuf> {
        self.enter("download_model", &model.id)?;
        self.on_disk.lock().unwrap().insert(model.id.clone());
        Ok(PathBuf::from(format!("/models/{}/{}.gguf", model.id, model.id)))
    }
}

#[async_trait]
impl RecipeManager for MockCatalog {
    async fn clone_recipe(&self, recipe: &Recipe, _labels: &Labels) -> Result<()> {
        self.enter("clone_recipe", &recipe.id)
    }

    async fn build_recipe(&self, recipe: &Recipe, _labels: &Labels) -> Result<Vec<RecipeImage>> {
        self.enter("build_recipe", &recipe.id)?;
        Ok(recipe
            .containers
            .iter()
            .map(|c| RecipeImage {
                id: format!("image-{}", c.name),
                name: c.image.clone(),
                app_name: c.name.clone(),
                ports: c.ports.clone(),
                model_service: c.model_service,
                recipe_id: recipe.id.clone(),
                engine_id: "podman".to_string(),
            })
            .collect())
    }
}

/// Model file helper used by provider tests.
pub fn uploaded_model(id: &str) -> ModelInfo {
    let mut model = model(id);
    model.file = Some(ModelFile {
        path: format!("/models/{id}"),
        file: format!("{id}.gguf"),
    });
    model
}
