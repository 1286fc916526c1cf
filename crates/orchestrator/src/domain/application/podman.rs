//! Recipe applications running as pods on the local engine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use api_types::{ApplicationStatus, Labels, ModelInfo, PodHealth, RuntimeType, TaskState};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utils::keyed_lock::KeyedAsyncLock;

use super::{pair_labels, resolve, spawn_tracked_start, with_pair_labels, TASK_LABEL_MODEL_ID};
use crate::core::catalog::{CatalogManager, ModelsManager, Recipe, RecipeManager};
use crate::core::sync;
use crate::core::types::{POD_LABEL_APP_PORTS, POD_LABEL_MODEL_ID, POD_LABEL_MODEL_PORTS, POD_LABEL_RECIPE_ID};
use crate::core::{
    ApplicationCommands, ApplicationRuntimeEngine, ApplicationState, EngineIdentity,
    OrchestratorError, ReconcileConfig, Result, TaskRegistry, UpdateNotifier,
};
use crate::platform::container::events::PodEvent;
use crate::platform::container::{
    ContainerEngine, ContainerEventRegistry, MachineStatus, PodStatus, PodSummary,
};
use crate::platform::providers::podman_application::{parse_ports, ApplicationPod};
use crate::platform::providers::{ApplicationConfig, ApplicationProvider};

pub type PodmanApplication = ApplicationState<PodSummary>;

pub type PodProvider = Arc<dyn ApplicationProvider<Output = ApplicationPod>>;

/// Tracks recipe application pods, keyed by pod id.
///
/// Pods labelled with a recipe are adopted when the engine connects and
/// whenever one starts; a health tick refreshes status and container
/// health. At most one pod exists per recipe/model pair.
pub struct PodmanApplicationManager {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<dyn ContainerEngine>,
    events: Arc<ContainerEventRegistry>,
    provider: PodProvider,
    catalog: Arc<dyn CatalogManager>,
    models: Arc<dyn ModelsManager>,
    recipes: Arc<dyn RecipeManager>,
    tasks: Arc<TaskRegistry>,
    config: ReconcileConfig,
    pairs: KeyedAsyncLock<(String, String)>,
    applications: RwLock<HashMap<String, PodmanApplication>>,
    /// Pods this manager is removing; their removal is not reported as manual
    protected: Mutex<HashSet<String>>,
    listening: AtomicBool,
    token: CancellationToken,
    notifier: UpdateNotifier<Vec<PodmanApplication>>,
}

impl PodmanApplicationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        events: Arc<ContainerEventRegistry>,
        provider: PodProvider,
        catalog: Arc<dyn CatalogManager>,
        models: Arc<dyn ModelsManager>,
        recipes: Arc<dyn RecipeManager>,
        tasks: Arc<TaskRegistry>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                events,
                provider,
                catalog,
                models,
                recipes,
                tasks,
                config,
                pairs: KeyedAsyncLock::new(),
                applications: RwLock::new(HashMap::new()),
                protected: Mutex::new(HashSet::new()),
                listening: AtomicBool::new(false),
                token: CancellationToken::new(),
                notifier: UpdateNotifier::new(),
            }),
        }
    }

    /// Runs the whole start pipeline of a recipe and waits for it.
    pub async fn start_recipe(&self, recipe: &Recipe, model: &ModelInfo, labels: &Labels) -> Result<()> {
        Inner::start_recipe(&self.inner, recipe, model, labels).await
    }

    /// Host ports of the application containers of the pod `application_id`.
    pub fn get_application_ports(&self, application_id: &str) -> Result<Vec<u16>> {
        sync::read(&self.inner.applications)
            .get(application_id)
            .map(|app| app.app_ports.clone())
            .ok_or_else(|| OrchestratorError::not_found("application", application_id))
    }

    pub async fn get_application_pod(&self, recipe_id: &str, model_id: &str) -> Result<PodSummary> {
        self.inner.get_application_pod(recipe_id, model_id).await
    }

    /// Re-reads every tracked pod and publishes the result if anything changed.
    pub async fn check_pods_health(&self) -> Result<()> {
        self.inner.check_pods_health().await
    }
}

impl Inner {
    fn applications(&self) -> Vec<PodmanApplication> {
        let mut apps: Vec<_> = sync::read(&self.applications).values().cloned().collect();
        apps.sort_by_key(|app| app.key());
        apps
    }

    fn notify(&self) {
        self.notifier.notify(self.applications());
    }

    fn clear_tasks(&self, recipe_id: &str, model_id: &str) {
        self.tasks.delete_by_labels(&pair_labels(recipe_id, model_id));
    }

    #[tracing::instrument(skip_all, fields(recipe_id = %recipe.id, model_id = %model.id))]
    async fn start_recipe(self: &Arc<Self>, recipe: &Recipe, model: &ModelInfo, labels: &Labels) -> Result<()> {
        self.clear_tasks(&recipe.id, &model.id);
        let started = Instant::now();
        let result = async {
            let _pair = self.pairs.lock(&(recipe.id.clone(), model.id.clone())).await;
            let pod = self.init_application(recipe, model, labels).await?;
            self.run_application(&pod.pod_id, &with_pair_labels(labels, &recipe.id, &model.id))
                .await
        }
        .await;

        let duration_seconds = started.elapsed().as_secs_f64();
        match &result {
            Ok(()) => info!(
                target: "telemetry",
                event = "recipe.pull",
                recipe.id = %recipe.id,
                recipe.name = %recipe.name,
                duration_seconds,
                "usage"
            ),
            Err(e) => error!(
                target: "telemetry",
                event = "recipe.pull",
                recipe.id = %recipe.id,
                recipe.name = %recipe.name,
                duration_seconds,
                error = %e,
                "error pulling application"
            ),
        }
        result
    }

    /// Clones, downloads, builds and uploads, then creates the pod of the
    /// pair, replacing any existing one.
    async fn init_application(&self, recipe: &Recipe, model: &ModelInfo, labels: &Labels) -> Result<ApplicationPod> {
        let pair = with_pair_labels(labels, &recipe.id, &model.id);

        let mut clone_labels = labels.clone();
        clone_labels.insert(TASK_LABEL_MODEL_ID.to_string(), model.id.clone());
        self.recipes.clone_recipe(recipe, &clone_labels).await?;
        self.models.request_download_model(model, &pair).await?;
        let images = self.recipes.build_recipe(recipe, &pair).await?;
        let model_path = self.models.upload_model(model, &pair).await?;

        if self.find_pod(&recipe.id, &model.id).await?.is_some() {
            info!("Replacing the existing pod of the application");
            self.remove_application(&recipe.id, &model.id).await?;
        }

        self.provider
            .perform(&ApplicationConfig {
                recipe: recipe.clone(),
                model: model.clone(),
                images,
                model_path,
                labels: pair,
            })
            .await
    }

    /// Starts the pod and waits until each of its containers runs.
    async fn run_application(&self, pod_id: &str, labels: &Labels) -> Result<()> {
        let mut task = self
            .tasks
            .create_task("Starting AI App", TaskState::Loading, labels.clone());
        let result = async {
            self.engine.start_pod(pod_id).await?;
            let pod = self
                .engine
                .list_pods()
                .await?
                .into_iter()
                .find(|p| p.id == pod_id)
                .ok_or_else(|| OrchestratorError::not_found("pod", pod_id))?;
            for container in &pod.containers {
                self.wait_container_running(&container.id).await?;
            }
            Ok::<_, OrchestratorError>(pod)
        }
        .await;

        match result {
            Ok(pod) => {
                task.name = "AI App is running".to_string();
                self.tasks.succeed(&mut task);
                self.adopt(&pod);
                self.check_pods_health().await
            }
            Err(e) => {
                self.tasks.fail(&mut task, &e);
                Err(e)
            }
        }
    }

    async fn wait_container_running(&self, container_id: &str) -> Result<()> {
        let interval = self.config.container_wait_interval;
        let timeout = self.config.container_wait_timeout;
        let attempts = (timeout.as_millis() / interval.as_millis().max(1)).max(1);
        for _ in 0..attempts {
            if self.engine.inspect_container(container_id).await?.running {
                return Ok(());
            }
            tokio::time::sleep(interval).await;
        }
        Err(OrchestratorError::TimeoutExceeded {
            operation: format!("waiting for container {container_id} to run"),
            seconds: timeout.as_secs(),
        })
    }

    async fn find_pod(&self, recipe_id: &str, model_id: &str) -> Result<Option<PodSummary>> {
        Ok(self.engine.list_pods().await?.into_iter().find(|pod| {
            pod.labels.get(POD_LABEL_RECIPE_ID).map(String::as_str) == Some(recipe_id)
                && pod.labels.get(POD_LABEL_MODEL_ID).map(String::as_str) == Some(model_id)
        }))
    }

    async fn get_application_pod(&self, recipe_id: &str, model_id: &str) -> Result<PodSummary> {
        self.find_pod(recipe_id, model_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("application pod", format!("{recipe_id}/{model_id}")))
    }

    async fn stop_pod_application(&self, recipe_id: &str, model_id: &str) -> Result<PodSummary> {
        self.clear_tasks(recipe_id, model_id);
        let pod = self.get_application_pod(recipe_id, model_id).await?;
        if pod.status.eq_ignore_ascii_case("exited") {
            return Ok(pod);
        }

        let mut task = self
            .tasks
            .create_task("Stopping AI App", TaskState::Loading, pair_labels(recipe_id, model_id));
        let result = self.engine.stop_pod(&pod.id).await;
        match &result {
            Ok(()) => {
                task.name = "AI App Stopped".to_string();
                self.tasks.succeed(&mut task);
            }
            Err(e) => {
                task.name = "Error stopping AI App".to_string();
                self.tasks.fail(&mut task, format!("Error stopping the pod: {e}"));
            }
        }
        if let Err(e) = self.check_pods_health().await {
            warn!("Failed to refresh application health: {e}");
        }
        result.map(|()| pod)
    }

    async fn remove_application(&self, recipe_id: &str, model_id: &str) -> Result<()> {
        let pod = self.stop_pod_application(recipe_id, model_id).await?;

        let mut task = self
            .tasks
            .create_task("Removing AI App", TaskState::Loading, pair_labels(recipe_id, model_id));
        sync::lock(&self.protected).insert(pod.id.clone());
        match self.engine.remove_pod(&pod.id).await {
            Ok(()) => {
                task.name = "AI App Removed".to_string();
                self.tasks.succeed(&mut task);
                self.forget(&pod.id);
                Ok(())
            }
            Err(e) => {
                sync::lock(&self.protected).remove(&pod.id);
                task.name = "Error stopping AI App".to_string();
                self.tasks.fail(
                    &mut task,
                    "error removing the pod. Please try to remove the pod manually",
                );
                Err(e)
            }
        }
    }

    /// Tracks a recipe pod not seen before.
    fn adopt(&self, pod: &PodSummary) {
        let (Some(recipe_id), Some(model_id)) = (
            pod.labels.get(POD_LABEL_RECIPE_ID),
            pod.labels.get(POD_LABEL_MODEL_ID),
        ) else {
            return;
        };
        let state = ApplicationState {
            recipe_id: recipe_id.clone(),
            model_id: model_id.clone(),
            runtime: RuntimeType::Podman,
            status: application_status(&pod.status),
            health: PodHealth::Starting,
            app_ports: parse_ports(pod.labels.get(POD_LABEL_APP_PORTS)),
            model_ports: parse_ports(pod.labels.get(POD_LABEL_MODEL_PORTS)),
            details: pod.clone(),
        };
        {
            let mut applications = sync::write(&self.applications);
            if applications.contains_key(&pod.id) {
                return;
            }
            applications.insert(pod.id.clone(), state);
        }
        info!(pod_id = %pod.id, %recipe_id, %model_id, "Application pod adopted");
        self.notify();
    }

    /// Drops a removed pod. Removals this manager did not ask for are
    /// reported through a task.
    fn forget(&self, pod_id: &str) {
        let Some(app) = sync::write(&self.applications).remove(pod_id) else {
            return;
        };
        self.notify();

        let protected = sync::lock(&self.protected).remove(pod_id);
        if !protected {
            info!(%pod_id, "Application pod removed outside of the orchestrator");
            self.tasks.create_task(
                "AI App stopped manually",
                TaskState::Success,
                pair_labels(&app.recipe_id, &app.model_id),
            );
        }
    }

    async fn adopt_existing(&self) -> Result<()> {
        for pod in self.engine.list_pods().await? {
            if pod.labels.contains_key(POD_LABEL_RECIPE_ID) {
                self.adopt(&pod);
            }
        }
        Ok(())
    }

    async fn on_pod_event(&self, event: PodEvent) {
        match event.status {
            PodStatus::Start => match self.engine.list_pods().await {
                Ok(pods) => {
                    if let Some(pod) = pods.iter().find(|p| p.id == event.id) {
                        self.adopt(pod);
                    }
                }
                Err(e) => warn!(pod_id = %event.id, "Failed to list pods: {e}"),
            },
            PodStatus::Remove => self.forget(&event.id),
            PodStatus::Stop => {}
        }
    }

    fn on_machine_stopped(&self) {
        let apps: Vec<PodmanApplication> = sync::write(&self.applications).drain().map(|(_, app)| app).collect();
        for app in &apps {
            self.tasks.create_task(
                "AI App stopped manually",
                TaskState::Success,
                Labels::from([("application-id".to_string(), app.key())]),
            );
        }
        info!(count = apps.len(), "Container machine stopped, applications cleared");
        self.notify();
    }

    async fn check_pods_health(&self) -> Result<()> {
        let pods = self.engine.list_pods().await?;
        let mut updates = Vec::new();
        for pod in pods
            .into_iter()
            .filter(|p| p.labels.contains_key(POD_LABEL_RECIPE_ID) && p.labels.contains_key(POD_LABEL_MODEL_ID))
        {
            if !sync::read(&self.applications).contains_key(&pod.id) {
                continue;
            }
            let health = self.pod_health(&pod).await;
            updates.push((pod, health));
        }

        let changed = {
            let mut applications = sync::write(&self.applications);
            let mut changed = false;
            for (pod, health) in updates {
                let Some(app) = applications.get_mut(&pod.id) else {
                    continue;
                };
                if app.health != health || app.details.status != pod.status {
                    app.health = health;
                    app.status = application_status(&pod.status);
                    app.details = pod;
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.notify();
        }
        Ok(())
    }

    async fn pod_health(&self, pod: &PodSummary) -> PodHealth {
        let mut statuses = Vec::new();
        for container in &pod.containers {
            match self.engine.inspect_container(&container.id).await {
                Ok(inspect) => statuses.extend(inspect.health.map(|h| h.status)),
                Err(e) => debug!(container_id = %container.id, "Cannot inspect application container: {e}"),
            }
        }
        aggregate_health(&statuses)
    }

    fn spawn_listeners(self: &Arc<Self>) {
        let mut pods = self.events.on_pod_event();
        let mut machine = self.events.on_machine_event();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.adopt_existing().await {
                error!("Failed to adopt existing application pods: {e}");
            }
            loop {
                tokio::select! {
                    _ = inner.token.cancelled() => break,
                    Some(event) = pods.recv() => inner.on_pod_event(event).await,
                    Some(status) = machine.recv() => match status {
                        MachineStatus::Stopped => inner.on_machine_stopped(),
                        MachineStatus::Started => {
                            if let Err(e) = inner.adopt_existing().await {
                                error!("Failed to adopt existing application pods: {e}");
                            }
                        }
                    },
                    else => break,
                }
            }
        });

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut delay = inner.config.health_first_tick;
            loop {
                tokio::select! {
                    _ = inner.token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if let Err(e) = inner.check_pods_health().await {
                    warn!("Failed to check application pods: {e}");
                }
                delay = inner.config.health_interval;
            }
        });
    }
}

fn application_status(pod_status: &str) -> ApplicationStatus {
    match pod_status.to_ascii_lowercase().as_str() {
        "running" => ApplicationStatus::Running,
        "created" => ApplicationStatus::Starting,
        "exited" | "stopped" => ApplicationStatus::Stopped,
        _ => ApplicationStatus::Error,
    }
}

/// Health of a pod from the health of its containers.
fn aggregate_health(statuses: &[String]) -> PodHealth {
    if statuses.is_empty() {
        PodHealth::None
    } else if statuses.iter().any(|s| s == "unhealthy") {
        PodHealth::Unhealthy
    } else if statuses.iter().any(|s| s == "starting") {
        PodHealth::Starting
    } else {
        PodHealth::Healthy
    }
}

impl EngineIdentity for PodmanApplicationManager {
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
    }

    fn dispose(&self) {
        self.inner.token.cancel();
    }
}

#[async_trait]
impl ApplicationCommands for PodmanApplicationManager {
    fn request_start(&self, recipe_id: &str, model_id: &str) -> Result<String> {
        let (recipe, model) = resolve(self.inner.catalog.as_ref(), recipe_id, model_id)?;
        let inner = Arc::clone(&self.inner);
        let pipeline_recipe = recipe.clone();
        Ok(spawn_tracked_start(&self.inner.tasks, &recipe, move |labels| async move {
            Inner::start_recipe(&inner, &pipeline_recipe, &model, &labels).await
        }))
    }

    async fn remove_application(&self, recipe_id: &str, model_id: &str) -> Result<()> {
        self.inner.remove_application(recipe_id, model_id).await
    }

    async fn stop_application(&self, recipe_id: &str, model_id: &str) -> Result<()> {
        self.inner.stop_pod_application(recipe_id, model_id).await.map(|_| ())
    }

    async fn start_application(&self, recipe_id: &str, model_id: &str) -> Result<()> {
        self.inner.clear_tasks(recipe_id, model_id);
        let pod = self.inner.get_application_pod(recipe_id, model_id).await?;
        self.inner
            .run_application(&pod.id, &pair_labels(recipe_id, model_id))
            .await
    }

    async fn restart_application(&self, recipe_id: &str, model_id: &str) -> Result<()> {
        let pod = self.inner.get_application_pod(recipe_id, model_id).await?;
        self.inner.remove_application(recipe_id, model_id).await?;
        let model_id = pod.labels.get(POD_LABEL_MODEL_ID).map_or(model_id, String::as_str);
        let (recipe, model) = resolve(self.inner.catalog.as_ref(), recipe_id, model_id)?;

        let _pair = self.inner.pairs.lock(&(recipe.id.clone(), model.id.clone())).await;
        let created = self.inner.init_application(&recipe, &model, &Labels::new()).await?;
        self.inner
            .run_application(&created.pod_id, &pair_labels(&recipe.id, &model.id))
            .await
    }
}

impl ApplicationRuntimeEngine for PodmanApplicationManager {
    type Details = PodSummary;

    fn applications(&self) -> Vec<PodmanApplication> {
        self.inner.applications()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<PodmanApplication>> {
        self.inner.notifier.subscribe()
    }
}
