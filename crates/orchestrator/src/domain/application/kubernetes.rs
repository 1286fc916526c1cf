//! Recipe applications running as cluster pods, tracked through the pod informer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use api_types::{ApplicationStatus, Labels, ModelInfo, PodHealth, RuntimeType};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utils::keyed_lock::KeyedAsyncLock;

use super::{resolve, spawn_tracked_start, with_pair_labels, TASK_LABEL_MODEL_ID};
use crate::core::catalog::{CatalogManager, ModelsManager, Recipe, RecipeManager};
use crate::core::sync;
use crate::core::types::{
    K8S_ANNOTATION_LOCAL_PORT, K8S_ANNOTATION_MODEL_POD, K8S_ANNOTATION_MODEL_SERVICE,
    POD_LABEL_MODEL_ID, POD_LABEL_RECIPE_ID,
};
use crate::core::{
    ApplicationCommands, ApplicationRuntimeEngine, ApplicationState, EngineIdentity,
    OrchestratorError, Result, TaskRegistry, UpdateNotifier,
};
use crate::domain::inference::kubernetes::PodDetails;
use crate::domain::inference::proxy::ProxyTable;
use crate::platform::k8s::{ForwardTarget, KubernetesApi, KubernetesPodRegistry, PodInformerEvent, PortForwarder};
use crate::platform::providers::{ApplicationConfig, ApplicationProvider};

/// Where an application pod lives, with the model resources started for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationPodDetails {
    pub pod: PodDetails,
    pub model_pod: Option<String>,
    pub model_service: Option<String>,
}

pub type KubernetesApplication = ApplicationState<ApplicationPodDetails>;

/// Tracks recipe application pods on the cluster, keyed by pod uid.
///
/// The map follows the informer; the application port of each pod is proxied
/// on the local port recorded in its annotations.
pub struct KubernetesApplicationManager {
    inner: Arc<Inner>,
}

struct Inner {
    api: Arc<dyn KubernetesApi>,
    informer: Arc<KubernetesPodRegistry>,
    provider: Arc<dyn ApplicationProvider<Output = Pod>>,
    catalog: Arc<dyn CatalogManager>,
    models: Arc<dyn ModelsManager>,
    recipes: Arc<dyn RecipeManager>,
    tasks: Arc<TaskRegistry>,
    pairs: KeyedAsyncLock<(String, String)>,
    proxies: ProxyTable,
    applications: RwLock<HashMap<String, KubernetesApplication>>,
    listening: AtomicBool,
    token: CancellationToken,
    notifier: UpdateNotifier<Vec<KubernetesApplication>>,
}

impl KubernetesApplicationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn KubernetesApi>,
        forwarder: Arc<dyn PortForwarder>,
        informer: Arc<KubernetesPodRegistry>,
        provider: Arc<dyn ApplicationProvider<Output = Pod>>,
        catalog: Arc<dyn CatalogManager>,
        models: Arc<dyn ModelsManager>,
        recipes: Arc<dyn RecipeManager>,
        tasks: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                informer,
                provider,
                catalog,
                models,
                recipes,
                tasks,
                pairs: KeyedAsyncLock::new(),
                proxies: ProxyTable::new(forwarder),
                applications: RwLock::new(HashMap::new()),
                listening: AtomicBool::new(false),
                token: CancellationToken::new(),
                notifier: UpdateNotifier::new(),
            }),
        }
    }

    pub fn get(&self, uid: &str) -> Option<KubernetesApplication> {
        sync::read(&self.inner.applications).get(uid).cloned()
    }

    pub fn proxy_count(&self) -> usize {
        self.inner.proxies.len()
    }

    pub async fn start_recipe(&self, recipe: &Recipe, model: &ModelInfo, labels: &Labels) -> Result<()> {
        self.inner.start_recipe(recipe, model, labels).await
    }

    #[cfg(test)]
    pub(crate) fn handle_event(&self, event: PodInformerEvent) {
        self.inner.handle_event(event);
    }
}

impl Inner {
    fn applications(&self) -> Vec<KubernetesApplication> {
        let mut apps: Vec<_> = sync::read(&self.applications).values().cloned().collect();
        apps.sort_by_key(|app| app.key());
        apps
    }

    fn notify(&self) {
        self.notifier.notify(self.applications());
    }

    /// Live application of a pair. Pods already terminating are not returned.
    fn find(&self, recipe_id: &str, model_id: &str) -> Option<KubernetesApplication> {
        sync::read(&self.applications)
            .values()
            .find(|app| {
                app.recipe_id == recipe_id
                    && app.model_id == model_id
                    && app.status != ApplicationStatus::Deleting
            })
            .cloned()
    }

    #[tracing::instrument(skip_all, fields(recipe_id = %recipe.id, model_id = %model.id))]
    async fn start_recipe(&self, recipe: &Recipe, model: &ModelInfo, labels: &Labels) -> Result<()> {
        let _pair = self.pairs.lock(&(recipe.id.clone(), model.id.clone())).await;
        let pair = with_pair_labels(labels, &recipe.id, &model.id);

        let mut clone_labels = labels.clone();
        clone_labels.insert(TASK_LABEL_MODEL_ID.to_string(), model.id.clone());
        self.recipes.clone_recipe(recipe, &clone_labels).await?;
        let model_path = self.models.request_download_model(model, &pair).await?;
        let images = self.recipes.build_recipe(recipe, &pair).await?;

        if self.find(&recipe.id, &model.id).is_some() {
            info!("Replacing the existing pod of the application");
            self.remove_application(&recipe.id, &model.id).await?;
        }

        let pod = self
            .provider
            .perform(&ApplicationConfig {
                recipe: recipe.clone(),
                model: model.clone(),
                images,
                model_path,
                labels: pair,
            })
            .await
            .inspect_err(|e| {
                error!(target: "telemetry", event = "recipe.pull", recipe.id = %recipe.id, error = %e, "error pulling application");
            })?;
        self.upsert(&pod);
        info!(target: "telemetry", event = "recipe.pull", recipe.id = %recipe.id, recipe.name = %recipe.name, "usage");
        Ok(())
    }

    async fn remove_application(&self, recipe_id: &str, model_id: &str) -> Result<()> {
        let app = {
            let mut applications = sync::write(&self.applications);
            let mut pair = applications
                .values_mut()
                .filter(|app| app.recipe_id == recipe_id && app.model_id == model_id)
                .peekable();
            if pair.peek().is_none() {
                return Err(OrchestratorError::not_found("application", format!("{recipe_id}/{model_id}")));
            }
            let Some(app) = pair.find(|app| app.status != ApplicationStatus::Deleting) else {
                return Err(OrchestratorError::invalid_transition(
                    "cannot remove an application being deleted",
                ));
            };
            app.status = ApplicationStatus::Deleting;
            app.health = PodHealth::None;
            app.clone()
        };
        self.notify();

        let result = self
            .tasks
            .track(
                "Removing AI App",
                with_pair_labels(&Labels::new(), recipe_id, model_id),
                self.delete_resources(&app.details),
            )
            .await;
        if let Err(e) = result {
            if let Some(app) = sync::write(&self.applications).get_mut(&app.details.pod.pod_uid) {
                app.status = ApplicationStatus::Error;
            }
            self.notify();
            return Err(e);
        }
        Ok(())
    }

    /// Deletes the application pod, then the model service and model pod
    /// started with it.
    async fn delete_resources(&self, details: &ApplicationPodDetails) -> Result<()> {
        self.api.delete_pod(&details.pod.pod_name).await?;
        if let Some(service) = &details.model_service {
            self.api.delete_service(service).await?;
        }
        if let Some(model_pod) = &details.model_pod {
            self.api.delete_pod(model_pod).await?;
        }
        Ok(())
    }

    fn handle_event(&self, event: PodInformerEvent) {
        match event {
            PodInformerEvent::Add(pod) | PodInformerEvent::Update(pod) => {
                if is_application_pod(&pod) {
                    self.upsert(&pod);
                }
            }
            PodInformerEvent::Delete(pod) => {
                if !is_application_pod(&pod) {
                    return;
                }
                let Some(uid) = pod.metadata.uid.as_deref() else {
                    return;
                };
                self.proxies.remove(uid);
                if sync::write(&self.applications).remove(uid).is_some() {
                    info!(%uid, "Application pod deleted");
                    self.notify();
                }
            }
            PodInformerEvent::Error(message) => warn!("Pod informer error: {message}"),
        }
    }

    fn upsert(&self, pod: &Pod) {
        let app = match self.to_application(pod) {
            Ok(app) => app,
            Err(e) => {
                warn!(pod = ?pod.metadata.name, "Ignoring application pod: {e}");
                return;
            }
        };

        if let (Some(&local_port), Some(port)) = (app.app_ports.first(), application_port(pod)) {
            let target = ForwardTarget {
                namespace: app.details.pod.namespace.clone(),
                pod_name: app.details.pod.pod_name.clone(),
                port,
            };
            if let Err(e) = self.proxies.ensure(&app.details.pod.pod_uid, target, local_port) {
                warn!(pod = %app.details.pod.pod_name, "Failed to start proxy: {e}");
            }
        }

        let changed = {
            let mut applications = sync::write(&self.applications);
            let changed = applications.get(&app.details.pod.pod_uid) != Some(&app);
            applications.insert(app.details.pod.pod_uid.clone(), app.clone());
            changed
        };
        if changed {
            debug!(uid = %app.details.pod.pod_uid, status = ?app.status, "Application pod updated");
            self.notify();
        }
    }

    fn to_application(&self, pod: &Pod) -> Result<KubernetesApplication> {
        let invalid = |message: &str| OrchestratorError::InvalidInput {
            message: message.to_string(),
        };
        let uid = pod.metadata.uid.clone().ok_or_else(|| invalid("pod has no uid"))?;
        let name = pod.metadata.name.clone().ok_or_else(|| invalid("pod has no name"))?;
        let annotations = pod.metadata.annotations.clone().unwrap_or_default();
        let recipe_id = annotations
            .get(POD_LABEL_RECIPE_ID)
            .ok_or_else(|| invalid("missing recipe annotation"))?;
        let model_id = annotations
            .get(POD_LABEL_MODEL_ID)
            .ok_or_else(|| invalid("missing model annotation"))?;
        let app_ports = match annotations.get(K8S_ANNOTATION_LOCAL_PORT) {
            Some(port) => vec![port
                .parse::<u16>()
                .map_err(|e| invalid(&format!("malformed local port annotation: {e}")))?],
            None => Vec::new(),
        };

        Ok(ApplicationState {
            recipe_id: recipe_id.clone(),
            model_id: model_id.clone(),
            runtime: RuntimeType::Kubernetes,
            status: application_status(pod),
            health: application_health(pod),
            app_ports,
            model_ports: Vec::new(),
            details: ApplicationPodDetails {
                pod: PodDetails {
                    pod_name: name,
                    namespace: pod
                        .metadata
                        .namespace
                        .clone()
                        .unwrap_or_else(|| self.api.namespace().to_string()),
                    pod_uid: uid,
                },
                model_pod: annotations.get(K8S_ANNOTATION_MODEL_POD).cloned(),
                model_service: annotations.get(K8S_ANNOTATION_MODEL_SERVICE).cloned(),
            },
        })
    }
}

fn is_application_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(POD_LABEL_RECIPE_ID))
}

/// First port declared by the application containers.
fn application_port(pod: &Pod) -> Option<u16> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .find_map(|p| u16::try_from(p.container_port).ok())
}

fn application_status(pod: &Pod) -> ApplicationStatus {
    if pod.metadata.deletion_timestamp.is_some() {
        return ApplicationStatus::Deleting;
    }
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Pending") => ApplicationStatus::Starting,
        Some("Running") => ApplicationStatus::Running,
        Some("Succeeded") => ApplicationStatus::Stopped,
        _ => ApplicationStatus::Error,
    }
}

/// Health of a pod from the states of its containers.
fn application_health(pod: &Pod) -> PodHealth {
    let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) else {
        return PodHealth::None;
    };
    if statuses.is_empty() {
        return PodHealth::None;
    }
    let mut starting = false;
    for status in statuses {
        let state = status.state.as_ref();
        if state.and_then(|s| s.running.as_ref()).is_some() {
            starting |= !status.ready;
        } else if state.and_then(|s| s.waiting.as_ref()).is_some() {
            starting = true;
        } else {
            return PodHealth::Unhealthy;
        }
    }
    if starting {
        PodHealth::Starting
    } else {
        PodHealth::Healthy
    }
}

impl EngineIdentity for KubernetesApplicationManager {
    fn id(&self) -> &str {
        "kubernetes"
    }

    fn runtime(&self) -> RuntimeType {
        RuntimeType::Kubernetes
    }

    fn init(&self) {
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut events = self.inner.informer.subscribe();
        for pod in self.inner.informer.pods() {
            self.inner.handle_event(PodInformerEvent::Add(pod));
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => inner.handle_event(event),
                        None => break,
                    },
                }
            }
            debug!("Kubernetes application manager stopped listening");
        });
    }

    fn dispose(&self) {
        self.inner.token.cancel();
        self.inner.proxies.clear();
        sync::write(&self.inner.applications).clear();
    }
}

#[async_trait]
impl ApplicationCommands for KubernetesApplicationManager {
    fn request_start(&self, recipe_id: &str, model_id: &str) -> Result<String> {
        let (recipe, model) = resolve(self.inner.catalog.as_ref(), recipe_id, model_id)?;
        let inner = Arc::clone(&self.inner);
        let pipeline_recipe = recipe.clone();
        Ok(spawn_tracked_start(&self.inner.tasks, &recipe, move |labels| async move {
            inner.start_recipe(&pipeline_recipe, &model, &labels).await
        }))
    }

    async fn remove_application(&self, recipe_id: &str, model_id: &str) -> Result<()> {
        self.inner.remove_application(recipe_id, model_id).await
    }
}

impl ApplicationRuntimeEngine for KubernetesApplicationManager {
    type Details = ApplicationPodDetails;

    fn applications(&self) -> Vec<KubernetesApplication> {
        self.inner.applications()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<KubernetesApplication>> {
        self.inner.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{
        Container, ContainerPort, ContainerState, ContainerStateRunning, ContainerStateTerminated,
        ContainerStatus, PodSpec, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use k8s_openapi::chrono::Utc;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::platform::providers::{free_port, KubernetesApplicationProvider, KubernetesLlamaCppProvider};
    use crate::testing::{eventually, model, recipe, GreetingForwarder, MockCatalog, MockKubernetes};

    fn manager() -> (KubernetesApplicationManager, Arc<MockKubernetes>, Arc<TaskRegistry>) {
        let api = Arc::new(MockKubernetes::new());
        let tasks = Arc::new(TaskRegistry::new());
        let catalog = Arc::new(MockCatalog::new());
        catalog.add_model(model("granite"), true);
        catalog.add_recipe(recipe("chatbot"));
        let model_provider = Arc::new(KubernetesLlamaCppProvider::new(api.clone(), tasks.clone()));
        let provider = Arc::new(KubernetesApplicationProvider::new(api.clone(), None, model_provider, tasks.clone()));
        let manager = KubernetesApplicationManager::new(
            api.clone(),
            Arc::new(GreetingForwarder::new()),
            Arc::new(KubernetesPodRegistry::new()),
            provider,
            catalog.clone(),
            catalog.clone(),
            catalog,
            tasks.clone(),
        );
        (manager, api, tasks)
    }

    fn app_pod(uid: &str, local_port: u16, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("chatbot-{uid}")),
                namespace: Some("default".to_string()),
                uid: Some(uid.to_string()),
                annotations: Some(BTreeMap::from([
                    (POD_LABEL_RECIPE_ID.to_string(), "chatbot".to_string()),
                    (POD_LABEL_MODEL_ID.to_string(), "granite".to_string()),
                    (K8S_ANNOTATION_LOCAL_PORT.to_string(), local_port.to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "chatbot-app".to_string(),
                    ports: Some(vec![ContainerPort {
                        container_port: 8501,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn with_model_resources(mut pod: Pod) -> Pod {
        let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(K8S_ANNOTATION_MODEL_POD.to_string(), "inference-server-7".to_string());
        annotations.insert(K8S_ANNOTATION_MODEL_SERVICE.to_string(), "ai-lab-model-8".to_string());
        pod
    }

    fn created_app_pods(api: &MockKubernetes) -> Vec<Pod> {
        api.pods
            .lock()
            .unwrap()
            .iter()
            .filter(|pod| is_application_pod(pod))
            .cloned()
            .collect()
    }

    fn running(ready: bool) -> ContainerStatus {
        ContainerStatus {
            ready,
            state: Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn informer_events_drive_the_map() {
        let (manager, _, _) = manager();
        let port = free_port().unwrap();
        let pod = app_pod("uid-1", port, "Pending");

        manager.handle_event(PodInformerEvent::Add(pod.clone()));
        manager.handle_event(PodInformerEvent::Update(app_pod("uid-1", port, "Running")));

        assert_eq!(manager.proxy_count(), 1);
        let app = manager.get("uid-1").unwrap();
        assert_eq!(app.key(), "chatbot:granite");
        assert_eq!(app.status, ApplicationStatus::Running);
        assert_eq!(app.app_ports, vec![port]);

        manager.handle_event(PodInformerEvent::Delete(pod));

        assert_eq!(manager.proxy_count(), 0);
        assert!(manager.applications().is_empty());
    }

    #[test]
    fn health_follows_container_states() {
        let mut pod = app_pod("uid-1", 1, "Running");
        assert_eq!(application_health(&pod), PodHealth::None);

        let status = pod.status.as_mut().unwrap();
        status.container_statuses = Some(vec![running(true), running(true)]);
        assert_eq!(application_health(&pod), PodHealth::Healthy);

        pod.status.as_mut().unwrap().container_statuses = Some(vec![running(true), running(false)]);
        assert_eq!(application_health(&pod), PodHealth::Starting);

        let terminated = ContainerStatus {
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated::default()),
                ..Default::default()
            }),
            ..Default::default()
        };
        pod.status.as_mut().unwrap().container_statuses = Some(vec![running(false), terminated]);
        assert_eq!(application_health(&pod), PodHealth::Unhealthy);
    }

    #[tokio::test]
    async fn request_start_creates_the_application_pod() {
        let (manager, api, tasks) = manager();

        let tracking_id = manager.request_start("chatbot", "granite").unwrap();

        assert!(eventually(|| manager.applications().len() == 1).await);
        // model server pod plus application pod
        assert_eq!(api.pods.lock().unwrap().len(), 2);
        assert_eq!(api.services.lock().unwrap().len(), 1);
        let master = Labels::from([("trackingId".to_string(), tracking_id)]);
        assert!(eventually(|| tasks
            .get_tasks_by_labels(&master)
            .iter()
            .any(|t| t.state == api_types::TaskState::Success))
        .await);
        manager.dispose();
    }

    #[tokio::test]
    async fn remove_deletes_the_pod_once() {
        let (manager, api, _) = manager();
        manager.handle_event(PodInformerEvent::Add(app_pod("uid-1", free_port().unwrap(), "Running")));

        manager.remove_application("chatbot", "granite").await.unwrap();

        assert_eq!(manager.get("uid-1").unwrap().status, ApplicationStatus::Deleting);
        assert_eq!(api.deleted.lock().unwrap().clone(), vec!["chatbot-uid-1".to_string()]);
        assert!(matches!(
            manager.remove_application("chatbot", "granite").await,
            Err(OrchestratorError::InvalidTransition { .. })
        ));
        assert!(matches!(
            manager.stop_application("chatbot", "granite").await,
            Err(OrchestratorError::Unsupported { .. })
        ));
        manager.dispose();
    }

    #[tokio::test]
    async fn remove_deletes_the_model_resources_too() {
        let (manager, api, _) = manager();
        let pod = with_model_resources(app_pod("uid-1", free_port().unwrap(), "Running"));
        manager.handle_event(PodInformerEvent::Add(pod));

        manager.remove_application("chatbot", "granite").await.unwrap();

        assert_eq!(
            api.deleted.lock().unwrap().clone(),
            vec!["chatbot-uid-1".to_string(), "inference-server-7".to_string()]
        );
        assert_eq!(api.deleted_services.lock().unwrap().clone(), vec!["ai-lab-model-8".to_string()]);
        manager.dispose();
    }

    #[tokio::test]
    async fn starting_a_running_pair_replaces_all_its_resources() {
        let (manager, api, _) = manager();
        let pod = with_model_resources(app_pod("uid-1", free_port().unwrap(), "Running"));
        manager.handle_event(PodInformerEvent::Add(pod));

        manager
            .start_recipe(&recipe("chatbot"), &model("granite"), &Labels::new())
            .await
            .unwrap();

        assert_eq!(
            api.deleted.lock().unwrap().clone(),
            vec!["chatbot-uid-1".to_string(), "inference-server-7".to_string()]
        );
        assert_eq!(api.deleted_services.lock().unwrap().clone(), vec!["ai-lab-model-8".to_string()]);
        let created = created_app_pods(&api);
        assert_eq!(created.len(), 1);
        let uid = created[0].metadata.uid.clone().unwrap();
        assert!(manager.get(&uid).is_some());
        assert_eq!(manager.get("uid-1").unwrap().status, ApplicationStatus::Deleting);
        manager.dispose();
    }

    #[tokio::test]
    async fn starting_a_pair_whose_pod_is_terminating_creates_a_new_pod() {
        let (manager, api, _) = manager();
        let mut pod = app_pod("uid-1", free_port().unwrap(), "Running");
        pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
        manager.handle_event(PodInformerEvent::Add(pod));
        assert_eq!(manager.get("uid-1").unwrap().status, ApplicationStatus::Deleting);

        manager
            .start_recipe(&recipe("chatbot"), &model("granite"), &Labels::new())
            .await
            .unwrap();

        assert!(api.deleted.lock().unwrap().is_empty());
        assert_eq!(created_app_pods(&api).len(), 1);
        assert_eq!(manager.applications().len(), 2);
        // removal now targets the replacement
        manager.remove_application("chatbot", "granite").await.unwrap();
        assert_eq!(api.deleted.lock().unwrap().first(), created_app_pods(&api)[0].metadata.name.as_ref());
        manager.dispose();
    }

    #[tokio::test]
    async fn failed_deletion_marks_the_application_in_error() {
        let (manager, api, _) = manager();
        manager.handle_event(PodInformerEvent::Add(app_pod("uid-1", free_port().unwrap(), "Running")));
        api.set_error_mode(true);

        let result = manager.remove_application("chatbot", "granite").await;

        assert!(result.is_err());
        assert_eq!(manager.get("uid-1").unwrap().status, ApplicationStatus::Error);
        manager.dispose();
    }
}
