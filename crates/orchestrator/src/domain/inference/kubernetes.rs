//! Inference servers running as pods, tracked through the pod informer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use api_types::{
    Connection, HealthSnapshot, InferenceServerInfo, InferenceServerStatus, Labels, ModelInfo,
    RuntimeType,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::inference_type_of;
use super::proxy::ProxyTable;
use crate::core::catalog::ModelsManager;
use crate::core::sync;
use crate::core::types::{K8S_ANNOTATION_MODEL, K8S_ANNOTATION_PORT, MODEL_SERVICE_PORT};
use crate::core::{
    EngineIdentity, InferenceCommands, InferenceServerConfig, OrchestratorError, Result,
    RuntimeEngine, RuntimeInstance, TaskRegistry, UpdateNotifier,
};
use crate::platform::k8s::{ForwardTarget, KubernetesApi, KubernetesPodRegistry, PodInformerEvent, PortForwarder};
use crate::platform::providers::{InferenceProvider, ProviderRegistry};

/// Where a server pod lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodDetails {
    pub pod_name: String,
    pub namespace: String,
    pub pod_uid: String,
}

pub type KubernetesInstance = RuntimeInstance<PodDetails>;

pub type PodProviders = ProviderRegistry<dyn InferenceProvider<Output = Pod>>;

/// Tracks inference server pods.
///
/// The server map follows the informer: every annotated pod is mirrored on
/// `Add`/`Update` and dropped on `Delete`. Each pod gets a local proxy on
/// the port recorded in its annotations.
pub struct KubernetesInferenceManager {
    inner: Arc<Inner>,
}

struct Inner {
    api: Arc<dyn KubernetesApi>,
    informer: Arc<KubernetesPodRegistry>,
    providers: PodProviders,
    models: Arc<dyn ModelsManager>,
    tasks: Arc<TaskRegistry>,
    proxies: ProxyTable,
    servers: RwLock<HashMap<String, KubernetesInstance>>,
    listening: AtomicBool,
    token: CancellationToken,
    notifier: UpdateNotifier<Vec<KubernetesInstance>>,
}

impl KubernetesInferenceManager {
    pub fn new(
        api: Arc<dyn KubernetesApi>,
        forwarder: Arc<dyn PortForwarder>,
        informer: Arc<KubernetesPodRegistry>,
        providers: PodProviders,
        models: Arc<dyn ModelsManager>,
        tasks: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                informer,
                providers,
                models,
                tasks,
                proxies: ProxyTable::new(forwarder),
                servers: RwLock::new(HashMap::new()),
                listening: AtomicBool::new(false),
                token: CancellationToken::new(),
                notifier: UpdateNotifier::new(),
            }),
        }
    }

    pub fn get(&self, id: &str) -> Option<KubernetesInstance> {
        sync::read(&self.inner.servers).get(id).cloned()
    }

    /// Local port of the proxy of a pod, if one runs.
    pub fn proxy_port(&self, uid: &str) -> Option<u16> {
        self.inner.proxies.local_port(uid)
    }

    pub fn proxy_count(&self) -> usize {
        self.inner.proxies.len()
    }

    #[cfg(test)]
    pub(crate) fn handle_event(&self, event: PodInformerEvent) {
        self.inner.handle_event(event);
    }
}

impl Inner {
    fn servers(&self) -> Vec<KubernetesInstance> {
        let mut servers: Vec<_> = sync::read(&self.servers).values().cloned().collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    fn notify(&self) {
        self.notifier.notify(self.servers());
    }

    fn handle_event(&self, event: PodInformerEvent) {
        match event {
            PodInformerEvent::Add(pod) | PodInformerEvent::Update(pod) => {
                if is_inference_pod(&pod) {
                    self.upsert(&pod);
                }
            }
            PodInformerEvent::Delete(pod) => {
                if !is_inference_pod(&pod) {
                    return;
                }
                let Some(uid) = pod.metadata.uid.as_deref() else {
                    return;
                };
                self.proxies.remove(uid);
                if sync::write(&self.servers).remove(uid).is_some() {
                    info!(%uid, "Inference server pod deleted");
                    self.notify();
                }
            }
            PodInformerEvent::Error(message) => warn!("Pod informer error: {message}"),
        }
    }

    /// Mirrors `pod` in the map and makes sure its proxy runs.
    fn upsert(&self, pod: &Pod) -> Option<KubernetesInstance> {
        let server = match self.to_instance(pod) {
            Ok(server) => server,
            Err(e) => {
                warn!(pod = ?pod.metadata.name, "Ignoring inference server pod: {e}");
                return None;
            }
        };

        if let Some(port) = server.connection.port {
            let target = ForwardTarget {
                namespace: server.details.namespace.clone(),
                pod_name: server.details.pod_name.clone(),
                port: MODEL_SERVICE_PORT,
            };
            if let Err(e) = self.proxies.ensure(&server.id, target, port) {
                warn!(pod = %server.details.pod_name, "Failed to start proxy: {e}");
            }
        }

        let changed = {
            let mut servers = sync::write(&self.servers);
            let changed = servers.get(&server.id) != Some(&server);
            servers.insert(server.id.clone(), server.clone());
            changed
        };
        if changed {
            debug!(uid = %server.id, status = %server.status, "Inference server pod updated");
            self.notify();
        }
        Some(server)
    }

    fn to_instance(&self, pod: &Pod) -> Result<KubernetesInstance> {
        let invalid = |message: &str| OrchestratorError::InvalidInput {
            message: message.to_string(),
        };
        let uid = pod.metadata.uid.clone().ok_or_else(|| invalid("pod has no uid"))?;
        let name = pod.metadata.name.clone().ok_or_else(|| invalid("pod has no name"))?;
        let annotations = pod.metadata.annotations.clone().unwrap_or_default();
        let model_id = annotations
            .get(K8S_ANNOTATION_MODEL)
            .ok_or_else(|| invalid("missing model annotation"))?;
        let port = annotations
            .get(K8S_ANNOTATION_PORT)
            .ok_or_else(|| invalid("missing port annotation"))?
            .parse::<u16>()
            .map_err(|e| invalid(&format!("malformed port annotation: {e}")))?;

        let models: Vec<ModelInfo> = self.models.get_model_info(model_id).into_iter().collect();
        Ok(RuntimeInstance {
            id: uid.clone(),
            runtime: RuntimeType::Kubernetes,
            status: pod_status(pod),
            health: pod_health(pod),
            inference_type: inference_type_of(&models),
            models,
            connection: Connection {
                host: "localhost".to_string(),
                port: Some(port),
            },
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            details: PodDetails {
                pod_name: name,
                namespace: pod
                    .metadata
                    .namespace
                    .clone()
                    .unwrap_or_else(|| self.api.namespace().to_string()),
                pod_uid: uid,
            },
        })
    }
}

fn is_inference_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(K8S_ANNOTATION_MODEL))
}

/// Server status of a pod. A pending deletion wins over the phase.
pub(crate) fn pod_status(pod: &Pod) -> InferenceServerStatus {
    if pod.metadata.deletion_timestamp.is_some() {
        return InferenceServerStatus::Deleting;
    }
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Pending") => InferenceServerStatus::Starting,
        Some("Running") => InferenceServerStatus::Running,
        Some("Succeeded") => InferenceServerStatus::Stopped,
        _ => InferenceServerStatus::Error,
    }
}

/// Health of a single-container pod; multi-container pods report none.
pub(crate) fn pod_health(pod: &Pod) -> Option<HealthSnapshot> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    let [container] = statuses.as_slice() else {
        return None;
    };
    let state = container.state.as_ref();
    let status = if state.and_then(|s| s.running.as_ref()).is_some() {
        if container.ready { "healthy" } else { "starting" }
    } else if state.and_then(|s| s.waiting.as_ref()).is_some() {
        "starting"
    } else {
        "unhealthy"
    };
    Some(HealthSnapshot {
        status: status.to_string(),
        failing_streak: u32::try_from(container.restart_count).unwrap_or_default(),
        log: Vec::new(),
    })
}

impl EngineIdentity for KubernetesInferenceManager {
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
            debug!("Kubernetes inference manager stopped listening");
        });
    }

    fn dispose(&self) {
        self.inner.token.cancel();
        self.inner.proxies.clear();
        sync::write(&self.inner.servers).clear();
    }
}

#[async_trait]
impl InferenceCommands for KubernetesInferenceManager {
    #[tracing::instrument(skip_all, fields(port = config.port))]
    async fn create_server(&self, config: InferenceServerConfig) -> Result<InferenceServerInfo> {
        let inference_type = inference_type_of(&config.models_info);
        let provider = self
            .inner
            .providers
            .select(config.provider_id.as_deref(), inference_type)?;
        let pod = provider.perform(&config).await.inspect_err(|e| {
            info!(target: "telemetry", event = "inference.start", error = %e, "usage error");
        })?;

        let server = self.inner.upsert(&pod).ok_or_else(|| {
            OrchestratorError::external("create inference server", "created pod is not an inference server")
        })?;
        let model_ids: Vec<&str> = config.models_info.iter().map(|m| m.id.as_str()).collect();
        info!(
            target: "telemetry",
            event = "inference.start",
            models = %model_ids.join(","),
            provider = provider.id(),
            "usage"
        );
        Ok(server.info())
    }

    async fn start_server(&self, _id: &str) -> Result<()> {
        Err(OrchestratorError::Unsupported {
            message: "kubernetes inference servers cannot be started".to_string(),
        })
    }

    async fn stop_server(&self, _id: &str) -> Result<()> {
        Err(OrchestratorError::Unsupported {
            message: "kubernetes inference servers cannot be stopped".to_string(),
        })
    }

    async fn remove_server(&self, id: &str) -> Result<()> {
        let server = {
            let mut servers = sync::write(&self.inner.servers);
            let server = servers
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::not_found("inference server", id))?;
            if server.status == InferenceServerStatus::Deleting {
                return Err(OrchestratorError::invalid_transition(
                    "cannot remove a server being deleted",
                ));
            }
            server.set_status(InferenceServerStatus::Deleting);
            server.clone()
        };
        self.inner.notify();

        let labels = Labels::from([("podName".to_string(), server.details.pod_name.clone())]);
        let result = self
            .inner
            .tasks
            .track(
                "Deleting inference server",
                labels,
                self.inner.api.delete_pod(&server.details.pod_name),
            )
            .await;
        if let Err(e) = result {
            if let Some(server) = sync::write(&self.inner.servers).get_mut(id) {
                server.set_status(InferenceServerStatus::Error);
            }
            self.inner.notify();
            return Err(e);
        }
        Ok(())
    }
}

impl RuntimeEngine for KubernetesInferenceManager {
    type Details = PodDetails;

    fn servers(&self) -> Vec<KubernetesInstance> {
        self.inner.servers()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<KubernetesInstance>> {
        self.inner.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStatus, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use k8s_openapi::chrono::Utc;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::platform::providers::{free_port, KubernetesLlamaCppProvider};
    use crate::testing::{model, GreetingForwarder, MockCatalog, MockKubernetes};

    fn manager() -> (KubernetesInferenceManager, Arc<MockKubernetes>) {
        let api = Arc::new(MockKubernetes::new());
        let tasks = Arc::new(TaskRegistry::new());
        let catalog = Arc::new(MockCatalog::new());
        catalog.add_model(model("granite"), false);
        let providers = ProviderRegistry::new(RuntimeType::Kubernetes).with(Arc::new(
            KubernetesLlamaCppProvider::new(api.clone(), tasks.clone()),
        ) as Arc<dyn InferenceProvider<Output = Pod>>);
        let manager = KubernetesInferenceManager::new(
            api.clone(),
            Arc::new(GreetingForwarder::new()),
            Arc::new(KubernetesPodRegistry::new()),
            providers,
            catalog,
            tasks,
        );
        (manager, api)
    }

    fn server_pod(uid: &str, port: u16, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("inference-server-{uid}")),
                namespace: Some("default".to_string()),
                uid: Some(uid.to_string()),
                annotations: Some(BTreeMap::from([
                    (K8S_ANNOTATION_MODEL.to_string(), "granite".to_string()),
                    (K8S_ANNOTATION_PORT.to_string(), port.to_string()),
                ])),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn container_status(name: &str, ready: bool) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            ready,
            restart_count: 2,
            state: Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn repeated_sightings_keep_one_proxy() {
        let (manager, _) = manager();
        let port = free_port().unwrap();
        let pod = server_pod("uid-1", port, "Pending");

        manager.handle_event(PodInformerEvent::Add(pod.clone()));
        manager.handle_event(PodInformerEvent::Update(pod.clone()));
        manager.handle_event(PodInformerEvent::Add(server_pod("uid-1", port, "Running")));

        assert_eq!(manager.proxy_count(), 1);
        assert_eq!(manager.proxy_port("uid-1"), Some(port));
        let server = manager.get("uid-1").unwrap();
        assert_eq!(server.status, InferenceServerStatus::Running);
        assert_eq!(server.connection.port, Some(port));
        assert_eq!(server.models, vec![model("granite")]);

        manager.handle_event(PodInformerEvent::Delete(pod));

        assert_eq!(manager.proxy_count(), 0);
        assert!(manager.servers().is_empty());
    }

    #[tokio::test]
    async fn unrelated_and_malformed_pods_are_ignored() {
        let (manager, _) = manager();
        let mut unrelated = server_pod("uid-1", 0, "Running");
        unrelated.metadata.annotations = None;
        let mut malformed = server_pod("uid-2", 0, "Running");
        malformed
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(K8S_ANNOTATION_PORT.to_string(), "not-a-port".to_string());

        manager.handle_event(PodInformerEvent::Add(unrelated));
        manager.handle_event(PodInformerEvent::Add(malformed));

        assert!(manager.servers().is_empty());
    }

    #[test]
    fn status_follows_phase_and_deletion() {
        assert_eq!(pod_status(&server_pod("u", 1, "Pending")), InferenceServerStatus::Starting);
        assert_eq!(pod_status(&server_pod("u", 1, "Running")), InferenceServerStatus::Running);
        assert_eq!(pod_status(&server_pod("u", 1, "Succeeded")), InferenceServerStatus::Stopped);
        assert_eq!(pod_status(&server_pod("u", 1, "Failed")), InferenceServerStatus::Error);

        let mut deleting = server_pod("u", 1, "Running");
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert_eq!(pod_status(&deleting), InferenceServerStatus::Deleting);
    }

    #[test]
    fn health_needs_exactly_one_container() {
        let mut pod = server_pod("u", 1, "Running");
        assert_eq!(pod_health(&pod), None);

        pod.status.as_mut().unwrap().container_statuses = Some(vec![container_status("server", true)]);
        let health = pod_health(&pod).unwrap();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.failing_streak, 2);

        pod.status.as_mut().unwrap().container_statuses = Some(vec![
            container_status("server", true),
            container_status("sidecar", false),
        ]);
        assert_eq!(pod_health(&pod), None);
    }

    #[tokio::test]
    async fn start_and_stop_are_unsupported() {
        let (manager, _) = manager();
        let port = free_port().unwrap();
        manager.handle_event(PodInformerEvent::Add(server_pod("uid-1", port, "Running")));

        for result in [
            manager.start_server("uid-1").await,
            manager.stop_server("uid-1").await,
            manager.start_server("missing").await,
        ] {
            assert!(matches!(result, Err(OrchestratorError::Unsupported { .. })));
        }
    }

    #[tokio::test]
    async fn created_pods_are_tracked_immediately() {
        let (manager, api) = manager();
        let port = free_port().unwrap();

        let info = manager
            .create_server(InferenceServerConfig {
                port,
                models_info: vec![model("granite")],
                provider_id: None,
                image: None,
                labels: Labels::new(),
                gpu: false,
            })
            .await
            .unwrap();

        assert_eq!(info.runtime, RuntimeType::Kubernetes);
        assert_eq!(info.connection.port, Some(port));
        assert_eq!(manager.servers().len(), 1);
        assert_eq!(manager.proxy_count(), 1);
        assert_eq!(api.pods.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_deletes_the_pod() {
        let (manager, api) = manager();
        let port = free_port().unwrap();
        manager.handle_event(PodInformerEvent::Add(server_pod("uid-1", port, "Running")));

        manager.remove_server("uid-1").await.unwrap();

        assert_eq!(manager.get("uid-1").unwrap().status, InferenceServerStatus::Deleting);
        assert_eq!(api.deleted.lock().unwrap().clone(), vec!["inference-server-uid-1".to_string()]);
        let again = manager.remove_server("uid-1").await;
        assert!(matches!(again, Err(OrchestratorError::InvalidTransition { .. })));
    }
}
