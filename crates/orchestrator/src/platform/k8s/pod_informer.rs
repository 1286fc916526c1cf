use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, watcher, Config};
use kube::Api;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::types::{KubernetesError, PodInformerEvent};
use super::{KubeCluster, KubernetesApi};
use crate::core::sync;
use crate::core::types::{K8S_CREATOR_LABEL, K8S_CREATOR_VALUE};
use crate::core::UpdateNotifier;

/// Informer over the pods created by this orchestrator.
///
/// Subscribers receive `Add`/`Update`/`Delete` per pod and `Error` when the
/// watch fails. The watch restarts after failures and whenever the
/// kubeconfig changes; pods that vanished in between are reported deleted.
pub struct KubernetesPodRegistry {
    notifier: UpdateNotifier<PodInformerEvent>,
    known: Mutex<HashMap<String, Pod>>,
}

impl KubernetesPodRegistry {
    pub fn new() -> Self {
        Self {
            notifier: UpdateNotifier::new(),
            known: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PodInformerEvent> {
        self.notifier.subscribe()
    }

    /// Pods currently known to the informer.
    pub fn pods(&self) -> Vec<Pod> {
        sync::lock(&self.known).values().cloned().collect()
    }

    /// Runs the informer until cancelled.
    #[tracing::instrument(skip_all, fields(namespace = %cluster.namespace()))]
    pub async fn run(
        self: Arc<Self>,
        cluster: Arc<KubeCluster>,
        mut kubeconfig_changes: mpsc::UnboundedReceiver<()>,
        cancellation_token: CancellationToken,
    ) {
        info!("Starting pod informer");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Pod informer shutdown requested");
                    break;
                }
                Some(()) = kubeconfig_changes.recv() => {
                    info!("Kubeconfig changed, restarting pod informer");
                    if let Err(e) = cluster.reload().await {
                        error!("Failed to reload Kubernetes client: {e:?}");
                        self.notifier.notify(PodInformerEvent::Error(e.current_context().to_string()));
                    }
                }
                result = self.watch_pods(&cluster) => {
                    match result {
                        Ok(()) => {
                            warn!("Pod watch stream ended unexpectedly, restarting...");
                        }
                        Err(e) => {
                            error!("Pod watch failed: {e:?}");
                            self.notifier.notify(PodInformerEvent::Error(e.current_context().to_string()));
                            select! {
                                _ = cancellation_token.cancelled() => break,
                                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    async fn watch_pods(&self, cluster: &KubeCluster) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = Api::namespaced(cluster.client(), cluster.namespace());
        let config = Config::default().labels(&format!("{K8S_CREATOR_LABEL}={K8S_CREATOR_VALUE}"));
        let mut stream = watcher(api, config).boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.handle_event(event),
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        message: format!("Watch stream error: {e}"),
                    }));
                }
            }
        }
        Ok(())
    }

    /// Folds one watcher event into the known set and publishes the result.
    pub(crate) fn handle_event(&self, event: watcher::Event<Pod>) {
        let events = {
            let mut known = sync::lock(&self.known);
            diff_event(&mut known, event)
        };
        for event in events {
            self.notifier.notify(event);
        }
    }
}

impl Default for KubernetesPodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn uid_of(pod: &Pod) -> Option<String> {
    pod.metadata.uid.clone()
}

fn diff_event(known: &mut HashMap<String, Pod>, event: watcher::Event<Pod>) -> Vec<PodInformerEvent> {
    match event {
        watcher::Event::Applied(pod) => applied(known, pod).into_iter().collect(),
        watcher::Event::Deleted(pod) => {
            if let Some(uid) = uid_of(&pod) {
                known.remove(&uid);
            }
            vec![PodInformerEvent::Delete(pod)]
        }
        watcher::Event::Restarted(pods) => {
            let mut seen = Vec::with_capacity(pods.len());
            let mut events = Vec::new();
            for pod in pods {
                if let Some(uid) = uid_of(&pod) {
                    seen.push(uid);
                }
                events.extend(applied(known, pod));
            }
            let vanished: Vec<String> = known
                .keys()
                .filter(|uid| !seen.contains(uid))
                .cloned()
                .collect();
            for uid in vanished {
                if let Some(pod) = known.remove(&uid) {
                    events.push(PodInformerEvent::Delete(pod));
                }
            }
            events
        }
    }
}

fn applied(known: &mut HashMap<String, Pod>, pod: Pod) -> Option<PodInformerEvent> {
    let Some(uid) = uid_of(&pod) else {
        warn!(pod = ?pod.metadata.name, "Ignoring pod without uid");
        return None;
    };
    match known.insert(uid, pod.clone()) {
        Some(_) => Some(PodInformerEvent::Update(pod)),
        None => Some(PodInformerEvent::Add(pod)),
    }
}
