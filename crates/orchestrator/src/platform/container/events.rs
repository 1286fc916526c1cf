use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ContainerEngine, ContainerStatus, EngineEvent, MachineStatus, PodStatus};
use crate::core::sync;
use crate::core::UpdateNotifier;

/// A container lifecycle event as seen by global listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub id: String,
    pub status: ContainerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEvent {
    pub id: String,
    pub status: PodStatus,
}

/// Re-publishes the container engine event stream.
///
/// Global listeners receive container `start` and `die` events, pod events
/// and machine connectivity changes. Per-container subscribers receive every
/// status of their container; they are dropped once the container is removed.
pub struct ContainerEventRegistry {
    started: UpdateNotifier<ContainerEvent>,
    died: UpdateNotifier<ContainerEvent>,
    pods: UpdateNotifier<PodEvent>,
    machine: UpdateNotifier<MachineStatus>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<ContainerStatus>>>>,
    reconnect_delay: Duration,
}

impl ContainerEventRegistry {
    pub fn new() -> Self {
        Self::with_reconnect_delay(Duration::from_secs(5))
    }

    pub fn with_reconnect_delay(reconnect_delay: Duration) -> Self {
        Self {
            started: UpdateNotifier::new(),
            died: UpdateNotifier::new(),
            pods: UpdateNotifier::new(),
            machine: UpdateNotifier::new(),
            subscribers: Mutex::new(HashMap::new()),
            reconnect_delay,
        }
    }

    /// Events of one container. Dropping the receiver unsubscribes.
    pub fn subscribe(&self, container_id: &str) -> mpsc::UnboundedReceiver<ContainerStatus> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subscribers = sync::lock(&self.subscribers);
        Self::prune(&mut subscribers);
        subscribers
            .entry(container_id.to_string())
            .or_default()
            .push(sender);
        receiver
    }

    /// Containers with at least one live subscriber.
    pub fn watched_containers(&self) -> Vec<String> {
        let mut subscribers = sync::lock(&self.subscribers);
        Self::prune(&mut subscribers);
        let mut ids: Vec<String> = subscribers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drops the senders whose receiver is gone, for every container.
    fn prune(subscribers: &mut HashMap<String, Vec<mpsc::UnboundedSender<ContainerStatus>>>) {
        subscribers.retain(|_, senders| {
            senders.retain(|sender| !sender.is_closed());
            !senders.is_empty()
        });
    }

    pub fn on_start_container_event(&self) -> mpsc::UnboundedReceiver<ContainerEvent> {
        self.started.subscribe()
    }

    pub fn on_die_container_event(&self) -> mpsc::UnboundedReceiver<ContainerEvent> {
        self.died.subscribe()
    }

    pub fn on_pod_event(&self) -> mpsc::UnboundedReceiver<PodEvent> {
        self.pods.subscribe()
    }

    pub fn on_machine_event(&self) -> mpsc::UnboundedReceiver<MachineStatus> {
        self.machine.subscribe()
    }

    /// Routes one engine event to its listeners.
    pub fn dispatch(&self, event: EngineEvent) {
        match event {
            EngineEvent::Container { id, status } => self.dispatch_container(id, status),
            EngineEvent::Pod { id, status } => self.pods.notify(PodEvent { id, status }),
            EngineEvent::Machine(status) => {
                info!(?status, "Container engine connectivity changed");
                self.machine.notify(status);
            }
        }
    }

    fn dispatch_container(&self, id: String, status: ContainerStatus) {
        match status {
            ContainerStatus::Start => self.started.notify(ContainerEvent {
                id: id.clone(),
                status: status.clone(),
            }),
            ContainerStatus::Die => self.died.notify(ContainerEvent {
                id: id.clone(),
                status: status.clone(),
            }),
            _ => {}
        }

        let mut subscribers = sync::lock(&self.subscribers);
        if let Some(senders) = subscribers.get_mut(&id) {
            senders.retain(|sender| sender.send(status.clone()).is_ok());
        }
        if status == ContainerStatus::Remove && subscribers.remove(&id).is_some() {
            debug!(container_id = %id, "Container removed, dropping its subscribers");
        }
        // watchers of other containers may have gone away meanwhile
        Self::prune(&mut subscribers);
    }

    /// Pumps the engine event stream until cancelled, reconnecting when the
    /// connection drops. Losing and regaining the connection is published as
    /// machine `Stopped` / `Started`.
    #[tracing::instrument(skip_all, fields(engine_id = %engine.id()))]
    pub async fn run(self: Arc<Self>, engine: Arc<dyn ContainerEngine>, token: CancellationToken) {
        info!("Starting container event pump");
        let mut connected = false;
        let mut lost_connection = false;
        loop {
            let stream = tokio::select! {
                _ = token.cancelled() => break,
                stream = engine.events() => stream,
            };
            match stream {
                Ok(mut stream) => {
                    if lost_connection {
                        self.dispatch(EngineEvent::Machine(MachineStatus::Started));
                        lost_connection = false;
                    }
                    connected = true;
                    loop {
                        let next = tokio::select! {
                            _ = token.cancelled() => {
                                info!("Container event pump shutdown requested");
                                return;
                            }
                            next = stream.next() => next,
                        };
                        match next {
                            Some(Ok(event)) => self.dispatch(event),
                            Some(Err(e)) => {
                                warn!("Container event stream failed: {e}");
                                break;
                            }
                            None => {
                                warn!("Container event stream ended, reconnecting");
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("Failed to open container event stream: {e}"),
            }

            if connected && !lost_connection {
                lost_connection = true;
                self.dispatch(EngineEvent::Machine(MachineStatus::Stopped));
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        info!("Container event pump completed");
    }
}

impl Default for ContainerEventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testing::MockContainerEngine;

    fn container(id: &str, status: ContainerStatus) -> EngineEvent {
        EngineEvent::Container {
            id: id.to_string(),
            status,
        }
    }

    #[tokio::test]
    async fn start_and_die_reach_global_listeners() {
        let registry = ContainerEventRegistry::new();
        let mut started = registry.on_start_container_event();
        let mut died = registry.on_die_container_event();

        registry.dispatch(container("c1", ContainerStatus::Start));
        registry.dispatch(container("c1", ContainerStatus::Stop));
        registry.dispatch(container("c1", ContainerStatus::Die));

        assert_eq!(started.recv().await.unwrap().id, "c1");
        assert_eq!(died.recv().await.unwrap().status, ContainerStatus::Die);
        assert!(started.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_container_subscribers_get_every_status_until_remove() {
        let registry = ContainerEventRegistry::new();
        let mut events = registry.subscribe("c1");
        let mut other = registry.subscribe("c2");

        registry.dispatch(container("c1", ContainerStatus::Die));
        registry.dispatch(container("c1", ContainerStatus::Remove));
        registry.dispatch(container("c1", ContainerStatus::Start));

        assert_eq!(events.recv().await, Some(ContainerStatus::Die));
        assert_eq!(events.recv().await, Some(ContainerStatus::Remove));
        // the subscriber entry is gone after remove
        assert_eq!(events.recv().await, None);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned_without_events_for_their_container() {
        let registry = ContainerEventRegistry::new();
        let kept = registry.subscribe("c1");
        drop(registry.subscribe("c2"));
        drop(registry.subscribe("c3"));

        assert_eq!(registry.watched_containers(), vec!["c1".to_string()]);

        // c1 dies and is removed: nothing is left behind
        registry.dispatch(container("c1", ContainerStatus::Die));
        registry.dispatch(container("c1", ContainerStatus::Remove));
        assert!(registry.watched_containers().is_empty());
        drop(kept);
    }

    #[tokio::test]
    async fn pump_reports_machine_restarts() {
        let engine = Arc::new(MockContainerEngine::new());
        let registry = Arc::new(ContainerEventRegistry::with_reconnect_delay(
            Duration::from_millis(10),
        ));
        let mut machine = registry.on_machine_event();
        let mut started = registry.on_start_container_event();
        let token = CancellationToken::new();

        let pump = tokio::spawn(registry.clone().run(engine.clone(), token.clone()));

        engine.emit(container("c1", ContainerStatus::Start));
        assert_eq!(started.recv().await.unwrap().id, "c1");

        engine.disconnect_events();
        assert_eq!(machine.recv().await, Some(MachineStatus::Stopped));
        assert_eq!(machine.recv().await, Some(MachineStatus::Started));

        token.cancel();
        pump.await.unwrap();
    }
}
