//! HTTP API of the orchestrator
//!
//! # API Endpoints
//!
//! - `GET /api/v1/inference-servers`, `POST /api/v1/inference-servers`
//! - `POST /api/v1/inference-servers/:id/start`, `POST /api/v1/inference-servers/:id/stop`
//! - `DELETE /api/v1/inference-servers/:id`
//! - `GET /api/v1/applications`, `POST /api/v1/applications`
//! - `DELETE /api/v1/applications/:runtime/:recipe_id/:model_id`
//! - `GET /api/v1/tasks`
//! - `GET /api/v1/instructlab/sessions`, `POST /api/v1/instructlab/sessions`
//! - `POST /api/v1/instructlab/sessions/:uid/generate|fine-tune|abort`
//! - `GET /api/v1/monitoring`, `POST|DELETE /api/v1/monitoring/:container_id`
//! - `GET /api/v1/events` - server-sent events, one per snapshot change
//!
//! Every JSON answer is an [`ApiResponse`](api_types::ApiResponse) envelope.
//! Requests that start long-running work answer with a tracking id right
//! away; the matching tasks carry it as their `trackingId` label.

use std::sync::Arc;

use api_types::StateUpdate;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub mod errors;
pub mod handlers;
pub mod server;

pub use errors::ApiError;

use crate::app::ApplicationServices;
use crate::core::catalog::CatalogManager;
use crate::core::TaskRegistry;
use crate::domain::instructlab::InstructLabManager;
use crate::domain::monitoring::MonitoringManager;
use crate::domain::registry::{ApplicationRegistry, InferenceServerRegistry};

/// What the handlers act on.
pub struct ApiState {
    pub catalog: Arc<dyn CatalogManager>,
    pub tasks: Arc<TaskRegistry>,
    pub inference: Arc<InferenceServerRegistry>,
    pub applications: Arc<ApplicationRegistry>,
    /// Only available with the Podman runtime
    pub instructlab: Option<Arc<InstructLabManager>>,
    /// Only available with the Podman runtime
    pub monitoring: Option<Arc<MonitoringManager>>,
}

impl ApiState {
    pub fn from_services(services: &ApplicationServices) -> Arc<Self> {
        Arc::new(Self {
            catalog: services.catalog.clone(),
            tasks: services.tasks.clone(),
            inference: services.inference.clone(),
            applications: services.applications.clone(),
            instructlab: services.instructlab(),
            monitoring: services.monitoring(),
        })
    }

    /// Current snapshots.
    pub fn snapshots(&self) -> Vec<StateUpdate> {
        let mut snapshots = vec![
            StateUpdate::InferenceServers(self.inference.servers()),
            StateUpdate::Applications(self.applications.applications()),
            StateUpdate::Tasks(self.tasks.get_tasks()),
        ];
        if let Some(instructlab) = &self.instructlab {
            snapshots.push(StateUpdate::InstructlabSessions(instructlab.sessions().sessions()));
        }
        if let Some(monitoring) = &self.monitoring {
            snapshots.push(StateUpdate::Monitoring(monitoring.stats()));
        }
        snapshots
    }

    /// The current snapshots followed by every later change. Dropping the
    /// stream unsubscribes.
    pub fn updates(&self) -> BoxStream<'static, StateUpdate> {
        let mut changes: Vec<BoxStream<'static, StateUpdate>> = vec![
            UnboundedReceiverStream::new(self.inference.subscribe())
                .map(StateUpdate::InferenceServers)
                .boxed(),
            UnboundedReceiverStream::new(self.applications.subscribe())
                .map(StateUpdate::Applications)
                .boxed(),
            UnboundedReceiverStream::new(self.tasks.subscribe())
                .map(StateUpdate::Tasks)
                .boxed(),
        ];
        if let Some(instructlab) = &self.instructlab {
            changes.push(
                UnboundedReceiverStream::new(instructlab.sessions().subscribe())
                    .map(StateUpdate::InstructlabSessions)
                    .boxed(),
            );
        }
        if let Some(monitoring) = &self.monitoring {
            changes.push(
                UnboundedReceiverStream::new(monitoring.subscribe())
                    .map(StateUpdate::Monitoring)
                    .boxed(),
            );
        }
        stream::iter(self.snapshots())
            .chain(stream::select_all(changes))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use api_types::TaskState;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testing::{labels, MockCatalog};

    fn state() -> ApiState {
        ApiState {
            catalog: Arc::new(MockCatalog::new()),
            tasks: Arc::new(TaskRegistry::new()),
            inference: Arc::new(InferenceServerRegistry::new(vec![])),
            applications: Arc::new(ApplicationRegistry::new(vec![])),
            instructlab: None,
            monitoring: None,
        }
    }

    #[tokio::test]
    async fn updates_start_with_the_current_snapshots() {
        let state = state();
        state.tasks.create_task("Pulling model", TaskState::Loading, labels(&[]));
        let mut updates = state.updates();

        let names: Vec<_> = updates
            .by_ref()
            .take(3)
            .map(|u| u.event_name())
            .collect()
            .await;
        assert_eq!(names, vec!["inference-servers", "applications", "tasks"]);

        state.tasks.create_task("Building recipe", TaskState::Loading, labels(&[]));
        let next = tokio::time::timeout(Duration::from_secs(2), updates.next())
            .await
            .unwrap()
            .unwrap();
        let StateUpdate::Tasks(tasks) = next else {
            panic!("expected a task snapshot, got {next:?}");
        };
        assert_eq!(tasks.len(), 2);
    }
}
