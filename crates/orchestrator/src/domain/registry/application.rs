use std::sync::Arc;

use api_types::{ApplicationInfo, RuntimeType};
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::{ApplicationRuntime, OrchestratorError, Result, UpdateNotifier};

/// Every application runtime, addressed by runtime type.
pub struct ApplicationRegistry {
    engines: Vec<Arc<dyn ApplicationRuntime>>,
    notifier: UpdateNotifier<Vec<ApplicationInfo>>,
}

impl ApplicationRegistry {
    pub fn new(engines: Vec<Arc<dyn ApplicationRuntime>>) -> Self {
        Self {
            engines,
            notifier: UpdateNotifier::new(),
        }
    }

    pub fn applications(&self) -> Vec<ApplicationInfo> {
        let mut apps: Vec<_> = self
            .engines
            .iter()
            .flat_map(|e| e.application_infos())
            .collect();
        apps.sort_by(|a, b| {
            (a.runtime.to_string(), &a.recipe_id, &a.model_id).cmp(&(b.runtime.to_string(), &b.recipe_id, &b.model_id))
        });
        apps
    }

    pub fn engine(&self, runtime: RuntimeType) -> Result<Arc<dyn ApplicationRuntime>> {
        self.engines
            .iter()
            .find(|e| e.runtime() == runtime)
            .cloned()
            .ok_or_else(|| OrchestratorError::ProviderUnavailable {
                message: format!("no {runtime} application runtime configured"),
            })
    }

    /// Starts a recipe on `runtime` in the background; returns its tracking id.
    pub fn request_start(&self, runtime: RuntimeType, recipe_id: &str, model_id: &str) -> Result<String> {
        self.engine(runtime)?.request_start(recipe_id, model_id)
    }

    pub async fn remove_application(&self, runtime: RuntimeType, recipe_id: &str, model_id: &str) -> Result<()> {
        self.engine(runtime)?.remove_application(recipe_id, model_id).await
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<ApplicationInfo>> {
        self.notifier.subscribe()
    }

    pub fn init(&self) {
        for engine in &self.engines {
            info!(engine = engine.id(), runtime = %engine.runtime(), "Starting application runtime");
            engine.init();
        }
    }

    pub fn dispose(&self) {
        for engine in &self.engines {
            engine.dispose();
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut changes = stream::select_all(self.engines.iter().map(|e| e.changes()));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                change = changes.next() => match change {
                    Some(()) => self.notifier.notify(self.applications()),
                    None => break,
                },
            }
        }
        debug!("Application registry stopped");
    }
}
