use anyhow::Result;
use api_types::TaskState;
use tracing::{error, info, warn};

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;

/// The orchestrator daemon: its runtime engines and the arguments they were
/// built from.
pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs) -> Self {
        Self {
            services,
            daemon_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Serves until a shutdown signal arrives or a background task ends.
    ///
    /// The engines subscribe to their event sources before the pumps start
    /// and are disposed on every way out.
    pub async fn run(&self) -> Result<()> {
        info!(
            podman = self.services.podman.is_some(),
            kubernetes = self.services.kubernetes.is_some(),
            listen_addr = %self.daemon_args.listen_addr,
            "Starting orchestrator"
        );
        self.services.init();

        let mut tasks = Tasks::new();
        let result = match tasks.spawn_all_tasks(self) {
            Ok(()) => tasks.wait_for_completion().await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            error!("Orchestrator stopped on error: {e:#}");
        }

        self.shutdown();
        result
    }

    fn shutdown(&self) {
        info!("Disposing runtime engines");
        self.services.dispose();

        let interrupted = self
            .services
            .tasks
            .get_tasks()
            .into_iter()
            .filter(|task| task.state == TaskState::Loading)
            .count();
        if interrupted > 0 {
            warn!(interrupted, "Tracked tasks left unfinished by the shutdown");
        }
        info!("Orchestrator stopped");
    }
}
