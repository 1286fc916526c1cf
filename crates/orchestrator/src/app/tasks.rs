use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::server::ApiServer;
use crate::api::ApiState;
use crate::app::core::Application;
use crate::infrastructure::kubeconfig::watch_kubeconfig;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let registries_task = self.spawn_registries_task(app);
        self.tasks.push(registries_task);

        let catalog_task = self.spawn_catalog_watcher_task(app);
        self.tasks.push(catalog_task);

        if app.services().podman.is_some() {
            let events_task = self.spawn_container_events_task(app);
            self.tasks.extend(events_task);
        }

        if app.services().kubernetes.is_some() {
            let informer_task = self.spawn_pod_informer_task(app);
            self.tasks.extend(informer_task);
        }

        let api_server_task = self.spawn_api_server_task(app);
        self.tasks.push(api_server_task);

        Ok(())
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_registries_task(&self, app: &Application) -> JoinHandle<()> {
        let inference = app.services().inference.clone();
        let applications = app.services().applications.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting registry update task");
            tokio::join!(inference.run(token.clone()), applications.run(token));
            tracing::info!("Registry update task completed");
        })
    }

    fn spawn_catalog_watcher_task(&self, app: &Application) -> JoinHandle<()> {
        let catalog = app.services().catalog.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting catalog watcher task");
            if let Err(e) = catalog.watch(token.clone()).await {
                tracing::error!("Catalog watcher failed: {e}");
                // Without a watcher the catalog is still served as loaded.
                token.cancelled().await;
            }
            tracing::info!("Catalog watcher task completed");
        })
    }

    fn spawn_container_events_task(&self, app: &Application) -> Option<JoinHandle<()>> {
        let podman = app.services().podman.as_ref()?;
        let events = podman.events.clone();
        let engine = podman.engine.clone();
        let token = self.cancellation_token.clone();

        Some(tokio::spawn(async move {
            tracing::info!("Starting container event task");
            events.run(engine, token).await;
            tracing::info!("Container event task completed");
        }))
    }

    fn spawn_pod_informer_task(&self, app: &Application) -> Option<JoinHandle<()>> {
        let kubernetes = app.services().kubernetes.as_ref()?;
        let informer = kubernetes.informer.clone();
        let cluster = kubernetes.cluster.clone();
        let token = self.cancellation_token.clone();

        Some(tokio::spawn(async move {
            tracing::info!("Starting Kubernetes pod informer task");
            let (_watcher, kubeconfig_changes) = watch_kubeconfig(cluster.kubeconfig().map(|p| p.as_path()));
            informer.run(cluster, kubeconfig_changes, token).await;
            tracing::info!("Kubernetes pod informer task completed");
        }))
    }

    fn spawn_api_server_task(&self, app: &Application) -> JoinHandle<()> {
        let listen_addr = app.daemon_args().listen_addr.clone();
        let state = ApiState::from_services(app.services());
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting API server on {}", listen_addr);
            let api_server = ApiServer::new(state, listen_addr);
            if let Err(e) = api_server.run(token).await {
                tracing::error!("API server failed: {e:?}");
            } else {
                tracing::info!("API server completed");
            }
        })
    }
}
