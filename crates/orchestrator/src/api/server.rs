use std::sync::Arc;

use error_stack::Report;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::{delete, get, post, Endpoint, EndpointExt, Route, Server};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::errors::ApiError;
use super::handlers::*;
use super::ApiState;

/// Routes of the API, bound to `state`.
pub fn routes(state: Arc<ApiState>) -> impl Endpoint {
    Route::new()
        .at(
            "/api/v1/inference-servers",
            get(list_inference_servers).post(create_inference_server),
        )
        .at("/api/v1/inference-servers/:id", delete(delete_inference_server))
        .at("/api/v1/inference-servers/:id/start", post(start_inference_server))
        .at("/api/v1/inference-servers/:id/stop", post(stop_inference_server))
        .at("/api/v1/applications", get(list_applications).post(start_application))
        .at(
            "/api/v1/applications/:runtime/:recipe_id/:model_id",
            delete(delete_application),
        )
        .at("/api/v1/tasks", get(list_tasks))
        .at("/api/v1/instructlab/sessions", get(list_sessions).post(create_session))
        .at("/api/v1/instructlab/sessions/:uid/generate", post(generate))
        .at("/api/v1/instructlab/sessions/:uid/fine-tune", post(fine_tune))
        .at("/api/v1/instructlab/sessions/:uid/abort", post(abort))
        .at("/api/v1/monitoring", get(list_stats))
        .at(
            "/api/v1/monitoring/:container_id",
            post(start_monitoring).delete(stop_monitoring),
        )
        .at("/api/v1/events", get(events))
        .data(state)
        .with(Tracing)
}

/// HTTP API server of the orchestrator
pub struct ApiServer {
    state: Arc<ApiState>,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(state: Arc<ApiState>, listen_addr: String) -> Self {
        Self { state, listen_addr }
    }

    /// Serves the API until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.state);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        match server
            .run_with_graceful_shutdown(app, token.cancelled_owned(), None)
            .await
        {
            Ok(()) => {
                info!("API server stopped normally");
                Ok(())
            }
            Err(e) => {
                error!("API server failed: {e}");
                Err(Report::new(ApiError::ServerError {
                    message: format!("Server failed: {e}"),
                }))
            }
        }
    }
}
