use std::sync::Arc;
use std::time::Duration;

use api_types::{
    ApiResponse, ApplicationInfo, CreateInferenceServerRequest, InferenceServerInfo,
    InstructLabSession, InstructLabSessionConfig, RuntimeType, StartApplicationRequest,
    StatsHistory, Task, TrackingResponse,
};
use futures::StreamExt;
use poem::handler;
use poem::web::sse::{Event, SSE};
use poem::web::{Data, Json, Path};
use tracing::{info, warn};

use super::{ApiError, ApiState};
use crate::core::{InferenceServerConfig, OrchestratorError};
use crate::domain::instructlab::InstructLabManager;
use crate::domain::monitoring::MonitoringManager;
use crate::platform::providers::free_port;

type ApiResult<T> = poem::Result<Json<ApiResponse<T>>>;

fn ok<T>(data: T, message: impl Into<String>) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(data, message)))
}

fn instructlab(state: &ApiState) -> Result<&Arc<InstructLabManager>, ApiError> {
    state.instructlab.as_ref().ok_or_else(|| {
        ApiError::from(OrchestratorError::ProviderUnavailable {
            message: "InstructLab needs the Podman runtime".to_string(),
        })
    })
}

fn monitoring(state: &ApiState) -> Result<&Arc<MonitoringManager>, ApiError> {
    state.monitoring.as_ref().ok_or_else(|| {
        ApiError::from(OrchestratorError::ProviderUnavailable {
            message: "container monitoring needs the Podman runtime".to_string(),
        })
    })
}

fn parse_runtime(runtime: String) -> Result<RuntimeType, ApiError> {
    serde_json::from_value(serde_json::Value::String(runtime.clone())).map_err(|_| {
        ApiError::from(OrchestratorError::InvalidInput {
            message: format!("unknown runtime {runtime}"),
        })
    })
}

#[handler]
pub async fn list_inference_servers(state: Data<&Arc<ApiState>>) -> ApiResult<Vec<InferenceServerInfo>> {
    let servers = state.inference.servers();
    let message = format!("{} inference servers", servers.len());
    ok(servers, message)
}

#[handler]
pub async fn create_inference_server(
    state: Data<&Arc<ApiState>>,
    Json(request): Json<CreateInferenceServerRequest>,
) -> ApiResult<InferenceServerInfo> {
    if request.model_ids.is_empty() {
        return Err(ApiError::from(OrchestratorError::InvalidInput {
            message: "at least one model is required".to_string(),
        })
        .into());
    }
    let models_info = request
        .model_ids
        .iter()
        .map(|id| {
            state
                .catalog
                .get_model_by_id(id)
                .ok_or_else(|| OrchestratorError::not_found("model", id.as_str()))
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(ApiError::from)?;
    let port = match request.port {
        Some(port) => port,
        None => free_port().map_err(ApiError::from)?,
    };

    info!(runtime = %request.runtime, models = ?request.model_ids, port, "Creating inference server");
    let server = state
        .inference
        .create_server(
            request.runtime,
            InferenceServerConfig {
                port,
                models_info,
                provider_id: request.provider_id,
                image: None,
                labels: request.labels,
                gpu: request.gpu,
            },
        )
        .await
        .map_err(ApiError::from)?;
    let message = format!("Inference server {} created", server.id);
    ok(server, message)
}

#[handler]
pub async fn start_inference_server(state: Data<&Arc<ApiState>>, Path(id): Path<String>) -> ApiResult<()> {
    state.inference.start_server(&id).await.map_err(ApiError::from)?;
    ok((), format!("Inference server {id} started"))
}

#[handler]
pub async fn stop_inference_server(state: Data<&Arc<ApiState>>, Path(id): Path<String>) -> ApiResult<()> {
    state.inference.stop_server(&id).await.map_err(ApiError::from)?;
    ok((), format!("Inference server {id} stopped"))
}

#[handler]
pub async fn delete_inference_server(state: Data<&Arc<ApiState>>, Path(id): Path<String>) -> ApiResult<()> {
    state.inference.remove_server(&id).await.map_err(ApiError::from)?;
    ok((), format!("Inference server {id} removed"))
}

#[handler]
pub async fn list_applications(state: Data<&Arc<ApiState>>) -> ApiResult<Vec<ApplicationInfo>> {
    let applications = state.applications.applications();
    let message = format!("{} applications", applications.len());
    ok(applications, message)
}

#[handler]
pub async fn start_application(
    state: Data<&Arc<ApiState>>,
    Json(request): Json<StartApplicationRequest>,
) -> ApiResult<TrackingResponse> {
    let tracking_id = state
        .applications
        .request_start(request.runtime, &request.recipe_id, &request.model_id)
        .map_err(ApiError::from)?;
    info!(recipe = %request.recipe_id, model = %request.model_id, %tracking_id, "Application start requested");
    ok(TrackingResponse { tracking_id }, format!("Starting recipe {}", request.recipe_id))
}

#[handler]
pub async fn delete_application(
    state: Data<&Arc<ApiState>>,
    Path((runtime, recipe_id, model_id)): Path<(String, String, String)>,
) -> ApiResult<()> {
    let runtime = parse_runtime(runtime)?;
    state
        .applications
        .remove_application(runtime, &recipe_id, &model_id)
        .await
        .map_err(ApiError::from)?;
    ok((), format!("Application {recipe_id} with model {model_id} removed"))
}

#[handler]
pub async fn list_tasks(state: Data<&Arc<ApiState>>) -> ApiResult<Vec<Task>> {
    let tasks = state.tasks.get_tasks();
    let message = format!("{} tasks", tasks.len());
    ok(tasks, message)
}

#[handler]
pub async fn list_sessions(state: Data<&Arc<ApiState>>) -> ApiResult<Vec<InstructLabSession>> {
    let sessions = instructlab(&state)?.sessions().sessions();
    let message = format!("{} sessions", sessions.len());
    ok(sessions, message)
}

#[handler]
pub async fn create_session(
    state: Data<&Arc<ApiState>>,
    Json(config): Json<InstructLabSessionConfig>,
) -> ApiResult<TrackingResponse> {
    let name = config.name.clone();
    let tracking_id = instructlab(&state)?.request_new_session(config);
    ok(TrackingResponse { tracking_id }, format!("Creating session {name}"))
}

#[handler]
pub async fn generate(state: Data<&Arc<ApiState>>, Path(uid): Path<String>) -> ApiResult<()> {
    instructlab(&state)?
        .request_generate(&uid)
        .await
        .map_err(ApiError::from)?;
    ok((), format!("Session {uid} is generating"))
}

#[handler]
pub async fn fine_tune(state: Data<&Arc<ApiState>>, Path(uid): Path<String>) -> ApiResult<()> {
    instructlab(&state)?
        .request_fine_tune(&uid)
        .await
        .map_err(ApiError::from)?;
    ok((), format!("Session {uid} is fine tuning"))
}

#[handler]
pub async fn abort(state: Data<&Arc<ApiState>>, Path(uid): Path<String>) -> ApiResult<()> {
    instructlab(&state)?
        .abort_session(&uid)
        .await
        .map_err(ApiError::from)?;
    ok((), format!("Session {uid} aborted"))
}

#[handler]
pub async fn list_stats(state: Data<&Arc<ApiState>>) -> ApiResult<Vec<StatsHistory>> {
    let stats = monitoring(&state)?.stats();
    let message = format!("{} monitored containers", stats.len());
    ok(stats, message)
}

#[handler]
pub async fn start_monitoring(
    state: Data<&Arc<ApiState>>,
    Path(container_id): Path<String>,
) -> ApiResult<()> {
    monitoring(&state)?
        .monitor(&container_id)
        .await
        .map_err(ApiError::from)?;
    ok((), format!("Monitoring container {container_id}"))
}

#[handler]
pub async fn stop_monitoring(
    state: Data<&Arc<ApiState>>,
    Path(container_id): Path<String>,
) -> ApiResult<()> {
    monitoring(&state)?.stop(&container_id);
    ok((), format!("Stopped monitoring container {container_id}"))
}

/// Streams every snapshot change, starting with the current state.
#[handler]
pub fn events(state: Data<&Arc<ApiState>>) -> SSE {
    let stream = state.updates().filter_map(|update| async move {
        match serde_json::to_string(&update) {
            Ok(json) => Some(Event::message(json).event_type(update.event_name())),
            Err(e) => {
                warn!("Failed to encode {} update: {e}", update.event_name());
                None
            }
        }
    });
    SSE::new(stream).keep_alive(Duration::from_secs(15))
}
