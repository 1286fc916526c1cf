//! Shared API type definitions
//!
//! This crate contains the serializable snapshots published by the orchestrator:
//! inference servers, applications, tasks and InstructLab sessions, plus the
//! request/response envelopes used by the HTTP API.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// String labels attached to containers, pods and tasks.
pub type Labels = BTreeMap<String, String>;

/// Container runtime hosting a server or an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Podman,
    Kubernetes,
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeType::Podman => write!(f, "podman"),
            RuntimeType::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Inference backend family a model (and a provider) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InferenceType {
    #[serde(rename = "llama-cpp")]
    LlamaCpp,
    #[serde(rename = "whisper-cpp")]
    WhisperCpp,
    #[serde(rename = "openvino")]
    OpenVino,
    #[default]
    #[serde(rename = "none")]
    None,
}

impl fmt::Display for InferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InferenceType::LlamaCpp => "llama-cpp",
            InferenceType::WhisperCpp => "whisper-cpp",
            InferenceType::OpenVino => "openvino",
            InferenceType::None => "none",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of an inference server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceServerStatus {
    Stopped,
    Running,
    Deleting,
    Stopping,
    Error,
    Starting,
}

impl InferenceServerStatus {
    /// `starting`, `stopping` and `deleting` are transient: background
    /// refreshes must not overwrite them and no new command is accepted.
    pub fn is_transitioning(self) -> bool {
        matches!(
            self,
            InferenceServerStatus::Starting
                | InferenceServerStatus::Stopping
                | InferenceServerStatus::Deleting
        )
    }
}

impl fmt::Display for InferenceServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InferenceServerStatus::Stopped => "stopped",
            InferenceServerStatus::Running => "running",
            InferenceServerStatus::Deleting => "deleting",
            InferenceServerStatus::Stopping => "stopping",
            InferenceServerStatus::Error => "error",
            InferenceServerStatus::Starting => "starting",
        };
        f.write_str(name)
    }
}

/// Location of a model file on the host running the container engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFile {
    /// Directory holding the model
    pub path: String,
    /// File name inside `path`
    pub file: String,
}

/// Catalog entry describing a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub backend: Option<InferenceType>,
    /// Approximate size in bytes
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub file: Option<ModelFile>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// One entry of a container health-check history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckLog {
    pub start: String,
    pub end: String,
    pub exit_code: i64,
    pub output: String,
}

/// Health report of an inference server, as last seen by inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: String,
    pub failing_streak: u32,
    pub log: Vec<HealthCheckLog>,
}

/// Where an inference server can be reached from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub host: String,
    pub port: Option<u16>,
}

/// Runtime-agnostic view of an inference server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceServerInfo {
    pub id: String,
    pub runtime: RuntimeType,
    pub status: InferenceServerStatus,
    pub health: Option<HealthSnapshot>,
    pub models: Vec<ModelInfo>,
    pub connection: Connection,
    pub labels: Labels,
    #[serde(rename = "type")]
    pub inference_type: InferenceType,
}

/// Aggregated health of the containers of an application pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodHealth {
    #[default]
    None,
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Starting,
    Running,
    Stopped,
    Deleting,
    Error,
}

/// Runtime-agnostic view of a running recipe application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationInfo {
    pub recipe_id: String,
    pub model_id: String,
    pub runtime: RuntimeType,
    pub status: ApplicationStatus,
    pub health: PodHealth,
    pub app_ports: Vec<u16>,
    pub model_ports: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Loading,
    Success,
    Error,
}

/// User-visible progress record of a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    pub labels: Labels,
    pub error: Option<String>,
}

/// InstructLab session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstructLabState {
    Initialized,
    SetupGenerate,
    Generating,
    GeneratingCompleted,
    SetupFineTune,
    FineTuning,
    TrainingCompleted,
}

impl fmt::Display for InstructLabState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstructLabState::Initialized => "INITIALIZED",
            InstructLabState::SetupGenerate => "SETUP_GENERATE",
            InstructLabState::Generating => "GENERATING",
            InstructLabState::GeneratingCompleted => "GENERATING_COMPLETED",
            InstructLabState::SetupFineTune => "SETUP_FINE_TUNE",
            InstructLabState::FineTuning => "FINE_TUNING",
            InstructLabState::TrainingCompleted => "TRAINING_COMPLETED",
        };
        f.write_str(name)
    }
}

/// Which step of a session a container runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstructLabStage {
    Generate,
    FineTune,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructLabContainer {
    pub container_id: String,
    pub engine_id: String,
    pub stage: InstructLabStage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructLabSessionConfig {
    pub name: String,
    /// Model used by the inference server backing data generation
    pub instruct_model_id: String,
    /// Model being fine tuned
    pub target_model_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructLabSession {
    pub uid: String,
    pub name: String,
    pub instruct_model_id: String,
    pub target_model_id: String,
    pub state: InstructLabState,
    /// Seconds since the unix epoch
    pub created_at: u64,
    pub containers: Vec<InstructLabContainer>,
}

/// Body of `POST /api/v1/inference-servers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInferenceServerRequest {
    pub runtime: RuntimeType,
    pub model_ids: Vec<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub gpu: bool,
    #[serde(default)]
    pub labels: Labels,
}

/// Body of `POST /api/v1/applications`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartApplicationRequest {
    pub runtime: RuntimeType,
    pub recipe_id: String,
    pub model_id: String,
}

/// Identifier returned by asynchronous requests; tasks carry it as the
/// `trackingId` label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingResponse {
    pub tracking_id: String,
}

/// Generic response envelope of the HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Payload when the request succeeded
    pub data: Option<T>,
    /// Human readable message
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
        }
    }
}

/// Resource usage sample of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsInfo {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Cumulated CPU time in nanoseconds
    pub cpu_usage: u64,
    /// Memory in bytes
    pub memory_usage: u64,
}

/// Recent samples of one monitored container, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsHistory {
    pub container_id: String,
    pub stats: Vec<StatsInfo>,
}

/// One snapshot pushed on the server-sent events stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum StateUpdate {
    InferenceServers(Vec<InferenceServerInfo>),
    Applications(Vec<ApplicationInfo>),
    Tasks(Vec<Task>),
    InstructlabSessions(Vec<InstructLabSession>),
    Monitoring(Vec<StatsHistory>),
}

impl StateUpdate {
    /// SSE event name of this update.
    pub fn event_name(&self) -> &'static str {
        match self {
            StateUpdate::InferenceServers(_) => "inference-servers",
            StateUpdate::Applications(_) => "applications",
            StateUpdate::Tasks(_) => "tasks",
            StateUpdate::InstructlabSessions(_) => "instructlab-sessions",
            StateUpdate::Monitoring(_) => "monitoring",
        }
    }
}
