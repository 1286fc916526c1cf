//! Container engine access.
//!
//! [`ContainerEngine`] is the narrow surface the engines need from Podman:
//! container and pod lifecycle, images, the event stream and container stats.
//! [`PodmanApiClient`] implements it over the libpod REST socket and
//! [`ContainerEventRegistry`] fans the event stream out to subscribers.

pub mod events;
pub mod podman_api;

use std::collections::BTreeMap;
use std::time::Duration;

use api_types::{HealthSnapshot, Labels};
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use events::ContainerEventRegistry;
pub use podman_api::PodmanApiClient;

use crate::core::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: Option<u16>,
}

/// Entry of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub engine_id: String,
    pub names: Vec<String>,
    pub image: String,
    pub labels: Labels,
    /// `running`, `exited`, `created`...
    pub state: String,
    pub ports: Vec<PortMapping>,
    pub pod_id: Option<String>,
}

/// Result of inspecting a single container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInspect {
    pub id: String,
    pub status: String,
    pub running: bool,
    pub exit_code: i64,
    pub health: Option<HealthSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Command run inside the container, in `CMD-SHELL` form
    pub command: String,
    pub interval: Duration,
    pub retries: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerCreateOptions {
    pub name: Option<String>,
    pub image: String,
    pub labels: Labels,
    pub env: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<Mount>,
    pub pod: Option<String>,
    pub health_check: Option<HealthCheck>,
    pub auto_remove: bool,
    /// Expose every GPU through CDI
    pub gpu: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContainer {
    pub id: String,
    pub engine_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodContainer {
    pub id: String,
    pub name: String,
    pub status: String,
}

/// Entry of a pod listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    pub id: String,
    pub name: String,
    pub engine_id: String,
    /// `Running`, `Exited`, `Degraded`...
    pub status: String,
    pub labels: Labels,
    pub containers: Vec<PodContainer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodCreateOptions {
    pub name: String,
    pub labels: Labels,
    pub ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Start,
    Stop,
    Die,
    Remove,
    Other(String),
}

impl ContainerStatus {
    pub fn parse(action: &str) -> Self {
        match action {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "died" | "die" => Self::Die,
            "remove" => Self::Remove,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodStatus {
    Start,
    Stop,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    Started,
    Stopped,
}

/// One sample of a container stats stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStats {
    /// Total CPU time consumed, in nanoseconds
    pub cpu_usage: u64,
    pub memory_usage: u64,
}

/// Event emitted by the container engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Container { id: String, status: ContainerStatus },
    Pod { id: String, status: PodStatus },
    Machine(MachineStatus),
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Identifier of the engine connection.
    fn id(&self) -> &str;

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInspect>;

    async fn create_container(&self, options: ContainerCreateOptions) -> Result<CreatedContainer>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    async fn stop_container(&self, container_id: &str) -> Result<()>;

    async fn delete_container(&self, container_id: &str) -> Result<()>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    async fn push_image(&self, image: &str) -> Result<()>;

    async fn list_pods(&self) -> Result<Vec<PodSummary>>;

    async fn create_pod(&self, options: PodCreateOptions) -> Result<String>;

    async fn start_pod(&self, pod_id: &str) -> Result<()>;

    async fn stop_pod(&self, pod_id: &str) -> Result<()>;

    async fn remove_pod(&self, pod_id: &str) -> Result<()>;

    /// Opens the engine event stream. The stream ends when the connection drops.
    async fn events(&self) -> Result<BoxStream<'static, Result<EngineEvent>>>;

    /// Streams resource usage samples of one container until it stops.
    async fn stats_container(&self, container_id: &str) -> Result<BoxStream<'static, Result<ContainerStats>>>;
}
