//! libpod REST client over the Podman API socket.

use std::collections::VecDeque;
use std::error::Error;
use std::path::PathBuf;

use api_types::{HealthCheckLog, HealthSnapshot, Labels};
use async_trait::async_trait;
use bytes::Bytes;
use error_stack::{Report, ResultExt};
use futures::stream::BoxStream;
use futures::StreamExt;
use http_body_util::{BodyExt, BodyStream, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::UnixStream;
use tracing::debug;

use super::{
    ContainerCreateOptions, ContainerEngine, ContainerInspect, ContainerStats, ContainerStatus,
    ContainerSummary, CreatedContainer, EngineEvent, PodContainer, PodCreateOptions, PodStatus, PodSummary,
    PortMapping,
};
use crate::core::{OrchestratorError, Result};

const API_PREFIX: &str = "/v4.0.0/libpod";

/// Only the last entries of a health-check history are kept.
const MAX_HEALTH_LOG: usize = 5;

#[derive(Debug, derive_more::Display)]
pub enum PodmanError {
    #[display("Failed to connect to the Podman socket {path}")]
    ConnectionFailed { path: String },
    #[display("Podman request {method} {path} failed")]
    RequestFailed { method: String, path: String },
    #[display("Podman answered {status} to {method} {path}: {message}")]
    UnexpectedStatus {
        method: String,
        path: String,
        status: u16,
        message: String,
    },
    #[display("Failed to decode Podman response of {path}")]
    InvalidResponse { path: String },
}

impl Error for PodmanError {}

/// [`ContainerEngine`] backed by the libpod REST API.
pub struct PodmanApiClient {
    engine_id: String,
    socket_path: PathBuf,
}

impl PodmanApiClient {
    pub fn new(engine_id: impl Into<String>, socket_path: PathBuf) -> Self {
        Self {
            engine_id: engine_id.into(),
            socket_path,
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> std::result::Result<Response<Incoming>, Report<PodmanError>> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .change_context(PodmanError::ConnectionFailed {
                path: self.socket_path.display().to_string(),
            })?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .change_context(PodmanError::ConnectionFailed {
                path: self.socket_path.display().to_string(),
            })?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Podman connection closed: {e}");
            }
        });

        let request_failed = || PodmanError::RequestFailed {
            method: method.to_string(),
            path: path.to_string(),
        };
        let payload = match &body {
            Some(value) => Bytes::from(value.to_string()),
            None => Bytes::new(),
        };
        let request = Request::builder()
            .method(method.clone())
            .uri(format!("{API_PREFIX}{path}"))
            .header(HOST, "d")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(payload))
            .change_context_lazy(request_failed)?;

        let response = sender
            .send_request(request)
            .await
            .change_context_lazy(request_failed)?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }

        let body = response
            .into_body()
            .collect()
            .await
            .change_context_lazy(request_failed)?
            .to_bytes();
        Err(Report::new(PodmanError::UnexpectedStatus {
            method: method.to_string(),
            path: path.to_string(),
            status: status.as_u16(),
            message: error_message(&body),
        }))
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> std::result::Result<Bytes, Report<PodmanError>> {
        let response = self.send(method.clone(), path, body).await?;
        let bytes = response
            .into_body()
            .collect()
            .await
            .change_context(PodmanError::RequestFailed {
                method: method.to_string(),
                path: path.to_string(),
            })?
            .to_bytes();
        Ok(bytes)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> std::result::Result<T, Report<PodmanError>> {
        let bytes = self.call(Method::GET, path, None).await?;
        serde_json::from_slice(&bytes).change_context(PodmanError::InvalidResponse {
            path: path.to_string(),
        })
    }
}

fn error_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
        cause: Option<String>,
    }
    serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|e| e.message.or(e.cause))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

fn external(operation: &str, report: Report<PodmanError>) -> OrchestratorError {
    OrchestratorError::external(operation, report.current_context())
}

#[derive(Deserialize)]
struct ListedPort {
    container_port: u16,
    #[serde(default)]
    host_port: Option<u16>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedContainer {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: Option<Labels>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    ports: Option<Vec<ListedPort>>,
    #[serde(default)]
    pod: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedHealthLog {
    #[serde(default)]
    start: String,
    #[serde(default)]
    end: String,
    #[serde(default)]
    exit_code: i64,
    #[serde(default)]
    output: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedHealth {
    status: String,
    #[serde(default)]
    failing_streak: u32,
    #[serde(default)]
    log: Option<Vec<InspectedHealthLog>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    status: String,
    #[serde(default)]
    running: bool,
    #[serde(default)]
    exit_code: i64,
    #[serde(default, alias = "Healthcheck")]
    health: Option<InspectedHealth>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    id: String,
    state: InspectedState,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedPodContainer {
    id: String,
    #[serde(default)]
    names: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedPod {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    labels: Option<Labels>,
    #[serde(default)]
    containers: Option<Vec<ListedPodContainer>>,
}

#[derive(Deserialize)]
struct EventActor {
    #[serde(rename = "ID", default)]
    id: String,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", default)]
    action: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "Actor", default)]
    actor: Option<EventActor>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Deserialize)]
struct RawCpuUsage {
    #[serde(default)]
    total_usage: u64,
}

#[derive(Deserialize)]
struct RawCpuStats {
    cpu_usage: RawCpuUsage,
}

#[derive(Deserialize)]
struct RawMemoryStats {
    #[serde(default)]
    usage: u64,
}

/// A stats line is either a sample or the reason sampling stopped.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawStatsLine {
    Failure {
        cause: String,
        #[serde(default)]
        message: String,
    },
    Sample {
        cpu_stats: RawCpuStats,
        memory_stats: RawMemoryStats,
    },
}

#[derive(Serialize)]
struct PortMappingBody {
    container_port: u16,
    host_port: u16,
}

fn port_mappings(ports: &[PortMapping]) -> Vec<PortMappingBody> {
    ports
        .iter()
        .map(|p| PortMappingBody {
            container_port: p.container_port,
            host_port: p.host_port.unwrap_or(p.container_port),
        })
        .collect()
}

/// Parses one JSON line of the event stream. Unknown event types yield `None`.
fn parse_event(line: &[u8]) -> Option<EngineEvent> {
    let raw: RawEvent = match serde_json::from_slice(line) {
        Ok(raw) => raw,
        Err(e) => {
            debug!("Skipping undecodable Podman event: {e}");
            return None;
        }
    };
    let id = raw
        .actor
        .map(|actor| actor.id)
        .filter(|id| !id.is_empty())
        .or(raw.id)?;
    let action = raw.action.or(raw.status).unwrap_or_default();
    match raw.kind.as_str() {
        "container" => Some(EngineEvent::Container {
            id,
            status: ContainerStatus::parse(&action),
        }),
        "pod" => {
            let status = match action.as_str() {
                "start" => PodStatus::Start,
                "stop" => PodStatus::Stop,
                "remove" => PodStatus::Remove,
                _ => return None,
            };
            Some(EngineEvent::Pod { id, status })
        }
        _ => None,
    }
}

/// Parses one JSON line of a stats stream.
fn parse_stats(line: &[u8]) -> Option<Result<ContainerStats>> {
    match serde_json::from_slice(line) {
        Ok(RawStatsLine::Sample {
            cpu_stats,
            memory_stats,
        }) => Some(Ok(ContainerStats {
            cpu_usage: cpu_stats.cpu_usage.total_usage,
            memory_usage: memory_stats.usage,
        })),
        Ok(RawStatsLine::Failure { cause, message }) => Some(Err(OrchestratorError::external(
            "read stats stream",
            if message.is_empty() { cause } else { message },
        ))),
        Err(e) => {
            debug!("Skipping undecodable Podman stats: {e}");
            None
        }
    }
}

fn summary_from(engine_id: &str, listed: ListedContainer) -> ContainerSummary {
    ContainerSummary {
        id: listed.id,
        engine_id: engine_id.to_string(),
        names: listed.names,
        image: listed.image,
        labels: listed.labels.unwrap_or_default(),
        state: listed.state,
        ports: listed
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| PortMapping {
                container_port: p.container_port,
                host_port: p.host_port.filter(|port| *port != 0),
            })
            .collect(),
        pod_id: listed.pod.filter(|pod| !pod.is_empty()),
    }
}

fn inspect_from(inspected: InspectedContainer) -> ContainerInspect {
    let health = inspected.state.health.map(|health| {
        let mut log: Vec<HealthCheckLog> = health
            .log
            .unwrap_or_default()
            .into_iter()
            .map(|entry| HealthCheckLog {
                start: entry.start,
                end: entry.end,
                exit_code: entry.exit_code,
                output: entry.output,
            })
            .collect();
        if log.len() > MAX_HEALTH_LOG {
            log.drain(..log.len() - MAX_HEALTH_LOG);
        }
        HealthSnapshot {
            status: health.status,
            failing_streak: health.failing_streak,
            log,
        }
    });
    ContainerInspect {
        id: inspected.id,
        status: inspected.state.status,
        running: inspected.state.running,
        exit_code: inspected.state.exit_code,
        health,
    }
}

fn create_body(options: &ContainerCreateOptions) -> serde_json::Value {
    let mounts: Vec<serde_json::Value> = options
        .mounts
        .iter()
        .map(|m| {
            let mut mount_options = vec!["Z"];
            if m.read_only {
                mount_options.push("ro");
            }
            json!({
                "destination": m.target,
                "source": m.source,
                "type": "bind",
                "options": mount_options,
            })
        })
        .collect();
    let mut body = json!({
        "image": options.image,
        "labels": options.labels,
        "env": options.env,
        "portmappings": port_mappings(&options.ports),
        "mounts": mounts,
        "remove": options.auto_remove,
    });
    if let Some(name) = &options.name {
        body["name"] = json!(name);
    }
    if !options.command.is_empty() {
        body["command"] = json!(options.command);
    }
    if let Some(pod) = &options.pod {
        body["pod"] = json!(pod);
    }
    if let Some(check) = &options.health_check {
        let interval = u64::try_from(check.interval.as_nanos()).unwrap_or(u64::MAX);
        body["healthconfig"] = json!({
            "Test": ["CMD-SHELL", check.command],
            "Interval": interval,
            "Retries": check.retries,
        });
    }
    if options.gpu {
        body["devices"] = json!([{ "path": "nvidia.com/gpu=all" }]);
    }
    body
}

#[async_trait]
impl ContainerEngine for PodmanApiClient {
    fn id(&self) -> &str {
        &self.engine_id
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let listed: Vec<ListedContainer> = self
            .get_json("/containers/json?all=true")
            .await
            .map_err(|r| external("list containers", r))?;
        Ok(listed
            .into_iter()
            .map(|c| summary_from(&self.engine_id, c))
            .collect())
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerInspect> {
        let inspected: InspectedContainer = self
            .get_json(&format!("/containers/{container_id}/json"))
            .await
            .map_err(|r| external("inspect container", r))?;
        Ok(inspect_from(inspected))
    }

    async fn create_container(&self, options: ContainerCreateOptions) -> Result<CreatedContainer> {
        let bytes = self
            .call(Method::POST, "/containers/create", Some(create_body(&options)))
            .await
            .map_err(|r| external("create container", r))?;
        let created: CreateResponse = serde_json::from_slice(&bytes)
            .map_err(|e| OrchestratorError::external("create container", e))?;
        Ok(CreatedContainer {
            id: created.id,
            engine_id: self.engine_id.clone(),
        })
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.call(Method::POST, &format!("/containers/{container_id}/start"), None)
            .await
            .map_err(|r| external("start container", r))?;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.call(Method::POST, &format!("/containers/{container_id}/stop"), None)
            .await
            .map_err(|r| external("stop container", r))?;
        Ok(())
    }

    async fn delete_container(&self, container_id: &str) -> Result<()> {
        self.call(
            Method::DELETE,
            &format!("/containers/{container_id}?force=true"),
            None,
        )
        .await
        .map_err(|r| external("delete container", r))?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        // The pull endpoint streams progress and reports failures in-band.
        let bytes = self
            .call(Method::POST, &format!("/images/pull?reference={image}"), None)
            .await
            .map_err(|r| external("pull image", r))?;
        for line in bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(line) {
                if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
                    if !error.is_empty() {
                        return Err(OrchestratorError::external("pull image", error));
                    }
                }
            }
        }
        Ok(())
    }

    async fn push_image(&self, image: &str) -> Result<()> {
        self.call(Method::POST, &format!("/images/{image}/push?tlsVerify=false"), None)
            .await
            .map_err(|r| external("push image", r))?;
        Ok(())
    }

    async fn list_pods(&self) -> Result<Vec<PodSummary>> {
        let listed: Vec<ListedPod> = self
            .get_json("/pods/json")
            .await
            .map_err(|r| external("list pods", r))?;
        Ok(listed
            .into_iter()
            .map(|pod| PodSummary {
                id: pod.id,
                name: pod.name,
                engine_id: self.engine_id.clone(),
                status: pod.status,
                labels: pod.labels.unwrap_or_default(),
                containers: pod
                    .containers
                    .unwrap_or_default()
                    .into_iter()
                    .map(|c| PodContainer {
                        id: c.id,
                        name: c.names,
                        status: c.status,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn create_pod(&self, options: PodCreateOptions) -> Result<String> {
        let body = json!({
            "name": options.name,
            "labels": options.labels,
            "portmappings": port_mappings(&options.ports),
        });
        let bytes = self
            .call(Method::POST, "/pods/create", Some(body))
            .await
            .map_err(|r| external("create pod", r))?;
        let created: CreateResponse = serde_json::from_slice(&bytes)
            .map_err(|e| OrchestratorError::external("create pod", e))?;
        Ok(created.id)
    }

    async fn start_pod(&self, pod_id: &str) -> Result<()> {
        self.call(Method::POST, &format!("/pods/{pod_id}/start"), None)
            .await
            .map_err(|r| external("start pod", r))?;
        Ok(())
    }

    async fn stop_pod(&self, pod_id: &str) -> Result<()> {
        self.call(Method::POST, &format!("/pods/{pod_id}/stop"), None)
            .await
            .map_err(|r| external("stop pod", r))?;
        Ok(())
    }

    async fn remove_pod(&self, pod_id: &str) -> Result<()> {
        self.call(Method::DELETE, &format!("/pods/{pod_id}?force=true"), None)
            .await
            .map_err(|r| external("remove pod", r))?;
        Ok(())
    }

    async fn events(&self) -> Result<BoxStream<'static, Result<EngineEvent>>> {
        let response = self
            .send(Method::GET, "/events?stream=true", None)
            .await
            .map_err(|r| external("open event stream", r))?;
        Ok(json_lines(response, "read event stream", |line| parse_event(line).map(Ok)))
    }

    async fn stats_container(&self, container_id: &str) -> Result<BoxStream<'static, Result<ContainerStats>>> {
        let response = self
            .send(Method::GET, &format!("/containers/{container_id}/stats?stream=true"), None)
            .await
            .map_err(|r| external("open stats stream", r))?;
        Ok(json_lines(response, "read stats stream", parse_stats))
    }
}

/// Splits a streamed body into JSON lines, keeping what `parse` maps.
fn json_lines<T, F>(
    response: Response<Incoming>,
    operation: &'static str,
    parse: F,
) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    F: Fn(&[u8]) -> Option<Result<T>> + Send + 'static,
{
    let body = Box::pin(BodyStream::new(response.into_body()));
    let state = (body, Vec::<u8>::new(), VecDeque::<Result<T>>::new(), parse);
    futures::stream::unfold(state, move |(mut body, mut buffer, mut pending, parse)| async move {
        loop {
            if let Some(item) = pending.pop_front() {
                return Some((item, (body, buffer, pending, parse)));
            }
            match body.next().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        buffer.extend_from_slice(&data);
                        while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=end).collect();
                            pending.extend(parse(&line));
                        }
                    }
                }
                Some(Err(e)) => {
                    let error = OrchestratorError::external(operation, e);
                    return Some((Err(error), (body, buffer, pending, parse)));
                }
                None => return None,
            }
        }
    })
    .boxed()
}
