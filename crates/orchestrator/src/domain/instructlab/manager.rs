use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use api_types::{
    InferenceServerInfo, InferenceServerStatus, InstructLabContainer, InstructLabSession,
    InstructLabSessionConfig, InstructLabStage, InstructLabState, Labels, ModelInfo, TaskState,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::InstructLabRegistry;
use crate::core::catalog::ModelsManager;
use crate::core::types::TASK_LABEL_TRACKING_ID;
use crate::core::{InferenceCommands, InferenceServerConfig, OrchestratorError, Result, TaskRegistry};
use crate::domain::inference::PodmanInferenceManager;
use crate::platform::container::{ContainerCreateOptions, ContainerEngine, ContainerEventRegistry};
use crate::platform::providers::free_port;

pub const ILAB_IMAGE: &str = "localhost/ilab:0.19.3-1729081109";

/// Container label naming the session step a container runs.
pub const ILAB_LABEL: &str = "instructlab";
pub const ILAB_SESSION_LABEL: &str = "instructlab-session";

/// Drives InstructLab sessions through data generation and fine tuning.
///
/// Each step runs in a container; its exit code, observed when the
/// container dies, moves the session forward (0) or back to the last
/// completed state.
pub struct InstructLabManager {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<dyn ContainerEngine>,
    events: Arc<ContainerEventRegistry>,
    inference: Arc<PodmanInferenceManager>,
    models: Arc<dyn ModelsManager>,
    tasks: Arc<TaskRegistry>,
    sessions: Arc<InstructLabRegistry>,
    image: String,
    listening: AtomicBool,
    token: CancellationToken,
}

/// States a step goes through: set up, running, succeeded, rolled back.
struct StepStates {
    ready: InstructLabState,
    setup: InstructLabState,
    running: InstructLabState,
    completed: InstructLabState,
}

fn step_states(stage: InstructLabStage) -> StepStates {
    match stage {
        InstructLabStage::Generate => StepStates {
            ready: InstructLabState::Initialized,
            setup: InstructLabState::SetupGenerate,
            running: InstructLabState::Generating,
            completed: InstructLabState::GeneratingCompleted,
        },
        InstructLabStage::FineTune => StepStates {
            ready: InstructLabState::GeneratingCompleted,
            setup: InstructLabState::SetupFineTune,
            running: InstructLabState::FineTuning,
            completed: InstructLabState::TrainingCompleted,
        },
    }
}

/// Step a session is in the middle of, if any.
fn stage_in_progress(state: InstructLabState) -> Option<InstructLabStage> {
    match state {
        InstructLabState::SetupGenerate | InstructLabState::Generating => Some(InstructLabStage::Generate),
        InstructLabState::SetupFineTune | InstructLabState::FineTuning => Some(InstructLabStage::FineTune),
        _ => None,
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl InstructLabManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        events: Arc<ContainerEventRegistry>,
        inference: Arc<PodmanInferenceManager>,
        models: Arc<dyn ModelsManager>,
        tasks: Arc<TaskRegistry>,
        sessions: Arc<InstructLabRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                events,
                inference,
                models,
                tasks,
                sessions,
                image: ILAB_IMAGE.to_string(),
                listening: AtomicBool::new(false),
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn sessions(&self) -> &InstructLabRegistry {
        &self.inner.sessions
    }

    /// Starts listening for step containers exiting.
    pub fn init(&self) {
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut died = self.inner.events.on_die_container_event();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.token.cancelled() => break,
                    event = died.recv() => match event {
                        Some(event) => inner.on_container_died(&event.id).await,
                        None => break,
                    },
                }
            }
            debug!("InstructLab manager stopped listening");
        });
    }

    pub fn dispose(&self) {
        self.inner.token.cancel();
    }

    /// Creates a session in the background. Returns the tracking id of its task.
    pub fn request_new_session(&self, config: InstructLabSessionConfig) -> String {
        let tracking_id = uuid::Uuid::new_v4().simple().to_string();
        let labels = Labels::from([(TASK_LABEL_TRACKING_ID.to_string(), tracking_id.clone())]);
        let mut task = self
            .inner
            .tasks
            .create_task("Creating InstructLab session", TaskState::Loading, labels);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.new_session(config) {
                Ok(session) => {
                    task.labels.insert("sessionId".to_string(), session.uid);
                    inner.tasks.succeed(&mut task);
                }
                Err(e) => {
                    warn!("Something went wrong while creating new session: {e}");
                    inner.tasks.fail(&mut task, e);
                }
            }
        });
        tracking_id
    }

    pub fn new_session(&self, config: InstructLabSessionConfig) -> Result<InstructLabSession> {
        self.inner.new_session(config)
    }

    /// Generates the dataset of a session from its instruct model.
    #[tracing::instrument(skip(self))]
    pub async fn request_generate(&self, uid: &str) -> Result<()> {
        let session = self.inner.begin_step(uid, InstructLabStage::Generate)?;
        let result = async {
            let model = self.inner.model(&session.instruct_model_id)?;
            let server = self
                .inner
                .tasks
                .track("Starting an inference server", session_labels(&session), self.inner.instruct_server(&model))
                .await?;
            let port = server.connection.port.ok_or_else(|| {
                OrchestratorError::external("start inference server", "server exposes no port")
            })?;
            let command = vec![
                "generate".to_string(),
                format!("--endpoint-url=http://host.containers.internal:{port}"),
            ];
            self.inner
                .run_step(&session, InstructLabStage::Generate, command, "Generating dataset")
                .await
        }
        .await;
        self.inner.settle_step(uid, InstructLabStage::Generate, result)
    }

    /// Fine tunes the target model on the generated dataset.
    #[tracing::instrument(skip(self))]
    pub async fn request_fine_tune(&self, uid: &str) -> Result<()> {
        let session = self.inner.begin_step(uid, InstructLabStage::FineTune)?;
        let command = vec![
            "train".to_string(),
            format!("--model-id={}", session.target_model_id),
        ];
        let result = self
            .inner
            .run_step(&session, InstructLabStage::FineTune, command, "Fine tuning model")
            .await;
        self.inner.settle_step(uid, InstructLabStage::FineTune, result)
    }

    /// Rolls a session back to its last completed state and stops the
    /// containers of the interrupted step.
    pub async fn abort_session(&self, uid: &str) -> Result<()> {
        let session = self.inner.sessions.get(uid)?;
        let stage = stage_in_progress(session.state).ok_or_else(|| {
            OrchestratorError::invalid_transition(format!("cannot abort a session in state {}", session.state))
        })?;
        let rollback = step_states(stage).ready;
        if !self.inner.sessions.transition(uid, session.state, rollback)? {
            return Err(OrchestratorError::invalid_transition(
                "session state changed while aborting",
            ));
        }
        info!(%uid, from = %session.state, to = %rollback, "InstructLab session aborted");

        for container in session.containers.iter().filter(|c| c.stage == stage) {
            if let Err(e) = self.inner.engine.stop_container(&container.container_id).await {
                warn!(container_id = %container.container_id, "Failed to stop aborted container: {e}");
            }
        }
        Ok(())
    }
}

impl Inner {
    fn new_session(&self, config: InstructLabSessionConfig) -> Result<InstructLabSession> {
        if !is_valid_name(&config.name) {
            return Err(OrchestratorError::InvalidInput {
                message: format!("invalid session name {:?}", config.name),
            });
        }
        self.model(&config.instruct_model_id)?;
        self.model(&config.target_model_id)?;

        let created_at = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        let session = InstructLabSession {
            uid: uuid::Uuid::new_v4().to_string(),
            name: config.name,
            instruct_model_id: config.instruct_model_id,
            target_model_id: config.target_model_id,
            state: InstructLabState::Initialized,
            created_at,
            containers: Vec::new(),
        };
        self.sessions.register(session.clone());
        info!(uid = %session.uid, name = %session.name, "InstructLab session created");
        Ok(session)
    }

    fn model(&self, model_id: &str) -> Result<ModelInfo> {
        self.models
            .get_model_info(model_id)
            .ok_or_else(|| OrchestratorError::not_found("model", model_id))
    }

    /// Moves the session into the setup state of `stage`.
    fn begin_step(&self, uid: &str, stage: InstructLabStage) -> Result<InstructLabSession> {
        let session = self.sessions.get(uid)?;
        let states = step_states(stage);
        if !self.sessions.transition(uid, states.ready, states.setup)? {
            return Err(OrchestratorError::invalid_transition(format!(
                "cannot start {stage:?} from state {}",
                session.state
            )));
        }
        Ok(session)
    }

    /// Rolls a failed step back unless the session moved on meanwhile.
    fn settle_step(&self, uid: &str, stage: InstructLabStage, result: Result<()>) -> Result<()> {
        let Err(e) = result else {
            return Ok(());
        };
        let states = step_states(stage);
        for from in [states.setup, states.running] {
            match self.sessions.transition(uid, from, states.ready) {
                Ok(true) => info!(%uid, to = %states.ready, "InstructLab step failed, session rolled back"),
                Ok(false) => {}
                Err(rollback) => warn!(%uid, "Failed to roll back session: {rollback}"),
            }
        }
        Err(e)
    }

    /// Reuses a server already serving `model`, starting it if needed, or
    /// creates one.
    async fn instruct_server(&self, model: &ModelInfo) -> Result<InferenceServerInfo> {
        if let Some(server) = self.inference.find_server_by_model(&model.id) {
            if server.status == InferenceServerStatus::Stopped {
                self.inference.start_server(&server.id).await?;
            }
            return Ok(server);
        }
        self.inference
            .create_server(InferenceServerConfig {
                port: free_port()?,
                models_info: vec![model.clone()],
                provider_id: None,
                image: None,
                labels: Labels::new(),
                gpu: false,
            })
            .await
    }

    /// Creates the container of a step, records it, marks the step running
    /// and starts the container.
    async fn run_step(
        &self,
        session: &InstructLabSession,
        stage: InstructLabStage,
        command: Vec<String>,
        task_name: &str,
    ) -> Result<()> {
        let step = match stage {
            InstructLabStage::Generate => "generate",
            InstructLabStage::FineTune => "fine-tune",
        };
        let mut labels = session_labels(session);
        labels.insert(ILAB_LABEL.to_string(), step.to_string());

        let created = self
            .tasks
            .track(
                task_name,
                session_labels(session),
                self.engine.create_container(ContainerCreateOptions {
                    name: Some(format!("{}-{step}", session.name)),
                    image: self.image.clone(),
                    labels,
                    command,
                    ..Default::default()
                }),
            )
            .await?;
        self.sessions.register_container(
            &session.uid,
            InstructLabContainer {
                container_id: created.id.clone(),
                engine_id: created.engine_id.clone(),
                stage,
            },
        )?;

        let states = step_states(stage);
        if !self.sessions.transition(&session.uid, states.setup, states.running)? {
            if let Err(e) = self.engine.delete_container(&created.id).await {
                warn!(container_id = %created.id, "Failed to delete container of aborted step: {e}");
            }
            return Err(OrchestratorError::invalid_transition("session was aborted"));
        }
        self.engine.start_container(&created.id).await
    }

    async fn on_container_died(&self, container_id: &str) {
        let Some((session, container)) = self.sessions.find_by_container(container_id) else {
            return;
        };
        let states = step_states(container.stage);
        if session.state != states.running {
            debug!(uid = %session.uid, state = %session.state, %container_id, "Ignoring exit of a stale step container");
            return;
        }
        let exit_code = match self.engine.inspect_container(container_id).await {
            Ok(inspect) => inspect.exit_code,
            Err(e) => {
                warn!(uid = %session.uid, %container_id, "Cannot read exit code of step container: {e}");
                return;
            }
        };
        let next = if exit_code == 0 { states.completed } else { states.ready };
        match self.sessions.transition(&session.uid, states.running, next) {
            Ok(true) => info!(uid = %session.uid, exit_code, to = %next, "InstructLab step finished"),
            Ok(false) => debug!(uid = %session.uid, "Session moved on before its container exited"),
            Err(e) => warn!(uid = %session.uid, "Failed to update session: {e}"),
        }
    }
}

fn session_labels(session: &InstructLabSession) -> Labels {
    Labels::from([(ILAB_SESSION_LABEL.to_string(), session.uid.clone())])
}
