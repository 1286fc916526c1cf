use std::collections::HashMap;
use std::sync::RwLock;

use api_types::{InstructLabContainer, InstructLabSession, InstructLabState};
use tokio::sync::mpsc;

use crate::core::sync;
use crate::core::{OrchestratorError, Result, UpdateNotifier};

/// InstructLab sessions keyed by uid.
pub struct InstructLabRegistry {
    sessions: RwLock<HashMap<String, InstructLabSession>>,
    notifier: UpdateNotifier<Vec<InstructLabSession>>,
}

impl InstructLabRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            notifier: UpdateNotifier::new(),
        }
    }

    /// Sessions ordered by creation time.
    pub fn sessions(&self) -> Vec<InstructLabSession> {
        let mut sessions: Vec<_> = sync::read(&self.sessions).values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.uid.cmp(&b.uid)));
        sessions
    }

    pub fn get(&self, uid: &str) -> Result<InstructLabSession> {
        sync::read(&self.sessions)
            .get(uid)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("instructlab session", uid))
    }

    pub fn register(&self, session: InstructLabSession) {
        sync::write(&self.sessions).insert(session.uid.clone(), session);
        self.notify();
    }

    pub fn set_state(&self, uid: &str, state: InstructLabState) -> Result<()> {
        self.update(uid, |session| session.state = state)
    }

    /// Moves `uid` to `to` only if it is still in `from`. Returns whether the
    /// transition happened.
    pub fn transition(&self, uid: &str, from: InstructLabState, to: InstructLabState) -> Result<bool> {
        let changed = {
            let mut sessions = sync::write(&self.sessions);
            let session = sessions
                .get_mut(uid)
                .ok_or_else(|| OrchestratorError::not_found("instructlab session", uid))?;
            if session.state != from {
                return Ok(false);
            }
            session.state = to;
            true
        };
        self.notify();
        Ok(changed)
    }

    /// Records a container of the session, replacing a previous record of
    /// the same container.
    pub fn register_container(&self, uid: &str, container: InstructLabContainer) -> Result<()> {
        self.update(uid, |session| {
            session
                .containers
                .retain(|c| c.container_id != container.container_id);
            session.containers.push(container);
        })
    }

    /// Session owning `container_id`, with the container record.
    pub fn find_by_container(&self, container_id: &str) -> Option<(InstructLabSession, InstructLabContainer)> {
        sync::read(&self.sessions).values().find_map(|session| {
            session
                .containers
                .iter()
                .find(|c| c.container_id == container_id)
                .map(|c| (session.clone(), c.clone()))
        })
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<InstructLabSession>> {
        self.notifier.subscribe()
    }

    pub fn clear(&self) {
        sync::write(&self.sessions).clear();
        self.notify();
    }

    fn update(&self, uid: &str, apply: impl FnOnce(&mut InstructLabSession)) -> Result<()> {
        {
            let mut sessions = sync::write(&self.sessions);
            let session = sessions
                .get_mut(uid)
                .ok_or_else(|| OrchestratorError::not_found("instructlab session", uid))?;
            apply(session);
        }
        self.notify();
        Ok(())
    }

    fn notify(&self) {
        self.notifier.notify(self.sessions());
    }
}

impl Default for InstructLabRegistry {
    fn default() -> Self {
        Self::new()
    }
}
