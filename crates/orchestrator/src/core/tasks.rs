//! User visible tasks.
//!
//! Each long-running operation creates one task in `loading` state up front
//! and drives it to `success` or `error` whatever path it takes.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use api_types::{Labels, Task, TaskState};
use tokio::sync::mpsc;

use crate::core::sync;
use crate::core::UpdateNotifier;

pub struct TaskRegistry {
    tasks: RwLock<Vec<Task>>,
    next_id: AtomicU64,
    notifier: UpdateNotifier<Vec<Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            notifier: UpdateNotifier::new(),
        }
    }

    pub fn create_task(&self, name: impl Into<String>, state: TaskState, labels: Labels) -> Task {
        let task = Task {
            id: format!("task-{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            state,
            labels,
            error: None,
        };
        sync::write(&self.tasks).push(task.clone());
        self.notify();
        task
    }

    /// Replaces the stored task with the same id. Unknown ids are ignored.
    pub fn update_task(&self, task: &Task) {
        let updated = {
            let mut tasks = sync::write(&self.tasks);
            match tasks.iter_mut().find(|t| t.id == task.id) {
                Some(existing) => {
                    *existing = task.clone();
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify();
        } else {
            tracing::debug!(task_id = %task.id, "Ignoring update of unknown task");
        }
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        sync::read(&self.tasks).iter().find(|t| t.id == id).cloned()
    }

    pub fn get_tasks(&self) -> Vec<Task> {
        sync::read(&self.tasks).clone()
    }

    /// Tasks carrying every label of `labels`.
    pub fn get_tasks_by_labels(&self, labels: &Labels) -> Vec<Task> {
        sync::read(&self.tasks)
            .iter()
            .filter(|task| has_labels(task, labels))
            .cloned()
            .collect()
    }

    pub fn delete_by_labels(&self, labels: &Labels) {
        let removed = {
            let mut tasks = sync::write(&self.tasks);
            let before = tasks.len();
            tasks.retain(|task| !has_labels(task, labels));
            before != tasks.len()
        };
        if removed {
            self.notify();
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<Task>> {
        self.notifier.subscribe()
    }

    pub fn succeed(&self, task: &mut Task) {
        task.state = TaskState::Success;
        self.update_task(task);
    }

    pub fn fail(&self, task: &mut Task, error: impl Display) {
        task.state = TaskState::Error;
        task.error = Some(error.to_string());
        self.update_task(task);
    }

    /// Runs `operation` under a new task named `name`, settling the task on
    /// completion.
    pub async fn track<T, E, F>(&self, name: impl Into<String>, labels: Labels, operation: F) -> Result<T, E>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        let mut task = self.create_task(name, TaskState::Loading, labels);
        let result = operation.await;
        match &result {
            Ok(_) => self.succeed(&mut task),
            Err(e) => self.fail(&mut task, e),
        }
        result
    }

    fn notify(&self) {
        self.notifier.notify(self.get_tasks());
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn has_labels(task: &Task, labels: &Labels) -> bool {
    labels
        .iter()
        .all(|(key, value)| task.labels.get(key) == Some(value))
}
