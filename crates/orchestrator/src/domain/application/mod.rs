//! Recipe application engines, one per runtime.
//!
//! Starting a recipe is always asynchronous: [`spawn_tracked_start`] creates
//! the master task, returns a tracking id right away and settles the task
//! once the runtime specific pipeline finishes.

pub mod kubernetes;
pub mod podman;

use std::future::Future;
use std::sync::Arc;

use api_types::{Labels, ModelInfo, TaskState};
use tracing::{info, warn};

pub use kubernetes::KubernetesApplicationManager;
pub use podman::PodmanApplicationManager;

use crate::core::catalog::{CatalogManager, Recipe};
use crate::core::types::{TASK_LABEL_RECIPE_PULLING, TASK_LABEL_TRACKING_ID};
use crate::core::{OrchestratorError, Result, TaskRegistry};

pub const TASK_LABEL_RECIPE_ID: &str = "recipe-id";
pub const TASK_LABEL_MODEL_ID: &str = "model-id";

/// Labels correlating the tasks of one recipe/model pair.
pub fn pair_labels(recipe_id: &str, model_id: &str) -> Labels {
    Labels::from([
        (TASK_LABEL_RECIPE_ID.to_string(), recipe_id.to_string()),
        (TASK_LABEL_MODEL_ID.to_string(), model_id.to_string()),
    ])
}

/// `labels` extended with the pair labels.
pub fn with_pair_labels(labels: &Labels, recipe_id: &str, model_id: &str) -> Labels {
    let mut labels = labels.clone();
    labels.extend(pair_labels(recipe_id, model_id));
    labels
}

/// Looks up the recipe and the model of a start request.
pub fn resolve(catalog: &dyn CatalogManager, recipe_id: &str, model_id: &str) -> Result<(Recipe, ModelInfo)> {
    let recipe = catalog
        .get_recipe_by_id(recipe_id)
        .ok_or_else(|| OrchestratorError::not_found("recipe", recipe_id))?;
    let model = catalog
        .get_model_by_id(model_id)
        .ok_or_else(|| OrchestratorError::not_found("model", model_id))?;
    Ok((recipe, model))
}

/// Creates the master task of a recipe start and runs `start` in the
/// background with the tracking labels. Returns the tracking id.
pub fn spawn_tracked_start<F, Fut>(tasks: &Arc<TaskRegistry>, recipe: &Recipe, start: F) -> String
where
    F: FnOnce(Labels) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let tracking_id = uuid::Uuid::new_v4().simple().to_string();
    let labels = Labels::from([(TASK_LABEL_TRACKING_ID.to_string(), tracking_id.clone())]);

    let mut master_labels = labels.clone();
    master_labels.insert(TASK_LABEL_RECIPE_PULLING.to_string(), recipe.id.clone());
    let mut task = tasks.create_task(format!("Pulling {} recipe", recipe.name), TaskState::Loading, master_labels);

    let pipeline = start(labels);
    let tasks = Arc::clone(tasks);
    let recipe_name = recipe.name.clone();
    tokio::spawn(async move {
        match pipeline.await {
            Ok(()) => {
                info!(recipe = %recipe_name, "Recipe started");
                tasks.succeed(&mut task);
            }
            Err(e) => {
                warn!(recipe = %recipe_name, "Recipe failed to start: {e}");
                tasks.fail(&mut task, format!("Something went wrong while pulling {recipe_name}: {e}"));
            }
        }
    });
    tracking_id
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testing::{eventually, recipe};

    #[tokio::test]
    async fn master_task_follows_the_pipeline() {
        let tasks = Arc::new(TaskRegistry::new());

        let ok = spawn_tracked_start(&tasks, &recipe("chatbot"), |labels| async move {
            assert!(labels.contains_key(TASK_LABEL_TRACKING_ID));
            Ok(())
        });
        let failed = spawn_tracked_start(&tasks, &recipe("summarizer"), |_| async {
            Err(OrchestratorError::external("build", "boom"))
        });

        let state_of = |tracking_id: &str| {
            tasks
                .get_tasks_by_labels(&Labels::from([(TASK_LABEL_TRACKING_ID.to_string(), tracking_id.to_string())]))
                .first()
                .map(|t| t.state)
        };
        assert!(eventually(|| state_of(&ok) == Some(TaskState::Success)).await);
        assert!(eventually(|| state_of(&failed) == Some(TaskState::Error)).await);

        let master = &tasks.get_tasks()[1];
        assert_eq!(master.labels[TASK_LABEL_RECIPE_PULLING], "summarizer");
        assert!(master.error.as_deref().unwrap().contains("Recipe summarizer"));
    }
}
