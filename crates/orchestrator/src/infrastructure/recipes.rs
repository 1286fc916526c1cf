use std::sync::Arc;

use api_types::{Labels, TaskState};
use async_trait::async_trait;
use tracing::info;

use crate::core::catalog::{Recipe, RecipeImage, RecipeManager};
use crate::core::{OrchestratorError, Result, TaskRegistry};
use crate::platform::container::ContainerEngine;

/// Engine id recorded on images nobody pulled locally.
pub const REGISTRY_ENGINE_ID: &str = "registry";

/// Recipes whose containers are published images.
///
/// There is no source checkout: a recipe is "built" by pulling the image of
/// each declared container through the container engine. Without an engine
/// the images are left for the cluster to pull.
pub struct LocalRecipeManager {
    engine: Option<Arc<dyn ContainerEngine>>,
    tasks: Arc<TaskRegistry>,
}

impl LocalRecipeManager {
    pub fn new(engine: Option<Arc<dyn ContainerEngine>>, tasks: Arc<TaskRegistry>) -> Self {
        Self { engine, tasks }
    }
}

#[async_trait]
impl RecipeManager for LocalRecipeManager {
    async fn clone_recipe(&self, recipe: &Recipe, labels: &Labels) -> Result<()> {
        let mut task = self
            .tasks
            .create_task(format!("Checking out {}", recipe.name), TaskState::Loading, labels.clone());
        if recipe.containers.is_empty() {
            let error = OrchestratorError::InvalidInput {
                message: format!("recipe {} declares no container", recipe.id),
            };
            self.tasks.fail(&mut task, &error);
            return Err(error);
        }
        self.tasks.succeed(&mut task);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(recipe = %recipe.id))]
    async fn build_recipe(&self, recipe: &Recipe, labels: &Labels) -> Result<Vec<RecipeImage>> {
        let mut images = Vec::with_capacity(recipe.containers.len());
        let engine_id = self.engine.as_ref().map_or(REGISTRY_ENGINE_ID, |e| e.id()).to_string();
        for container in &recipe.containers {
            if let Some(engine) = &self.engine {
                self.tasks
                    .track(
                        format!("Pulling {}", container.image),
                        labels.clone(),
                        engine.pull_image(&container.image),
                    )
                    .await?;
            }
            images.push(RecipeImage {
                id: container.image.clone(),
                name: container.image.clone(),
                app_name: container.name.clone(),
                ports: container.ports.clone(),
                model_service: container.model_service,
                recipe_id: recipe.id.clone(),
                engine_id: engine_id.clone(),
            });
        }
        info!(images = images.len(), "Recipe images ready");
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testing::{recipe, MockContainerEngine};

    #[tokio::test]
    async fn building_pulls_every_declared_image() {
        let engine = Arc::new(MockContainerEngine::new());
        let tasks = Arc::new(TaskRegistry::new());
        let manager = LocalRecipeManager::new(Some(engine.clone() as Arc<dyn ContainerEngine>), tasks.clone());

        let images = manager.build_recipe(&recipe("chatbot"), &Labels::new()).await.unwrap();

        assert_eq!(
            engine.calls(),
            vec![
                "pull_image:quay.io/ai-lab/chatbot-app:latest".to_string(),
                "pull_image:quay.io/ai-lab/llamacpp:latest".to_string(),
            ]
        );
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].app_name, "chatbot-app");
        assert!(images[1].model_service);
        assert!(tasks.get_tasks().iter().all(|t| t.state == TaskState::Success));
    }

    #[tokio::test]
    async fn failed_pulls_fail_the_build() {
        let engine = Arc::new(MockContainerEngine::new());
        engine.fail_on("pull_image");
        let tasks = Arc::new(TaskRegistry::new());
        let manager = LocalRecipeManager::new(Some(engine.clone() as Arc<dyn ContainerEngine>), tasks.clone());

        let result = manager.build_recipe(&recipe("chatbot"), &Labels::new()).await;

        assert!(matches!(result, Err(OrchestratorError::ExternalOperation { .. })));
        assert_eq!(engine.count_calls("pull_image"), 1);
        assert_eq!(tasks.get_tasks()[0].state, TaskState::Error);
    }

    #[tokio::test]
    async fn without_an_engine_images_are_not_pulled() {
        let tasks = Arc::new(TaskRegistry::new());
        let manager = LocalRecipeManager::new(None, tasks.clone());

        let images = manager.build_recipe(&recipe("chatbot"), &Labels::new()).await.unwrap();

        assert_eq!(images.len(), 2);
        assert!(images.iter().all(|i| i.engine_id == REGISTRY_ENGINE_ID));
        assert!(tasks.get_tasks().is_empty());
    }

    #[tokio::test]
    async fn recipes_without_containers_cannot_be_checked_out() {
        let manager = LocalRecipeManager::new(None, Arc::new(TaskRegistry::new()));
        let mut empty = recipe("empty");
        empty.containers.clear();

        assert!(manager.clone_recipe(&recipe("chatbot"), &Labels::new()).await.is_ok());
        assert!(matches!(
            manager.clone_recipe(&empty, &Labels::new()).await,
            Err(OrchestratorError::InvalidInput { .. })
        ));
    }
}
