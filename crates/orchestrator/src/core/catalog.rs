//! Interfaces of the collaborators the engines depend on.
//!
//! Managing the catalog, moving model files and fetching recipe sources all
//! live outside the reconciliation core; the engines only see these traits.

use std::path::PathBuf;

use api_types::{InferenceType, Labels, ModelInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::Result;

/// A container declared by a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeContainer {
    /// Name of the application container inside the pod
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    /// True for the container serving the model
    #[serde(default)]
    pub model_service: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub backend: Option<InferenceType>,
    #[serde(default)]
    pub containers: Vec<RecipeContainer>,
}

/// An image produced by building a recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeImage {
    pub id: String,
    pub name: String,
    pub app_name: String,
    pub ports: Vec<u16>,
    pub model_service: bool,
    pub recipe_id: String,
    pub engine_id: String,
}

/// Read access to the catalog of models and recipes.
pub trait CatalogManager: Send + Sync {
    fn get_recipe_by_id(&self, recipe_id: &str) -> Option<Recipe>;

    fn get_model_by_id(&self, model_id: &str) -> Option<ModelInfo>;

    /// Fires whenever the catalog content changes.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<()>;
}

#[async_trait]
pub trait ModelsManager: Send + Sync {
    fn get_model_info(&self, model_id: &str) -> Option<ModelInfo>;

    fn is_model_on_disk(&self, model_id: &str) -> bool;

    /// Makes the model reachable by the container engine and returns its path there.
    async fn upload_model(&self, model: &ModelInfo, labels: &Labels) -> Result<PathBuf>;

    /// Ensures the model file exists locally and returns its path.
    async fn request_download_model(&self, model: &ModelInfo, labels: &Labels) -> Result<PathBuf>;
}

#[async_trait]
pub trait RecipeManager: Send + Sync {
    async fn clone_recipe(&self, recipe: &Recipe, labels: &Labels) -> Result<()>;

    async fn build_recipe(&self, recipe: &Recipe, labels: &Labels) -> Result<Vec<RecipeImage>>;
}
