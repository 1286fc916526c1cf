use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use api_types::{Labels, ModelInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::file_watcher::FileWatcher;
use crate::core::catalog::{CatalogManager, ModelsManager, Recipe};
use crate::core::sync;
use crate::core::{OrchestratorError, Result, UpdateNotifier};

/// On-disk catalog format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
    #[serde(default)]
    pub recipes: Vec<Recipe>,
}

/// Models and recipes read from a JSON file, for a Podman running on the
/// same host as the orchestrator.
///
/// Model files are expected under `models_dir/<model id>/` unless the
/// catalog entry names its file. The engine sees host paths as they are, so
/// "uploading" a model only checks that its file exists.
pub struct LocalCatalog {
    path: PathBuf,
    models_dir: PathBuf,
    data: RwLock<CatalogFile>,
    notifier: UpdateNotifier<()>,
}

impl LocalCatalog {
    pub fn load(path: impl Into<PathBuf>, models_dir: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = read_catalog(&path)?;
        info!(
            path = %path.display(),
            models = data.models.len(),
            recipes = data.recipes.len(),
            "Catalog loaded"
        );
        Ok(Self {
            path,
            models_dir: models_dir.into(),
            data: RwLock::new(data),
            notifier: UpdateNotifier::new(),
        })
    }

    /// Re-reads the file. The previous content stays when it fails to parse.
    pub fn reload(&self) -> Result<()> {
        let data = read_catalog(&self.path)?;
        {
            let mut current = sync::write(&self.data);
            if *current == data {
                debug!("Catalog unchanged");
                return Ok(());
            }
            *current = data;
        }
        info!(path = %self.path.display(), "Catalog reloaded");
        self.notifier.notify(());
        Ok(())
    }

    /// Reloads the catalog whenever its file changes, until cancelled.
    #[tracing::instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn watch(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let (_watcher, mut changes) = FileWatcher::new(&self.path)?;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                change = changes.recv() => {
                    if change.is_none() {
                        break;
                    }
                    if let Err(e) = self.reload() {
                        warn!("Failed to reload catalog: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    /// Where the file of `model` lives on this host.
    pub fn model_path(&self, model: &ModelInfo) -> PathBuf {
        if let Some(file) = &model.file {
            return Path::new(&file.path).join(&file.file);
        }
        let file_name = model
            .url
            .as_deref()
            .and_then(|url| url.rsplit('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.gguf", model.id));
        self.models_dir.join(&model.id).join(file_name)
    }

    fn local_model(&self, model: &ModelInfo, operation: &str) -> Result<PathBuf> {
        let path = self.model_path(model);
        if path.is_file() {
            Ok(path)
        } else {
            Err(OrchestratorError::external(
                operation,
                format!("model {} is not available at {}", model.id, path.display()),
            ))
        }
    }
}

fn read_catalog(path: &Path) -> Result<CatalogFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| OrchestratorError::external(format!("read catalog {}", path.display()), e))?;
    serde_json::from_str(&content).map_err(|e| OrchestratorError::InvalidInput {
        message: format!("catalog {} is malformed: {e}", path.display()),
    })
}

impl CatalogManager for LocalCatalog {
    fn get_recipe_by_id(&self, recipe_id: &str) -> Option<Recipe> {
        sync::read(&self.data)
            .recipes
            .iter()
            .find(|r| r.id == recipe_id)
            .cloned()
    }

    fn get_model_by_id(&self, model_id: &str) -> Option<ModelInfo> {
        sync::read(&self.data)
            .models
            .iter()
            .find(|m| m.id == model_id)
            .cloned()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<()> {
        self.notifier.subscribe()
    }
}

#[async_trait]
impl ModelsManager for LocalCatalog {
    fn get_model_info(&self, model_id: &str) -> Option<ModelInfo> {
        self.get_model_by_id(model_id)
    }

    fn is_model_on_disk(&self, model_id: &str) -> bool {
        self.get_model_by_id(model_id)
            .is_some_and(|model| self.model_path(&model).is_file())
    }

    async fn upload_model(&self, model: &ModelInfo, _labels: &Labels) -> Result<PathBuf> {
        self.local_model(model, "upload model")
    }

    async fn request_download_model(&self, model: &ModelInfo, _labels: &Labels) -> Result<PathBuf> {
        self.local_model(model, "download model")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::testing::{model, recipe};

    fn write_catalog(path: &Path, catalog: &CatalogFile) {
        std::fs::write(path, serde_json::to_string_pretty(catalog).unwrap()).unwrap();
    }

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        write_catalog(
            &path,
            &CatalogFile {
                models: vec![model("granite")],
                recipes: vec![recipe("chatbot")],
            },
        );
        (dir, path)
    }

    #[test]
    fn entries_are_looked_up_by_id() {
        let (dir, path) = fixture();
        let catalog = LocalCatalog::load(&path, dir.path().join("models")).unwrap();

        assert_eq!(catalog.get_model_by_id("granite"), Some(model("granite")));
        assert_eq!(catalog.get_recipe_by_id("chatbot"), Some(recipe("chatbot")));
        assert_eq!(catalog.get_model_by_id("mistral"), None);
    }

    #[test]
    fn malformed_catalogs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            LocalCatalog::load(&path, dir.path()),
            Err(OrchestratorError::InvalidInput { .. })
        ));
        assert!(matches!(
            LocalCatalog::load(dir.path().join("missing.json"), dir.path()),
            Err(OrchestratorError::ExternalOperation { .. })
        ));
    }

    #[tokio::test]
    async fn models_are_found_under_the_models_directory() {
        let (dir, path) = fixture();
        let models_dir = dir.path().join("models");
        let catalog = LocalCatalog::load(&path, &models_dir).unwrap();
        let granite = model("granite");
        let expected = models_dir.join("granite").join("granite.gguf");

        assert_eq!(catalog.model_path(&granite), expected);
        assert!(!catalog.is_model_on_disk("granite"));
        assert!(catalog.upload_model(&granite, &Labels::new()).await.is_err());

        std::fs::create_dir_all(expected.parent().unwrap()).unwrap();
        std::fs::write(&expected, b"gguf").unwrap();

        assert!(catalog.is_model_on_disk("granite"));
        assert_eq!(catalog.upload_model(&granite, &Labels::new()).await.unwrap(), expected);
        assert_eq!(
            catalog.request_download_model(&granite, &Labels::new()).await.unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn reloads_notify_only_on_change() {
        let (dir, path) = fixture();
        let catalog = LocalCatalog::load(&path, dir.path()).unwrap();
        let mut changes = catalog.subscribe();

        catalog.reload().unwrap();
        assert!(changes.try_recv().is_err());

        write_catalog(
            &path,
            &CatalogFile {
                models: vec![model("granite"), model("mistral")],
                recipes: vec![],
            },
        );
        catalog.reload().unwrap();

        assert!(changes.try_recv().is_ok());
        assert!(catalog.get_model_by_id("mistral").is_some());
        assert!(catalog.get_recipe_by_id("chatbot").is_none());
    }

    #[tokio::test]
    async fn file_changes_are_picked_up() {
        let (dir, path) = fixture();
        let catalog = Arc::new(LocalCatalog::load(&path, dir.path()).unwrap());
        let mut changes = catalog.subscribe();
        let token = CancellationToken::new();
        let watch = tokio::spawn(Arc::clone(&catalog).watch(token.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        write_catalog(
            &path,
            &CatalogFile {
                models: vec![model("mistral")],
                recipes: vec![],
            },
        );

        let changed = tokio::time::timeout(Duration::from_secs(5), changes.recv()).await;
        assert!(matches!(changed, Ok(Some(()))));
        assert!(catalog.get_model_by_id("mistral").is_some());

        token.cancel();
        watch.await.unwrap().unwrap();
    }
}
