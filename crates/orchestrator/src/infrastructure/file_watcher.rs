use std::path::{Path, PathBuf};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::core::{OrchestratorError, Result};

/// Watches a single file for changes.
///
/// The parent directory is watched so the file can be replaced atomically
/// (editors, `kubectl config` and friends write a new file then rename it).
/// Dropping the watcher stops the notifications.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl FileWatcher {
    /// Starts watching `path`. The receiver yields once per change batch.
    pub fn new(path: &Path) -> Result<(Self, mpsc::UnboundedReceiver<()>)> {
        let path = path.to_path_buf();
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path.file_name().map(|f| f.to_os_string()).ok_or_else(|| {
            OrchestratorError::InvalidInput {
                message: format!("{} does not name a file", path.display()),
            }
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if !is_change(&event.kind) {
                        return;
                    }
                    if event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) {
                        debug!("Filesystem event: {:?}", event);
                        let _ = tx.send(());
                    }
                }
                Err(e) => {
                    error!("Filesystem watch error: {:?}", e);
                }
            },
            Config::default(),
        )
        .map_err(|e| OrchestratorError::external("create file watcher", e))?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|e| OrchestratorError::external(format!("watch {}", directory.display()), e))?;

        Ok((
            Self {
                _watcher: watcher,
                path,
            },
            rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_))
}
