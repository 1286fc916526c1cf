use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::{info, warn};

use super::file_watcher::FileWatcher;

/// Kubeconfig the client reads: the explicit path, or `~/.kube/config`.
pub fn kubeconfig_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".kube").join("config")))
}

/// Change notifications of the kubeconfig.
///
/// When the file cannot be watched the channel is closed right away; the
/// informer then only restarts after watch failures.
pub fn watch_kubeconfig(explicit: Option<&Path>) -> (Option<FileWatcher>, mpsc::UnboundedReceiver<()>) {
    let Some(path) = kubeconfig_path(explicit) else {
        warn!("No kubeconfig location known, kubeconfig changes are not watched");
        return idle();
    };
    match FileWatcher::new(&path) {
        Ok((watcher, changes)) => {
            info!(path = %path.display(), "Watching kubeconfig");
            (Some(watcher), changes)
        }
        Err(e) => {
            warn!(path = %path.display(), "Failed to watch kubeconfig: {e}");
            idle()
        }
    }
}

fn idle() -> (Option<FileWatcher>, mpsc::UnboundedReceiver<()>) {
    let (_, rx) = mpsc::unbounded_channel();
    (None, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_kubeconfig_wins() {
        assert_eq!(
            kubeconfig_path(Some(Path::new("/etc/kube/admin.conf"))),
            Some(PathBuf::from("/etc/kube/admin.conf"))
        );
    }

    #[test]
    fn missing_directories_close_the_channel() {
        let (watcher, mut changes) = watch_kubeconfig(Some(Path::new("/nonexistent/dir/config")));

        assert!(watcher.is_none());
        assert!(matches!(changes.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }
}
