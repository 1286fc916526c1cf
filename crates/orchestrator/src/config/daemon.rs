use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::core::types::K8S_DEFAULT_NAMESPACE;
use crate::core::ReconcileConfig;

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "AI_LAB_LISTEN_ADDR",
        default_value = "127.0.0.1:10434",
        help = "HTTP API server listen address"
    )]
    pub listen_addr: String,

    #[arg(
        long,
        env = "CONTAINER_HOST_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the Podman API socket (defaults to $XDG_RUNTIME_DIR/podman/podman.sock)"
    )]
    pub podman_socket: Option<PathBuf>,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "AI_LAB_K8S_NAMESPACE",
        default_value = K8S_DEFAULT_NAMESPACE,
        help = "Kubernetes namespace the orchestrator creates its pods in"
    )]
    pub k8s_namespace: String,

    #[arg(
        long,
        env = "AI_LAB_ENABLE_K8S",
        help = "Manage inference servers and applications on Kubernetes",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_k8s: bool,

    #[arg(
        long,
        env = "AI_LAB_ENABLE_PODMAN",
        help = "Manage inference servers and applications on Podman",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_podman: bool,

    #[arg(
        long,
        env = "AI_LAB_CATALOG",
        value_hint = clap::ValueHint::FilePath,
        default_value = "catalog.json",
        help = "JSON catalog of models and recipes"
    )]
    pub catalog_path: PathBuf,

    #[arg(
        long,
        env = "AI_LAB_MODELS_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = "models",
        help = "Directory holding one sub-directory per model"
    )]
    pub models_dir: PathBuf,

    #[arg(
        long,
        env = "AI_LAB_USAGE_LOG",
        value_hint = clap::ValueHint::FilePath,
        help = "Daily rotated file receiving usage events, e.g. /var/log/ai-lab/usage.log"
    )]
    pub usage_log_file: Option<PathBuf>,

    #[arg(
        long,
        env = "AI_LAB_LLAMACPP_IMAGE",
        help = "Image used for llama.cpp inference servers on Podman"
    )]
    pub llamacpp_image: Option<String>,

    #[arg(
        long,
        default_value_t = 10,
        help = "Seconds between two status polls of an inference server container"
    )]
    pub poll_interval_secs: u64,

    #[arg(
        long,
        default_value_t = 10,
        help = "Seconds between two health checks of the application pods"
    )]
    pub health_tick_secs: u64,

    #[arg(
        long,
        default_value_t = 3,
        help = "Refresh attempts when the catalog changes"
    )]
    pub refresh_retries: u32,
}

impl DaemonArgs {
    /// The explicit socket, or the rootless Podman socket of the current user.
    pub fn podman_socket_path(&self) -> PathBuf {
        if let Some(socket) = &self.podman_socket {
            return socket.clone();
        }
        std::env::var_os("XDG_RUNTIME_DIR")
            .map(|dir| PathBuf::from(dir).join("podman").join("podman.sock"))
            .unwrap_or_else(|| PathBuf::from("/run/podman/podman.sock"))
    }
}

impl From<&DaemonArgs> for ReconcileConfig {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            poll_interval: Duration::from_secs(args.poll_interval_secs.max(1)),
            refresh_retries: args.refresh_retries,
            health_interval: Duration::from_secs(args.health_tick_secs.max(1)),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn parse(args: &[&str]) -> DaemonArgs {
        DaemonArgs::try_parse_from(std::iter::once("daemon").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn timings_default_to_the_reconciliation_defaults() {
        let args = parse(&[]);
        let config = ReconcileConfig::from(&args);
        let defaults = ReconcileConfig::default();

        assert_eq!(config.poll_interval, defaults.poll_interval);
        assert_eq!(config.health_interval, defaults.health_interval);
        assert_eq!(config.refresh_retries, defaults.refresh_retries);
        assert_eq!(config.retry_backoff, defaults.retry_backoff);
    }

    #[test]
    fn runtimes_can_be_disabled() {
        let args = parse(&["--enable-k8s", "false", "--poll-interval-secs", "0", "--refresh-retries", "5"]);
        let config = ReconcileConfig::from(&args);

        assert!(!args.enable_k8s);
        assert!(args.enable_podman);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.refresh_retries, 5);
    }

    #[test]
    fn explicit_socket_wins() {
        let args = parse(&["--podman-socket", "/tmp/podman.sock"]);

        assert_eq!(args.podman_socket_path(), PathBuf::from("/tmp/podman.sock"));
    }
}
