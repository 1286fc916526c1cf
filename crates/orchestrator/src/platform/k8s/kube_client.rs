use std::path::{Path, PathBuf};

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

use super::KubernetesError;

/// Context name reported when no kubeconfig describes the connection.
pub const IN_CLUSTER_CONTEXT: &str = "in-cluster";

pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<KubernetesError>> {
    let client = match kubeconfig {
        Some(kubeconfig_path) => {
            let kubeconfig = read_kubeconfig(&kubeconfig_path)?;

            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: format!(
                        "Failed to create config from kubeconfig: {}",
                        kubeconfig_path.display()
                    ),
                })?;

            Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
                message: "Failed to create Kubernetes client from custom kubeconfig".to_string(),
            })?
        }
        None => {
            // Use default configuration (in-cluster or ~/.kube/config)
            Client::try_default()
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: "Failed to create Kubernetes client".to_string(),
                })?
        }
    };
    Ok(client)
}

/// Name of the context the client talks to.
pub fn current_context(kubeconfig: Option<&Path>) -> String {
    let config = match kubeconfig {
        Some(path) => read_kubeconfig(path).ok(),
        None => Kubeconfig::read().ok(),
    };
    config
        .and_then(|config| config.current_context)
        .unwrap_or_else(|| IN_CLUSTER_CONTEXT.to_string())
}

fn read_kubeconfig(path: &Path) -> Result<Kubeconfig, Report<KubernetesError>> {
    Kubeconfig::read_from(path).change_context(KubernetesError::ConnectionFailed {
        message: format!("Failed to read kubeconfig file: {}", path.display()),
    })
}
