//! Kubernetes integration module.
//!
//! The main components are:
//! - [`KubeCluster`]: namespaced pod/service/PVC operations and port forwarding
//! - [`KubernetesPodRegistry`]: informer over the pods labelled `creator=podman-ai-lab`
//! - [`PodInformerEvent`]: what the informer publishes

pub mod cluster;
pub mod kube_client;
pub mod pod_informer;
pub mod types;

pub use cluster::{ForwardTarget, KubeCluster, KubernetesApi, PortForwarder};
pub use pod_informer::KubernetesPodRegistry;
pub use types::{KubernetesError, PodInformerEvent};
