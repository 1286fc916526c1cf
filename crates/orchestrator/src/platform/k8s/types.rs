use std::error::Error;

use k8s_openapi::api::core::v1::Pod;

/// Pod change published by the informer.
#[derive(Debug, Clone)]
pub enum PodInformerEvent {
    /// First sighting of a pod
    Add(Pod),
    /// A known pod changed
    Update(Pod),
    /// The pod is gone
    Delete(Pod),
    /// The watch failed; it is restarted automatically
    Error(String),
}

impl PodInformerEvent {
    pub fn pod(&self) -> Option<&Pod> {
        match self {
            PodInformerEvent::Add(pod)
            | PodInformerEvent::Update(pod)
            | PodInformerEvent::Delete(pod) => Some(pod),
            PodInformerEvent::Error(_) => None,
        }
    }
}

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to watch pods: {message}")]
    WatchFailed { message: String },
    #[display("Kubernetes request failed: {message}")]
    RequestFailed { message: String },
    #[display("Failed to forward port {port} of pod {pod_name}: {message}")]
    PortForwardFailed {
        pod_name: String,
        port: u16,
        message: String,
    },
}

impl Error for KubernetesError {}
