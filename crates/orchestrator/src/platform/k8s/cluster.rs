use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::kube_client;
use super::KubernetesError;
use crate::core::sync;
use crate::core::{OrchestratorError, Result};

/// Pod port a local proxy forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub namespace: String,
    pub pod_name: String,
    pub port: u16,
}

/// Namespaced Kubernetes operations used by the engines and providers.
#[async_trait]
pub trait KubernetesApi: Send + Sync {
    fn namespace(&self) -> &str;

    fn current_context(&self) -> String;

    async fn create_pod(&self, pod: Pod) -> Result<Pod>;

    async fn delete_pod(&self, name: &str) -> Result<()>;

    async fn list_pvcs(&self) -> Result<Vec<PersistentVolumeClaim>>;

    async fn create_pvc(&self, pvc: PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    async fn create_service(&self, service: Service) -> Result<Service>;

    async fn delete_service(&self, name: &str) -> Result<()>;
}

/// Carries the bytes of one accepted local connection to a pod port.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    async fn forward(&self, target: &ForwardTarget, client: TcpStream) -> Result<()>;
}

struct Connection {
    client: Client,
    context: String,
}

/// kube-rs backed [`KubernetesApi`] and [`PortForwarder`].
///
/// The client is rebuilt by [`KubeCluster::reload`] when the kubeconfig changes.
pub struct KubeCluster {
    kubeconfig: Option<PathBuf>,
    namespace: String,
    connection: RwLock<Connection>,
}

impl KubeCluster {
    pub async fn connect(
        kubeconfig: Option<PathBuf>,
        namespace: String,
    ) -> std::result::Result<Self, Report<KubernetesError>> {
        let connection = Self::open(kubeconfig.clone()).await?;
        info!(context = %connection.context, %namespace, "Connected to Kubernetes");
        Ok(Self {
            kubeconfig,
            namespace,
            connection: RwLock::new(connection),
        })
    }

    /// Rebuilds the client from the kubeconfig.
    pub async fn reload(&self) -> std::result::Result<(), Report<KubernetesError>> {
        let connection = Self::open(self.kubeconfig.clone()).await?;
        info!(context = %connection.context, "Kubernetes client reloaded");
        *sync::write(&self.connection) = connection;
        Ok(())
    }

    pub fn client(&self) -> Client {
        sync::read(&self.connection).client.clone()
    }

    pub fn kubeconfig(&self) -> Option<&PathBuf> {
        self.kubeconfig.as_ref()
    }

    async fn open(
        kubeconfig: Option<PathBuf>,
    ) -> std::result::Result<Connection, Report<KubernetesError>> {
        let context = kube_client::current_context(kubeconfig.as_deref());
        let client = kube_client::init_kube_client(kubeconfig).await?;
        Ok(Connection { client, context })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client(), &self.namespace)
    }
}

fn request_failed(operation: &str, e: kube::Error) -> OrchestratorError {
    OrchestratorError::external(
        operation,
        KubernetesError::RequestFailed {
            message: e.to_string(),
        },
    )
}

#[async_trait]
impl KubernetesApi for KubeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn current_context(&self) -> String {
        sync::read(&self.connection).context.clone()
    }

    async fn create_pod(&self, pod: Pod) -> Result<Pod> {
        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| request_failed("create pod", e))
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.pods()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| request_failed("delete pod", e))?;
        Ok(())
    }

    async fn list_pvcs(&self) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client(), &self.namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| request_failed("list persistent volume claims", e))?;
        Ok(list.items)
    }

    async fn create_pvc(&self, pvc: PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client(), &self.namespace);
        api.create(&PostParams::default(), &pvc)
            .await
            .map_err(|e| request_failed("create persistent volume claim", e))
    }

    async fn create_service(&self, service: Service) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client(), &self.namespace);
        api.create(&PostParams::default(), &service)
            .await
            .map_err(|e| request_failed("create service", e))
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client(), &self.namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| request_failed("delete service", e))?;
        Ok(())
    }
}

#[async_trait]
impl PortForwarder for KubeCluster {
    async fn forward(&self, target: &ForwardTarget, mut client: TcpStream) -> Result<()> {
        let forward_failed = |message: String| {
            OrchestratorError::external(
                "port forward",
                KubernetesError::PortForwardFailed {
                    pod_name: target.pod_name.clone(),
                    port: target.port,
                    message,
                },
            )
        };

        let pods: Api<Pod> = Api::namespaced(self.client(), &target.namespace);
        let mut forwarder = pods
            .portforward(&target.pod_name, &[target.port])
            .await
            .map_err(|e| forward_failed(e.to_string()))?;
        let mut upstream = forwarder
            .take_stream(target.port)
            .ok_or_else(|| forward_failed("port stream unavailable".to_string()))?;

        let copied = tokio::io::copy_bidirectional(&mut client, &mut upstream)
            .await
            .map_err(|e| forward_failed(e.to_string()))?;
        debug!(pod = %target.pod_name, sent = copied.0, received = copied.1, "Forwarded connection closed");

        drop(upstream);
        forwarder
            .join()
            .await
            .map_err(|e| forward_failed(e.to_string()))?;
        Ok(())
    }
}
