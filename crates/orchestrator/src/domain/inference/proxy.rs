//! Local TCP listeners forwarding to pod ports.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::sync;
use crate::core::{OrchestratorError, Result};
use crate::platform::k8s::{ForwardTarget, PortForwarder};

/// A running proxy. Dropping the handle closes the listener and every
/// forwarded connection.
pub struct ProxyHandle {
    local_port: u16,
    target: ForwardTarget,
    active: Arc<AtomicUsize>,
    token: CancellationToken,
}

impl ProxyHandle {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn target(&self) -> &ForwardTarget {
        &self.target
    }

    /// Connections currently forwarded.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Proxies keyed by pod uid, at most one per uid.
pub struct ProxyTable {
    forwarder: Arc<dyn PortForwarder>,
    proxies: Mutex<HashMap<String, ProxyHandle>>,
}

impl ProxyTable {
    pub fn new(forwarder: Arc<dyn PortForwarder>) -> Self {
        Self {
            forwarder,
            proxies: Mutex::new(HashMap::new()),
        }
    }

    /// Starts the proxy of `uid` unless one already runs.
    pub fn ensure(&self, uid: &str, target: ForwardTarget, local_port: u16) -> Result<()> {
        let mut proxies = sync::lock(&self.proxies);
        if let Some(existing) = proxies.get(uid) {
            warn!(
                %uid,
                local_port = existing.local_port(),
                "Proxy already running for pod, ignoring"
            );
            return Ok(());
        }
        let handle = start_proxy(self.forwarder.clone(), target, local_port)?;
        proxies.insert(uid.to_string(), handle);
        Ok(())
    }

    /// Closes the proxy of `uid` and its connections.
    pub fn remove(&self, uid: &str) -> bool {
        sync::lock(&self.proxies).remove(uid).is_some()
    }

    pub fn clear(&self) {
        sync::lock(&self.proxies).clear();
    }

    pub fn local_port(&self, uid: &str) -> Option<u16> {
        sync::lock(&self.proxies).get(uid).map(ProxyHandle::local_port)
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.proxies).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Listens on `127.0.0.1:local_port` and forwards every accepted connection
/// to `target`.
///
/// The port is bound before returning so a taken port is reported to the
/// caller.
pub fn start_proxy(
    forwarder: Arc<dyn PortForwarder>,
    target: ForwardTarget,
    local_port: u16,
) -> Result<ProxyHandle> {
    let bind_failed = |e: std::io::Error| {
        OrchestratorError::external(format!("bind proxy port {local_port}"), e)
    };
    let listener = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, local_port)))
        .map_err(bind_failed)?;
    listener.set_nonblocking(true).map_err(bind_failed)?;
    let listener = TcpListener::from_std(listener).map_err(bind_failed)?;

    let token = CancellationToken::new();
    let active = Arc::new(AtomicUsize::new(0));
    info!(local_port, pod = %target.pod_name, port = target.port, "Forwarding local port to pod");

    tokio::spawn(accept_loop(
        listener,
        forwarder,
        target.clone(),
        active.clone(),
        token.clone(),
    ));

    Ok(ProxyHandle {
        local_port,
        target,
        active,
        token,
    })
}

async fn accept_loop(
    listener: TcpListener,
    forwarder: Arc<dyn PortForwarder>,
    target: ForwardTarget,
    active: Arc<AtomicUsize>,
    token: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, pod = %target.pod_name, "Accepted proxy connection");
                    let forwarder = forwarder.clone();
                    let target = target.clone();
                    let active = active.clone();
                    active.fetch_add(1, Ordering::SeqCst);
                    connections.spawn(async move {
                        if let Err(e) = forwarder.forward(&target, stream).await {
                            warn!(pod = %target.pod_name, "Proxy connection failed: {e}");
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(e) => warn!(pod = %target.pod_name, "Failed to accept proxy connection: {e}"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    // aborted connections never reach their decrement
    connections.shutdown().await;
    active.store(0, Ordering::SeqCst);
    debug!(pod = %target.pod_name, "Proxy closed");
}
