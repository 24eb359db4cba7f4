use futures::future::join_all;
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::NetworkConfig;
use super::connection::{Direction, PeerInfo, PeerWorker};
use super::handler::HandlerTable;
use super::nat::{IgdSearch, NatTraversal};
use super::protocol::{Message, MessageKind};
use super::registry::{ConnectionRegistry, PeerId};

const LISTEN_BACKLOG: u32 = 128;

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Failed to bind to address {addr}: {source}")]
    BindError {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Node is already running")]
    AlreadyRunning,
}

/// Lifecycle of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Resources that only exist while the node is running
#[derive(Default)]
struct Lifecycle {
    local_addr: Option<SocketAddr>,
    shutdown: Option<CancellationToken>,
    accept_task: Option<JoinHandle<()>>,
    nat_task: Option<JoinHandle<()>>,
}

/// A peer-to-peer node.
///
/// Owns the listening socket, the connection registry and the handler table.
/// Share it between tasks behind an `Arc`.
pub struct Node {
    config: NetworkConfig,
    state: watch::Sender<NodeState>,
    /// Serializes start, stop and outbound registration
    lifecycle: Mutex<Lifecycle>,
    registry: ConnectionRegistry,
    handlers: HandlerTable,
    nat: Arc<NatTraversal>,
}

impl Node {
    /// Create a stopped node that maps ports through UPnP when enabled
    pub fn new(config: NetworkConfig) -> Self {
        let nat = NatTraversal::new(IgdSearch::new(config.upnp_search_timeout))
            .with_description(config.upnp_description.clone());
        Self::with_nat(config, nat)
    }

    /// Create a stopped node using a caller-supplied NAT helper
    pub fn with_nat(config: NetworkConfig, nat: NatTraversal) -> Self {
        let (state, _) = watch::channel(NodeState::Stopped);
        Self {
            config,
            state,
            lifecycle: Mutex::new(Lifecycle::default()),
            registry: ConnectionRegistry::new(),
            handlers: HandlerTable::new(),
            nat: Arc::new(nat),
        }
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == NodeState::Running
    }

    /// NAT helper, exposing whether a port mapping is active
    pub fn nat(&self) -> &NatTraversal {
        &self.nat
    }

    /// Address the listener is bound to, while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.local_addr
    }

    /// Bind the listener, start accepting peers and request a port mapping.
    pub async fn start(&self) -> Result<(), NodeError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state() != NodeState::Stopped {
            return Err(NodeError::AlreadyRunning);
        }
        self.state.send_replace(NodeState::Starting);

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.tcp_port);
        let (listener, local_addr) = match bind_listener(addr) {
            Ok(bound) => bound,
            Err(source) => {
                self.state.send_replace(NodeState::Stopped);
                return Err(NodeError::BindError { addr, source });
            }
        };

        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            shutdown.clone(),
            self.registry.clone(),
            self.handlers.clone(),
            self.config.clone(),
        ));

        lifecycle.local_addr = Some(local_addr);
        lifecycle.shutdown = Some(shutdown);
        lifecycle.accept_task = Some(accept_task);
        self.state.send_replace(NodeState::Running);
        info!("P2P node started on port {}", local_addr.port());

        if self.config.enable_upnp {
            let nat = Arc::clone(&self.nat);
            let port = local_addr.port();
            lifecycle.nat_task = Some(tokio::spawn(async move {
                nat.request_port_mapping(port).await;
            }));
        }

        Ok(())
    }

    /// Close the listener and every connection. A no-op when already stopped.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state() == NodeState::Stopped {
            return;
        }
        self.state.send_replace(NodeState::Stopping);

        if let Some(shutdown) = lifecycle.shutdown.take() {
            shutdown.cancel();
        }
        if let Some(accept_task) = lifecycle.accept_task.take() {
            if let Err(e) = accept_task.await {
                error!("Accept loop ended abnormally: {}", e);
            }
        }
        if let Some(nat_task) = lifecycle.nat_task.take() {
            nat_task.abort();
        }

        let connections = self.registry.drain().await;
        for (peer_id, handle) in &connections {
            debug!("Closing connection to {}", peer_id);
            handle.close().await;
        }

        lifecycle.local_addr = None;
        self.state.send_replace(NodeState::Stopped);
        info!("P2P node stopped, closed {} connections", connections.len());
    }

    /// Open an outbound connection and register it as `peer_id`.
    ///
    /// Any connection already registered under `peer_id` is closed once the
    /// new one has replaced it. Failures are logged and reported as `false`.
    pub async fn connect_to_peer(&self, address: &str, port: u16, peer_id: impl Into<PeerId>) -> bool {
        let peer_id = peer_id.into();
        if !self.is_running() {
            warn!("Cannot connect to peer {}: node is not running", peer_id);
            return false;
        }
        if self.at_capacity(&peer_id).await {
            return false;
        }

        let stream = match time::timeout(self.config.connect_timeout, TcpStream::connect((address, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Failed to connect to peer {} at {}:{}: {}", peer_id, address, port, e);
                return false;
            }
            Err(_) => {
                warn!("Timed out connecting to peer {} at {}:{}", peer_id, address, port);
                return false;
            }
        };

        // Hold the lifecycle lock so a concurrent stop cannot miss this entry
        let _lifecycle = self.lifecycle.lock().await;
        if !self.is_running() {
            warn!("Node stopped while connecting to {}", peer_id);
            return false;
        }
        // Concurrent connects may have filled the remaining slots meanwhile
        if self.at_capacity(&peer_id).await {
            return false;
        }

        let worker = match PeerWorker::new(
            stream,
            peer_id.clone(),
            Direction::Outbound,
            self.config.max_frame_length,
            self.registry.clone(),
            self.handlers.clone(),
        ) {
            Ok(worker) => worker,
            Err(e) => {
                warn!("Failed to set up connection to {}: {}", peer_id, e);
                return false;
            }
        };

        let handle = worker.handle();
        let previous = self.registry.put(peer_id.clone(), Arc::clone(&handle)).await;
        tokio::spawn(worker.run());
        info!("Connected to peer {} at {}", peer_id, handle.remote_addr());

        if let Some(previous) = previous {
            info!("Replacing earlier connection to {}", peer_id);
            previous.close().await;
        }
        true
    }

    /// True when a new outbound connection under `peer_id` would exceed the cap.
    /// Replacing an existing peer id never counts against it.
    async fn at_capacity(&self, peer_id: &str) -> bool {
        if self.registry.contains(peer_id).await
            || self.registry.len().await < self.config.max_connections
        {
            return false;
        }
        warn!(
            "Connection limit reached ({}), not connecting to {}",
            self.config.max_connections, peer_id
        );
        true
    }

    /// Send one message to a registered peer.
    ///
    /// Returns false if the peer is unknown or the write fails. A failed
    /// write leaves the peer registered; its receive loop removes it once the
    /// connection is seen to be dead.
    pub async fn send(&self, peer_id: &str, kind: impl Into<MessageKind>, data: Value) -> bool {
        let Some(handle) = self.registry.get(peer_id).await else {
            debug!("Not sending to unknown peer {}", peer_id);
            return false;
        };

        let message = Message::new(kind, data);
        match handle.send(message).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send message to {}: {}", peer_id, e);
                false
            }
        }
    }

    /// Send to every peer registered at call time; returns how many sends succeeded
    pub async fn broadcast(&self, kind: impl Into<MessageKind>, data: Value) -> usize {
        let kind = kind.into();
        let peers = self.registry.keys_snapshot().await;

        let sends = peers
            .iter()
            .map(|peer_id| self.send(peer_id, kind.clone(), data.clone()));
        let delivered = join_all(sends).await.into_iter().filter(|sent| *sent).count();

        debug!("Broadcast {} to {}/{} peers", kind, delivered, peers.len());
        delivered
    }

    /// Register the handler for `kind`, replacing any earlier one.
    /// Applies to existing and future connections.
    pub async fn add_message_handler<F>(&self, kind: impl Into<MessageKind>, handler: F)
    where
        F: Fn(&str, Value) + Send + Sync + 'static,
    {
        let kind = kind.into();
        if self.handlers.register(kind.clone(), Arc::new(handler)).await {
            debug!("Replaced handler for {}", kind);
        }
    }

    /// Peer ids currently registered
    pub async fn peers(&self) -> Vec<PeerId> {
        self.registry.keys_snapshot().await
    }

    pub async fn peer_info(&self, peer_id: &str) -> Option<PeerInfo> {
        self.registry.get(peer_id).await.map(|handle| handle.info())
    }

    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.registry.contains(peer_id).await
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("nat", &self.nat)
            .finish_non_exhaustive()
    }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<(TcpListener, SocketAddr)> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(LISTEN_BACKLOG)?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

async fn accept_loop(
    listener: TcpListener,
    shutdown: CancellationToken,
    registry: ConnectionRegistry,
    handlers: HandlerTable,
    config: NetworkConfig,
) {
    loop {
        let (stream, addr) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        if registry.len().await >= config.max_connections {
            warn!(
                "Connection limit reached ({}), rejecting connection from {}",
                config.max_connections, addr
            );
            continue;
        }

        let peer_id = format!("{}:{}", addr.ip(), addr.port());
        let worker = match PeerWorker::new(
            stream,
            peer_id.clone(),
            Direction::Inbound,
            config.max_frame_length,
            registry.clone(),
            handlers.clone(),
        ) {
            Ok(worker) => worker,
            Err(e) => {
                warn!("Failed to set up connection from {}: {}", addr, e);
                continue;
            }
        };

        let previous = registry.put(peer_id.clone(), worker.handle()).await;
        tokio::spawn(worker.run());
        info!("Accepted connection from {}", peer_id);

        if let Some(previous) = previous {
            previous.close().await;
        }
    }

    debug!("Accept loop exited");
}
