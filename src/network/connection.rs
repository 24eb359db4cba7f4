use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::time::{self, Duration};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::codec::{Frame, MessageCodec};
use super::handler::HandlerTable;
use super::protocol::{Message, ProtocolError};
use super::registry::{ConnectionRegistry, PeerId};

const WRITER_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Unique identifier for a single TCP connection
pub type ConnectionId = Uuid;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),

    #[error("Connection to {0} is closed")]
    Closed(PeerId),
}

/// Status of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Closing,
    Closed,
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Snapshot of a connection's identity, for callers outside the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub connection_id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub direction: Direction,
}

/// Send side of a peer connection.
///
/// The registry and senders share it through an `Arc`; the receive side is
/// owned by the connection's [`PeerWorker`].
#[derive(Debug)]
pub struct PeerHandle {
    id: ConnectionId,
    peer_id: PeerId,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    direction: Direction,
    /// Writes are serialized here so concurrent sends never interleave frames
    writer: Mutex<FramedWrite<OwnedWriteHalf, MessageCodec>>,
    status: watch::Sender<ConnectionStatus>,
    shutdown: CancellationToken,
}

impl PeerHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            connection_id: self.id,
            remote_addr: self.remote_addr,
            local_addr: self.local_addr,
            direction: self.direction,
        }
    }

    /// Encode and write one message to the peer.
    ///
    /// A write blocked on a peer that stopped reading is abandoned as soon as
    /// the connection is closed, releasing the writer for shutdown.
    pub async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        if self.status() != ConnectionStatus::Active {
            return Err(ConnectionError::Closed(self.peer_id.clone()));
        }

        let mut writer = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(ConnectionError::Closed(self.peer_id.clone())),
            writer = self.writer.lock() => writer,
        };
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ConnectionError::Closed(self.peer_id.clone())),
            sent = writer.send(message) => sent.map_err(ConnectionError::from),
        }
    }

    /// Ask the worker to stop and shut the socket down.
    pub async fn close(&self) {
        self.status.send_if_modified(|status| {
            if *status == ConnectionStatus::Active {
                *status = ConnectionStatus::Closing;
                true
            } else {
                false
            }
        });
        self.shutdown.cancel();
        self.shutdown_writer().await;
    }

    /// Wait until the worker has fully torn the connection down
    pub async fn closed(&self) {
        let mut status = self.status.subscribe();
        // The sender lives in `self`, so this only fails if the handle is gone
        let _ = status.wait_for(|s| *s == ConnectionStatus::Closed).await;
    }

    async fn shutdown_writer(&self) {
        // A send stuck on a full socket buffer must not hold up close
        let Ok(mut writer) = time::timeout(WRITER_LOCK_TIMEOUT, self.writer.lock()).await else {
            warn!("Timed out waiting for pending write to {}", self.peer_id);
            return;
        };
        if let Err(e) = writer.get_mut().shutdown().await {
            debug!("Shutdown of connection to {} returned: {}", self.peer_id, e);
        }
    }
}

/// Receive loop for one connection.
///
/// Reads bytes into the framed buffer, decodes frames in arrival order and
/// dispatches each one before reading the next.
pub struct PeerWorker {
    handle: Arc<PeerHandle>,
    reader: FramedRead<OwnedReadHalf, MessageCodec>,
    registry: ConnectionRegistry,
    handlers: HandlerTable,
}

impl PeerWorker {
    /// Split `stream` into a shared send handle and a receive worker.
    ///
    /// The worker must be spawned only after the handle is in the registry.
    pub fn new(
        stream: TcpStream,
        peer_id: PeerId,
        direction: Direction,
        max_frame_length: usize,
        registry: ConnectionRegistry,
        handlers: HandlerTable,
    ) -> std::io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let codec = MessageCodec::with_max_frame_length(max_frame_length);
        let (status, _) = watch::channel(ConnectionStatus::Active);

        let handle = Arc::new(PeerHandle {
            id: Uuid::new_v4(),
            peer_id,
            remote_addr,
            local_addr,
            direction,
            writer: Mutex::new(FramedWrite::new(write_half, codec.clone())),
            status,
            shutdown: CancellationToken::new(),
        });

        Ok(Self {
            handle,
            reader: FramedRead::new(read_half, codec),
            registry,
            handlers,
        })
    }

    pub fn handle(&self) -> Arc<PeerHandle> {
        Arc::clone(&self.handle)
    }

    /// Run until the peer goes away or the connection is closed locally
    pub async fn run(mut self) {
        let peer_id = self.handle.peer_id.clone();
        debug!("Receive loop started for {} ({})", peer_id, self.handle.remote_addr);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.handle.shutdown.cancelled() => {
                    debug!("Connection to {} closed locally", peer_id);
                    break;
                }
                next = self.reader.next() => next,
            };

            match next {
                Some(Ok(Frame::Message(message))) => {
                    self.handlers.dispatch(&peer_id, message).await;
                }
                Some(Ok(Frame::Malformed { line, reason })) => {
                    warn!("Invalid JSON from {}: {} ({})", peer_id, line, reason);
                }
                Some(Err(e)) => {
                    warn!("Error handling messages from {}: {}", peer_id, e);
                    break;
                }
                None => {
                    debug!("Peer {} closed the connection", peer_id);
                    break;
                }
            }
        }

        self.teardown().await;
        info!("Connection to {} closed", peer_id);
    }

    async fn teardown(&self) {
        self.handle.status.send_replace(ConnectionStatus::Closing);
        // Unregister before the socket goes away so no sender picks up a dead handle
        self.registry.remove_if(&self.handle.peer_id, self.handle.id).await;
        self.handle.shutdown.cancel();
        self.handle.shutdown_writer().await;
        self.handle.status.send_replace(ConnectionStatus::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn spawn_worker(
        stream: TcpStream,
        peer_id: &str,
        registry: &ConnectionRegistry,
        handlers: &HandlerTable,
    ) -> (Arc<PeerHandle>, tokio::task::JoinHandle<()>) {
        let worker = PeerWorker::new(
            stream,
            peer_id.to_string(),
            Direction::Inbound,
            1024,
            registry.clone(),
            handlers.clone(),
        )
        .unwrap();
        let handle = worker.handle();
        registry.put(peer_id.to_string(), handle.clone()).await;
        (handle, tokio::spawn(worker.run()))
    }

    #[tokio::test]
    async fn test_frames_dispatched_in_order_and_garbage_skipped() {
        let (mut remote, local) = socket_pair().await;
        let registry = ConnectionRegistry::new();
        let handlers = HandlerTable::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handlers
            .register(
                "ping",
                Arc::new(move |peer: &str, data: Value| {
                    let _ = tx.send((peer.to_string(), data));
                }),
            )
            .await;

        let (_handle, _task) = spawn_worker(local, "remote", &registry, &handlers).await;

        remote
            .write_all(b"{\"type\":\"ping\",\"timestamp\":1,\"data\":1}\nnot json at all\n{\"type\":\"ping\",\"timestamp\":2,\"data\":2}\n")
            .await
            .unwrap();

        for expected in [json!(1), json!(2)] {
            let (peer, data) = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            assert_eq!(peer, "remote");
            assert_eq!(data, expected);
        }
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_eof_removes_entry_and_closes() {
        let (remote, local) = socket_pair().await;
        let registry = ConnectionRegistry::new();
        let handlers = HandlerTable::new();
        let (handle, task) = spawn_worker(local, "remote", &registry, &handlers).await;

        drop(remote);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert_eq!(handle.status(), ConnectionStatus::Closed);
        assert!(registry.is_empty().await);
        assert!(matches!(
            handle.send(Message::new("ping", json!({}))).await,
            Err(ConnectionError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_tears_down_connection() {
        let (mut remote, local) = socket_pair().await;
        let registry = ConnectionRegistry::new();
        let handlers = HandlerTable::new();
        let (_handle, task) = spawn_worker(local, "remote", &registry, &handlers).await;

        remote.write_all(&[b'a'; 4096]).await.unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_local_close_shuts_socket() {
        let (mut remote, local) = socket_pair().await;
        let registry = ConnectionRegistry::new();
        let handlers = HandlerTable::new();
        let (handle, _task) = spawn_worker(local, "remote", &registry, &handlers).await;

        handle.close().await;
        timeout(Duration::from_secs(5), handle.closed()).await.unwrap();

        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(5), remote.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(read, 0);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_releases_send_blocked_on_unread_peer() {
        // `_remote` is kept open but never read, so the socket buffers fill up
        let (_remote, local) = socket_pair().await;
        let registry = ConnectionRegistry::new();
        let handlers = HandlerTable::new();
        let worker = PeerWorker::new(
            local,
            "slow".to_string(),
            Direction::Outbound,
            1024 * 1024,
            registry.clone(),
            handlers.clone(),
        )
        .unwrap();
        let handle = worker.handle();
        registry.put("slow".to_string(), handle.clone()).await;
        tokio::spawn(worker.run());

        let sender = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let payload = "x".repeat(512 * 1024);
                loop {
                    if let Err(e) = handle.send(Message::new("bulk", json!(payload))).await {
                        return e;
                    }
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!sender.is_finished());

        timeout(Duration::from_secs(2), handle.close()).await.unwrap();
        let error = timeout(Duration::from_secs(2), sender).await.unwrap().unwrap();
        assert!(matches!(error, ConnectionError::Closed(_)));
        timeout(Duration::from_secs(2), handle.closed()).await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_send_writes_one_frame() {
        let (mut remote, local) = socket_pair().await;
        let registry = ConnectionRegistry::new();
        let handlers = HandlerTable::new();
        let (handle, _task) = spawn_worker(local, "remote", &registry, &handlers).await;

        handle.send(Message::new("post", json!({"id": 9}))).await.unwrap();

        let mut received = Vec::new();
        while !received.ends_with(b"\n") {
            let mut buf = [0u8; 256];
            let n = timeout(Duration::from_secs(5), remote.read(&mut buf)).await.unwrap().unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        let value: Value = serde_json::from_slice(&received).unwrap();
        assert_eq!(value["type"], "post");
        assert_eq!(value["data"], json!({"id": 9}));
        assert!(value["timestamp"].is_f64());
    }
}
