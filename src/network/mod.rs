mod codec;
mod connection;
mod handler;
mod nat;
mod node;
mod protocol;
mod registry;

pub use codec::{DEFAULT_MAX_FRAME_LENGTH, Frame, MessageCodec, decode_line, encode_frame};
pub use connection::{
    ConnectionError, ConnectionId, ConnectionStatus, Direction, PeerHandle, PeerInfo, PeerWorker,
};
pub use handler::{HandlerTable, MessageHandler};
pub use nat::{
    DEFAULT_MAPPING_DESCRIPTION, GatewaySearch, IgdSearch, InternetGateway, NatError,
    NatTraversal, PortMappingRequest, local_ip,
};
pub use node::{Node, NodeError, NodeState};
pub use protocol::{Message, MessageKind, ProtocolError, unix_timestamp};
pub use registry::{ConnectionRegistry, PeerId};

use std::time::Duration;

/// Configuration for the network module
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// The port to listen on for TCP connections (0 lets the OS choose)
    pub tcp_port: u16,
    /// Maximum number of concurrent connections, inbound and outbound together
    pub max_connections: usize,
    /// Ask the router for a port mapping when the node starts
    pub enable_upnp: bool,
    /// How long an outbound connect may take
    pub connect_timeout: Duration,
    /// Longest accepted frame, delimiter excluded
    pub max_frame_length: usize,
    /// Label attached to the router port mapping
    pub upnp_description: String,
    /// How long to wait for routers to answer discovery
    pub upnp_search_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tcp_port: 9999,
            max_connections: 50,
            enable_upnp: true,
            connect_timeout: Duration::from_secs(10),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            upnp_description: DEFAULT_MAPPING_DESCRIPTION.to_string(),
            upnp_search_timeout: Duration::from_secs(5),
        }
    }
}

impl NetworkConfig {
    /// Default configuration listening on `tcp_port`
    pub fn new(tcp_port: u16) -> Self {
        Self {
            tcp_port,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_upnp(mut self, enable_upnp: bool) -> Self {
        self.enable_upnp = enable_upnp;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}
