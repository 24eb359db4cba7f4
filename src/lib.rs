//! Peer-to-peer layer of a decentralized social platform.
//!
//! A [`Node`] listens for peers, keeps a registry of live connections and
//! exchanges newline-delimited JSON messages with them. Incoming messages are
//! dispatched to handlers registered per message type. On start the node
//! asks the local router for a UPnP port mapping, best effort.

pub mod config;
pub mod network;
pub mod utils;

pub use config::{Config, ConfigError};
pub use network::{
    ConnectionRegistry, Message, MessageKind, NatTraversal, NetworkConfig, Node, NodeError,
    NodeState, PeerId,
};
