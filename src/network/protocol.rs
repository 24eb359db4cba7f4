use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Error types for framing and message decoding
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Frame of {length} bytes exceeds the limit of {max} bytes")]
    FrameTooLong { length: usize, max: usize },

    #[error("Message type must not be empty")]
    EmptyType,
}

/// Message kinds known to the platform.
///
/// The wire keeps the free-form `type` string; anything not listed here is
/// carried as `Custom` so application features can still register handlers
/// for their own kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Liveness check
    Ping,
    /// Answer to a ping
    Pong,
    /// A post being synchronized between peers
    Post,
    /// A comment attached to a post
    Comment,
    /// Request to connect two users
    ConnectionRequest,
    /// Any other wire type
    Custom(String),
}

impl MessageKind {
    /// The wire-level `type` string
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Post => "post",
            MessageKind::Comment => "comment",
            MessageKind::ConnectionRequest => "connection_request",
            MessageKind::Custom(kind) => kind,
        }
    }

    /// Collapse a `Custom` value that spells a known kind into that kind.
    pub fn normalized(self) -> Self {
        match self {
            MessageKind::Custom(kind) => MessageKind::from(kind),
            known => known,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }
}

impl From<&str> for MessageKind {
    fn from(value: &str) -> Self {
        match value {
            "ping" => MessageKind::Ping,
            "pong" => MessageKind::Pong,
            "post" => MessageKind::Post,
            "comment" => MessageKind::Comment,
            "connection_request" => MessageKind::ConnectionRequest,
            other => MessageKind::Custom(other.to_string()),
        }
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ping" | "pong" | "post" | "comment" | "connection_request" => {
                MessageKind::from(value.as_str())
            }
            _ => MessageKind::Custom(value),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Custom(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single wire message: `{"type": .., "timestamp": .., "data": ..}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message type, used to pick the handler
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Seconds since the Unix epoch at the time the sender built the message
    #[serde(default)]
    pub timestamp: f64,
    /// Payload understood only by the handler for `kind`
    #[serde(default)]
    pub data: Value,
}

impl Message {
    /// Create a message stamped with the current time
    pub fn new(kind: impl Into<MessageKind>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp: unix_timestamp(),
            data,
        }
    }

    /// Reject messages that could never be dispatched
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.kind.is_empty() {
            return Err(ProtocolError::EmptyType);
        }
        Ok(())
    }
}

/// Current time as fractional seconds since the Unix epoch
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}
