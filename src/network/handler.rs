use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, trace};

use super::protocol::{Message, MessageKind};

/// Callback invoked with `(peer_id, data)` for every message of its kind.
///
/// Handlers run on the receiving connection's task, so a slow handler delays
/// the frames queued behind it on that connection.
pub type MessageHandler = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Shared table of message handlers, one per kind
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: Arc<RwLock<HashMap<MessageKind, MessageHandler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    /// Returns true if a handler was replaced.
    pub async fn register(&self, kind: impl Into<MessageKind>, handler: MessageHandler) -> bool {
        let kind = kind.into().normalized();
        self.handlers.write().await.insert(kind, handler).is_some()
    }

    pub async fn get(&self, kind: &MessageKind) -> Option<MessageHandler> {
        self.handlers.read().await.get(kind).cloned()
    }

    pub async fn contains(&self, kind: &MessageKind) -> bool {
        self.handlers.read().await.contains_key(kind)
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }

    /// Hand a decoded message to its handler.
    ///
    /// Returns false when no handler is registered for the message kind. A
    /// panicking handler is logged and treated as handled so one bad payload
    /// cannot take the connection down.
    pub async fn dispatch(&self, peer_id: &str, message: Message) -> bool {
        // Clone out of the lock; user code never runs while it is held
        let Some(handler) = self.get(&message.kind).await else {
            trace!("No handler for message type {} from {}", message.kind, peer_id);
            return false;
        };

        let kind = message.kind;
        let data = message.data;
        if panic::catch_unwind(AssertUnwindSafe(|| handler(peer_id, data))).is_err() {
            error!("Handler for {} panicked on message from {}", kind, peer_id);
        }
        true
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable").finish_non_exhaustive()
    }
}
