//! Typed real-time event hub.
//!
//! The transport (WebSocket, test harness, whatever) is excluded from this
//! crate; it hands raw JSON text to [`SocketManager::ingest`], which
//! validates it into a [`SocketEvent`] and fans it out to subscribers.
//! Repos attach on `init` and detach on `dispose`; peer-signaling events
//! pass through untouched for the collaboration layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::error::Result;

/// A unique identifier for a socket subscription.
pub type SocketSubscriptionId = u64;

/// Callback type for socket events.
pub type SocketCallback = Arc<dyn Fn(&SocketEvent) + Send + Sync>;

/// Server-pushed changes for one resource collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ResourceDelta {
    /// Full records to insert or overwrite.
    #[serde(default)]
    pub upsert: Vec<Value>,
    /// Ids to delete.
    #[serde(default)]
    pub remove: Vec<String>,
}

impl ResourceDelta {
    /// A delta that only upserts.
    pub fn upserts(records: Vec<Value>) -> Self {
        Self {
            upsert: records,
            remove: Vec::new(),
        }
    }

    /// A delta that only removes.
    pub fn removals(ids: Vec<String>) -> Self {
        Self {
            upsert: Vec::new(),
            remove: ids,
        }
    }
}

/// Events delivered by the real-time channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(tag = "type")]
pub enum SocketEvent {
    /// The channel came up.
    Connected,

    /// The channel went down.
    Disconnected,

    /// Another collaborator changed resources; one event may span several
    /// collections and is folded in as a single transaction.
    ResourcesChanged {
        /// Per-collection changes.
        changes: IndexMap<String, ResourceDelta>,
    },

    /// Peer-signaling payload (cursor broadcast, WebRTC negotiation).
    /// Opaque to the sync core.
    PeerSignal {
        /// Sender's peer id.
        from: String,
        /// Signal payload.
        payload: Value,
    },
}

impl SocketEvent {
    /// The event type as a string, mostly for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::ResourcesChanged { .. } => "ResourcesChanged",
            Self::PeerSignal { .. } => "PeerSignal",
        }
    }
}

/// Whether the channel is currently up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No live channel.
    Disconnected,
    /// Channel established.
    Connected,
}

/// Fan-out hub between the transport and the sync layer.
pub struct SocketManager {
    callbacks: RwLock<HashMap<SocketSubscriptionId, SocketCallback>>,
    next_id: AtomicU64,
    status: RwLock<ConnectionStatus>,
}

impl SocketManager {
    /// Create a disconnected hub.
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            status: RwLock::new(ConnectionStatus::Disconnected),
        }
    }

    /// Subscribe to socket events.
    pub fn subscribe(&self, callback: SocketCallback) -> SocketSubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks.write().unwrap().insert(id, callback);
        id
    }

    /// Remove a subscription. Returns `true` if it existed.
    pub fn unsubscribe(&self, id: SocketSubscriptionId) -> bool {
        self.callbacks.write().unwrap().remove(&id).is_some()
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap().len()
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.read().unwrap()
    }

    /// Validate raw transport text and emit the parsed event.
    ///
    /// Malformed payloads are rejected before anything observes them.
    pub fn ingest(&self, raw: &str) -> Result<()> {
        let event: SocketEvent = serde_json::from_str(raw)?;
        self.emit(&event);
        Ok(())
    }

    /// Emit an already-typed event to all subscribers.
    pub fn emit(&self, event: &SocketEvent) {
        match event {
            SocketEvent::Connected => {
                *self.status.write().unwrap() = ConnectionStatus::Connected;
            }
            SocketEvent::Disconnected => {
                *self.status.write().unwrap() = ConnectionStatus::Disconnected;
            }
            _ => {}
        }
        log::debug!("[SocketManager] emit {}", event.event_type());

        let callbacks: Vec<SocketCallback> =
            self.callbacks.read().unwrap().values().cloned().collect();
        for callback in callbacks {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event);
            }));
            if result.is_err() {
                log::warn!("[SocketManager] event callback panicked");
            }
        }
    }
}

impl Default for SocketManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SocketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketManager")
            .field("status", &self.status())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
