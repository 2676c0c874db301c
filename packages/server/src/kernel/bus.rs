//! In-process pub/sub of lifecycle events with per-client mailboxes.
//!
//! Each connected client gets its own bounded broadcast channel. Publishing
//! walks the subscription table under a read lock and pushes the frame to
//! every client whose pattern set matches the channel; a full mailbox drops
//! that client's oldest frames (broadcast ring semantics) without ever
//! blocking the publisher or delaying other clients.
//!
//! Patterns are either literal channel names or the wildcard `*`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// One event as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct EventFrame {
    pub channel: String,
    pub payload: Value,
}

/// Well-known channel names.
pub mod channels {
    pub const JOB_CREATED: &str = "job:created";
    pub const JOB_STARTED: &str = "job:started";
    pub const JOB_PROGRESS: &str = "job:progress";
    pub const JOB_COMPLETED: &str = "job:completed";
    pub const JOB_FAILED: &str = "job:failed";
    pub const JOB_CANCELLED: &str = "job:cancelled";
    pub const RETRY_SCHEDULED: &str = "retry:scheduled";
    pub const RETRY_MAX_ATTEMPTS: &str = "retry:max-attempts";
    pub const PIPELINE_STATUS: &str = "pipeline:status";
    pub const SYSTEM_STATUS: &str = "system:status";
    pub const ACTIVITY_NEW: &str = "activity:new";
}

struct ClientMailbox {
    patterns: HashSet<String>,
    tx: broadcast::Sender<EventFrame>,
}

/// Default bound on undelivered frames per client.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Stateless multiplexer of lifecycle events.
pub struct EventBus {
    clients: RwLock<HashMap<Uuid, ClientMailbox>>,
    mailbox_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_mailbox_capacity(DEFAULT_MAILBOX_CAPACITY)
    }

    pub fn with_mailbox_capacity(capacity: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            mailbox_capacity: capacity.max(1),
        }
    }

    /// Register a client with no subscriptions yet. The returned receiver
    /// is the client's mailbox; dropping it without [`EventBus::disconnect`]
    /// leaves a dead entry until disconnect is called.
    pub async fn register(&self, client_id: Uuid) -> broadcast::Receiver<EventFrame> {
        let (tx, rx) = broadcast::channel(self.mailbox_capacity);
        self.clients.write().await.insert(
            client_id,
            ClientMailbox {
                patterns: HashSet::new(),
                tx,
            },
        );
        rx
    }

    /// Add channel patterns for a client. Unknown clients are ignored.
    pub async fn subscribe(&self, client_id: Uuid, patterns: &[String]) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(&client_id) {
            client.patterns.extend(patterns.iter().cloned());
        }
    }

    /// Remove the given patterns, or all of them when `patterns` is `None`.
    pub async fn unsubscribe(&self, client_id: Uuid, patterns: Option<&[String]>) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(&client_id) {
            match patterns {
                Some(patterns) => {
                    for pattern in patterns {
                        client.patterns.remove(pattern);
                    }
                }
                None => client.patterns.clear(),
            }
        }
    }

    /// Drop a client and all of its subscriptions.
    pub async fn disconnect(&self, client_id: Uuid) {
        self.clients.write().await.remove(&client_id);
    }

    /// Fire-and-forget publish to every matching subscriber.
    pub async fn publish(&self, channel: &str, payload: Value) {
        let frame = EventFrame {
            channel: channel.to_string(),
            payload,
        };
        let clients = self.clients.read().await;
        for client in clients.values() {
            if client.patterns.iter().any(|p| pattern_matches(p, channel)) {
                // Send errors mean the receiver is gone; disconnect cleans up.
                let _ = client.tx.send(frame.clone());
            }
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle used across workers and the gateway.
pub type SharedEventBus = Arc<EventBus>;

fn pattern_matches(pattern: &str, channel: &str) -> bool {
    pattern == "*" || pattern == channel
}
