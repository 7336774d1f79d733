use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};

use crate::presence::{ConnectionId, GroupKey};

pub mod dispatcher;
pub mod events;
pub mod message_types;
pub mod pubsub;
pub mod session;
pub mod transport;

pub use dispatcher::{BroadcastDispatcher, Outbound};
pub use events::ServerEvent;
pub use session::{ConversationSession, InboxSession, SessionHooks, SessionState};

/// Write side of one socket. Frames queued here are written by the
/// connection's transport task, so sending never waits on the network.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    sender: UnboundedSender<String>,
}

impl ConnectionHandle {
    pub fn new() -> (Self, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        (
            Self {
                id: ConnectionId::new(),
                sender: tx,
            },
            rx,
        )
    }

    /// Queue a frame for this connection only. False once the socket is gone.
    pub fn send(&self, event: &ServerEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(payload) => self.sender.send(payload).is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, event = event.event_type(), "failed to encode frame");
                false
            }
        }
    }
}

struct Subscriber {
    id: ConnectionId,
    sender: UnboundedSender<String>,
}

/// Local fan-out table: group -> sockets on this instance.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<GroupKey, Vec<Subscriber>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, group: GroupKey, handle: &ConnectionHandle) {
        let mut guard = self.inner.write().await;
        let subscribers = guard.entry(group).or_default();
        if !subscribers.iter().any(|s| s.id == handle.id) {
            subscribers.push(Subscriber {
                id: handle.id,
                sender: handle.sender.clone(),
            });
        }
        tracing::debug!(
            group = %group,
            connection_id = %handle.id,
            total = subscribers.len(),
            "registered subscriber"
        );
    }

    /// Must be called when a socket closes; empty groups are dropped.
    pub async fn unregister(&self, group: GroupKey, id: ConnectionId) {
        let mut guard = self.inner.write().await;
        if let Some(subscribers) = guard.get_mut(&group) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                guard.remove(&group);
                tracing::debug!(group = %group, "removed empty group from registry");
            }
        }
    }

    /// Send to every local subscriber of `group`, pruning dead senders.
    /// Returns how many subscribers accepted the frame.
    pub async fn broadcast(&self, group: GroupKey, msg: String) -> usize {
        let mut guard = self.inner.write().await;
        let Some(subscribers) = guard.get_mut(&group) else {
            return 0;
        };

        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.sender.send(msg.clone()).is_ok());
        let after = subscribers.len();

        if before != after {
            crate::metrics::record_broadcast_failure("closed_connection");
            tracing::debug!(
                group = %group,
                dead = before - after,
                active = after,
                "pruned dead subscribers during broadcast"
            );
        }
        if subscribers.is_empty() {
            guard.remove(&group);
        }
        after
    }

    pub async fn subscriber_count(&self, group: GroupKey) -> usize {
        let guard = self.inner.read().await;
        guard.get(&group).map(|v| v.len()).unwrap_or(0)
    }
}
