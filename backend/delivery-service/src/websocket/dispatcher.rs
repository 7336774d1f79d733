use super::events::ServerEvent;
use super::pubsub::PubSubRelay;
use super::ConnectionRegistry;
use crate::presence::GroupKey;

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("failed to serialize event: {0}")]
    Serialization(String),

    #[error("failed to publish to relay: {0}")]
    Relay(String),
}

/// One event and the groups it goes to.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub targets: Vec<GroupKey>,
    pub event: ServerEvent,
}

impl Outbound {
    pub fn to(group: GroupKey, event: ServerEvent) -> Self {
        Self {
            targets: vec![group],
            event,
        }
    }
}

/// Best-effort fan-out. Never fails the caller: local delivery is a
/// non-blocking channel send per socket, relay frames go through an ordered queue.
#[derive(Clone, Default)]
pub struct BroadcastDispatcher {
    registry: ConnectionRegistry,
    relay: Option<PubSubRelay>,
}

impl BroadcastDispatcher {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            registry,
            relay: None,
        }
    }

    pub fn with_relay(mut self, relay: PubSubRelay) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Deliver in order. Failures are logged and counted, never returned.
    pub async fn dispatch(&self, outbound: Vec<Outbound>) {
        for item in outbound {
            if let Err(e) = self.dispatch_one(&item).await {
                crate::metrics::record_broadcast_failure("serialization");
                tracing::warn!(event = item.event.event_type(), error = %e, "dropping event");
            }
        }
    }

    async fn dispatch_one(&self, item: &Outbound) -> Result<(), BroadcastError> {
        let payload = serde_json::to_string(&item.event)
            .map_err(|e| BroadcastError::Serialization(e.to_string()))?;
        crate::metrics::record_broadcast(item.event.event_type());

        for group in &item.targets {
            let delivered = self.registry.broadcast(*group, payload.clone()).await;
            tracing::trace!(
                group = %group,
                event = item.event.event_type(),
                delivered,
                "dispatched"
            );
            if let Some(relay) = &self.relay {
                if let Err(e) = relay.enqueue(*group, payload.clone()) {
                    crate::metrics::record_broadcast_failure("relay_enqueue");
                    tracing::warn!(group = %group, error = %e, "relay enqueue failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::ConnectionHandle;
    use uuid::Uuid;

    #[tokio::test]
    async fn dispatch_preserves_order_per_group() {
        let registry = ConnectionRegistry::new();
        let dispatcher = BroadcastDispatcher::new(registry.clone());
        let group = GroupKey::Conversation(Uuid::new_v4());
        let (handle, mut rx) = ConnectionHandle::new();
        registry.register(group, &handle).await;

        dispatcher
            .dispatch(vec![
                Outbound::to(group, ServerEvent::delivered(1)),
                Outbound::to(group, ServerEvent::delivered(2)),
            ])
            .await;

        let first: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let second: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["id"], 1);
        assert_eq!(second["id"], 2);
    }

    #[tokio::test]
    async fn dispatch_to_empty_group_is_a_no_op() {
        let dispatcher = BroadcastDispatcher::default();
        dispatcher
            .dispatch(vec![Outbound::to(
                GroupKey::Inbox(Uuid::new_v4()),
                ServerEvent::Pong,
            )])
            .await;
    }
}
