//! Cross-instance fan-out over Redis pub/sub.
//!
//! Every locally dispatched frame is also published with the origin instance
//! id; listeners on other instances re-broadcast it to their own sockets.

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::dispatcher::BroadcastError;
use super::ConnectionRegistry;
use crate::presence::GroupKey;

pub const FANOUT_CHANNEL: &str = "delivery:fanout";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelayEnvelope {
    origin: Uuid,
    group: String,
    payload: String,
}

/// Publishing half of the relay.
///
/// Frames are queued and drained by one publisher task, so they reach Redis
/// in dispatch order without the caller waiting on the round trip.
#[derive(Clone)]
pub struct PubSubRelay {
    queue: mpsc::UnboundedSender<String>,
    instance_id: Uuid,
}

impl PubSubRelay {
    /// Start the relay along with its publisher task.
    pub fn new(conn: ConnectionManager, instance_id: Uuid) -> Self {
        let (relay, rx) = Self::queued(instance_id);
        tokio::spawn(run_publisher(conn, rx));
        relay
    }

    fn queued(instance_id: Uuid) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (queue, rx) = mpsc::unbounded_channel();
        (Self { queue, instance_id }, rx)
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn enqueue(&self, group: GroupKey, payload: String) -> Result<(), BroadcastError> {
        let envelope = RelayEnvelope {
            origin: self.instance_id,
            group: group.to_string(),
            payload,
        };
        let encoded = serde_json::to_string(&envelope)
            .map_err(|e| BroadcastError::Serialization(e.to_string()))?;
        self.queue
            .send(encoded)
            .map_err(|_| BroadcastError::Relay("publisher task stopped".into()))
    }
}

async fn run_publisher(mut conn: ConnectionManager, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(encoded) = rx.recv().await {
        if let Err(e) = conn.publish::<_, _, ()>(FANOUT_CHANNEL, encoded).await {
            crate::metrics::record_broadcast_failure("relay_publish");
            tracing::warn!(channel = FANOUT_CHANNEL, error = %e, "relay publish failed");
        }
    }
    tracing::info!("relay publisher stopped");
}

/// Re-broadcast frames published by other instances. Returns when the
/// subscription ends; callers restart it.
#[allow(deprecated)]
pub async fn start_relay_listener(
    client: redis::Client,
    registry: ConnectionRegistry,
    instance_id: Uuid,
) -> redis::RedisResult<()> {
    // PubSub requires a dedicated connection, not multiplexed
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.subscribe(FANOUT_CHANNEL).await?;
    tracing::info!(channel = FANOUT_CHANNEL, %instance_id, "relay listener subscribed");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let raw: String = match msg.get_payload() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable relay payload");
                continue;
            }
        };
        if let Some((group, payload)) = decode_foreign(&raw, instance_id) {
            registry.broadcast(group, payload).await;
        }
    }
    Ok(())
}

/// Envelope from another instance, or `None` for our own echoes and garbage.
fn decode_foreign(raw: &str, instance_id: Uuid) -> Option<(GroupKey, String)> {
    let envelope: RelayEnvelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "malformed relay envelope");
            return None;
        }
    };
    if envelope.origin == instance_id {
        return None;
    }
    match envelope.group.parse::<GroupKey>() {
        Ok(group) => Some((group, envelope.payload)),
        Err(e) => {
            tracing::warn!(error = %e, "relay envelope with bad group");
            None
        }
    }
}
