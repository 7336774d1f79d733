use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Highest message id `user_id` is known to have read in `conversation_id`.
/// Only ever moves forward.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ReadMarker {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub last_read_message_id: i64,
    pub updated_at: DateTime<Utc>,
}

/// Highest marker held by anyone other than `sender`, i.e. how far the
/// counterparts of `sender` have read.
pub fn watermark_excluding(markers: &[ReadMarker], sender: Uuid) -> i64 {
    markers
        .iter()
        .filter(|m| m.user_id != sender)
        .map(|m| m.last_read_message_id)
        .max()
        .unwrap_or(0)
}
