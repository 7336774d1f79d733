use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Push suppression for one user in one conversation.
/// `muted_until = None` mutes indefinitely.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ConversationMute {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub muted_until: Option<DateTime<Utc>>,
}

impl ConversationMute {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.muted_until.map_or(true, |until| until > now)
    }
}
