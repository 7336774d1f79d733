use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppResult;
use crate::store::{ConversationDirectory, MessageRepository};

/// Unread badges, computed live from messages and read markers on every call.
#[derive(Clone)]
pub struct UnreadAggregator {
    messages: Arc<dyn MessageRepository>,
    directory: Arc<dyn ConversationDirectory>,
}

impl UnreadAggregator {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        directory: Arc<dyn ConversationDirectory>,
    ) -> Self {
        Self {
            messages,
            directory,
        }
    }

    /// Messages not authored by `user_id` above the user's marker, summed
    /// over every conversation the user can see.
    pub async fn total_unread(&self, user_id: Uuid) -> AppResult<i64> {
        Ok(self
            .by_conversation(user_id)
            .await?
            .iter()
            .map(|(_, count)| count)
            .sum())
    }

    /// Non-zero counts per conversation.
    pub async fn by_conversation(&self, user_id: Uuid) -> AppResult<Vec<(Uuid, i64)>> {
        let conversations = self.directory.conversations_for(user_id).await?;
        self.messages.unread_counts(user_id, &conversations).await
    }

    pub async fn conversation_unread(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64> {
        let counts = self
            .messages
            .unread_counts(user_id, &[conversation_id])
            .await?;
        Ok(counts
            .into_iter()
            .find(|(id, _)| *id == conversation_id)
            .map(|(_, count)| count)
            .unwrap_or(0))
    }
}
