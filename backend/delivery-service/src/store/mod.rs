//! Persistence seams.
//!
//! Every status mutation is a conditional update: rows already at READ are
//! never touched, so concurrent triggers commute.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::middleware::auth::Identity;
use crate::models::{
    ConversationMute, HistoryQuery, InsertOutcome, Message, NewMessage, ReadMarker, StatusChange,
};

pub mod memory;
pub mod postgres;

pub use self::memory::InMemoryStore;
pub use self::postgres::PgStore;

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Persist a new message at DELIVERED with `delivered_at = created_at`.
    /// A repeated `(conversation_id, client_id)` yields the existing row.
    async fn insert_message(&self, new: NewMessage) -> AppResult<InsertOutcome>;

    async fn get_message(&self, id: i64) -> AppResult<Option<Message>>;

    /// Promote messages in `conversation_id` not sent by `reader_id` with
    /// `id <= up_to` and status below READ. At most `limit` rows (lowest ids
    /// first) when given. Returns the changes ordered by id.
    async fn promote_read(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
        up_to: i64,
        limit: Option<i64>,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<StatusChange>>;

    /// Number of rows `promote_read` would change (no limit).
    async fn count_promotable(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
        up_to: i64,
    ) -> AppResult<i64>;

    /// Stamp `delivered_at` on inbound rows still missing it, lowest ids
    /// first, at most `limit`. Returns the stamped ids ascending.
    async fn mark_delivered(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
        limit: i64,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<i64>>;

    async fn max_message_id(&self, conversation_id: Uuid) -> AppResult<Option<i64>>;

    /// Highest id in the conversation not authored by `user_id`.
    async fn latest_inbound_id(&self, conversation_id: Uuid, user_id: Uuid)
        -> AppResult<Option<i64>>;

    async fn last_message(&self, conversation_id: Uuid) -> AppResult<Option<Message>>;

    /// Page of messages, always returned in ascending id order.
    async fn history(&self, conversation_id: Uuid, query: HistoryQuery)
        -> AppResult<Vec<Message>>;

    /// Unread counts for `user_id` in each of `conversation_ids` (missing means zero).
    async fn unread_counts(
        &self,
        user_id: Uuid,
        conversation_ids: &[Uuid],
    ) -> AppResult<Vec<(Uuid, i64)>>;
}

#[async_trait]
pub trait ReadMarkerRepository: Send + Sync {
    async fn read_marker(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Option<i64>>;

    /// Raise the marker to `last_read_id` if it is higher; created lazily.
    /// Returns the effective value.
    async fn advance_read_marker(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        last_read_id: i64,
    ) -> AppResult<i64>;

    async fn markers_for_conversation(&self, conversation_id: Uuid) -> AppResult<Vec<ReadMarker>>;

    /// Markers with a positive value, optionally scoped to one conversation, ordered for stable sweeps.
    async fn list_markers(&self, conversation_id: Option<Uuid>) -> AppResult<Vec<ReadMarker>>;
}

/// Authorization and viewer-set lookups.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn conversation_exists(&self, conversation_id: Uuid) -> AppResult<bool>;

    /// Participant, extra member, or an active delegated team member.
    async fn is_authorized(&self, conversation_id: Uuid, identity: &Identity) -> AppResult<bool>;

    /// Users who receive inbox fan-out: both participants, extra members
    /// and owners of delegated teams. Deduplicated, order preserved.
    async fn viewer_ids(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>>;

    async fn conversations_for(&self, user_id: Uuid) -> AppResult<Vec<Uuid>>;

    async fn record_last_message(
        &self,
        conversation_id: Uuid,
        at: DateTime<Utc>,
        preview: &str,
    ) -> AppResult<()>;

    async fn mute(&self, mute: ConversationMute) -> AppResult<()>;

    async fn unmute(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()>;

    /// Subset of `user_ids` with an active mute on the conversation.
    async fn muted_users(
        &self,
        conversation_id: Uuid,
        user_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> AppResult<Vec<Uuid>>;
}

pub(crate) fn dedup_preserving_order(ids: impl IntoIterator<Item = Uuid>) -> Vec<Uuid> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
