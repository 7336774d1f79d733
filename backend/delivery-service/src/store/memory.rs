use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{dedup_preserving_order, ConversationDirectory, MessageRepository, ReadMarkerRepository};
use crate::error::{AppError, AppResult};
use crate::middleware::auth::Identity;
use crate::models::{
    ConversationMute, DeliveryStatus, HistoryQuery, InsertOutcome, Message, NewMessage,
    ReadMarker, StatusChange,
};

#[derive(Debug, Clone)]
struct ConversationRecord {
    user_a: Uuid,
    user_b: Uuid,
    member_users: Vec<Uuid>,
    member_teams: Vec<Uuid>,
    last_message_at: Option<DateTime<Utc>>,
    last_message_preview: String,
}

#[derive(Debug, Clone, Copy)]
struct TeamMember {
    owner_id: Uuid,
    is_active: bool,
}

#[derive(Default)]
struct MemoryState {
    last_message_id: i64,
    messages: BTreeMap<i64, Message>,
    markers: HashMap<(Uuid, Uuid), ReadMarker>,
    conversations: HashMap<Uuid, ConversationRecord>,
    teams: HashMap<Uuid, TeamMember>,
    mutes: HashMap<(Uuid, Uuid), ConversationMute>,
    fail_writes: bool,
}

impl MemoryState {
    fn check_writable(&self) -> AppResult<()> {
        if self.fail_writes {
            return Err(AppError::Database("store is rejecting writes".into()));
        }
        Ok(())
    }

    fn inbound<'a>(
        &'a self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> impl Iterator<Item = &'a Message> + 'a {
        self.messages
            .values()
            .filter(move |m| m.conversation_id == conversation_id && m.sender_id != user_id)
    }

    fn promotable_ids(&self, conversation_id: Uuid, reader_id: Uuid, up_to: i64) -> Vec<i64> {
        self.inbound(conversation_id, reader_id)
            .filter(|m| m.id <= up_to && !m.is_read())
            .map(|m| m.id)
            .collect()
    }
}

/// Store used by tests and `STORE_BACKEND=memory`.
///
/// Implements every repository trait over one lock so multi-row updates are
/// atomic, the way a single SQL statement is.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_conversation(&self, user_a: Uuid, user_b: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        self.state.write().await.conversations.insert(
            id,
            ConversationRecord {
                user_a,
                user_b,
                member_users: Vec::new(),
                member_teams: Vec::new(),
                last_message_at: None,
                last_message_preview: String::new(),
            },
        );
        id
    }

    pub async fn add_member(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        let mut state = self.state.write().await;
        let conv = state
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;
        conv.member_users.push(user_id);
        Ok(())
    }

    /// Register a team member acting on behalf of `owner_id`; returns its id.
    pub async fn add_team_member(&self, owner_id: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        self.state.write().await.teams.insert(
            id,
            TeamMember {
                owner_id,
                is_active: true,
            },
        );
        id
    }

    pub async fn set_team_member_active(&self, team_member_id: Uuid, active: bool) {
        if let Some(team) = self.state.write().await.teams.get_mut(&team_member_id) {
            team.is_active = active;
        }
    }

    pub async fn delegate_to_team(&self, conversation_id: Uuid, team_member_id: Uuid) -> AppResult<()> {
        let mut state = self.state.write().await;
        let conv = state
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;
        conv.member_teams.push(team_member_id);
        Ok(())
    }

    /// Insert a row that predates delivery stamping (`delivered_at` null),
    /// as imported or legacy data looks.
    pub async fn insert_undelivered(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        body: &str,
    ) -> Message {
        let mut state = self.state.write().await;
        state.last_message_id += 1;
        let now = Utc::now();
        let message = Message {
            id: state.last_message_id,
            conversation_id,
            sender_id,
            body: body.to_string(),
            attachment_name: None,
            attachment_mime: None,
            attachment_size: None,
            client_id: None,
            delivery_status: DeliveryStatus::Delivered.as_i16(),
            delivered_at: None,
            read_at: None,
            created_at: now,
        };
        state.messages.insert(message.id, message.clone());
        message
    }

    /// Put a row back to DELIVERED, the state left behind when a bulk update
    /// loses a race with the marker write.
    pub async fn revert_to_delivered(&self, message_id: i64) -> AppResult<()> {
        let mut state = self.state.write().await;
        let m = state
            .messages
            .get_mut(&message_id)
            .ok_or(AppError::NotFound)?;
        m.delivery_status = DeliveryStatus::Delivered.as_i16();
        m.read_at = None;
        Ok(())
    }

    /// Make message inserts, promotions and marker writes fail until reset.
    pub async fn set_failing_writes(&self, failing: bool) {
        self.state.write().await.fail_writes = failing;
    }

    pub async fn messages_in(&self, conversation_id: Uuid) -> Vec<Message> {
        self.state
            .read()
            .await
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub async fn last_message_preview(&self, conversation_id: Uuid) -> Option<String> {
        self.state
            .read()
            .await
            .conversations
            .get(&conversation_id)
            .map(|c| c.last_message_preview.clone())
    }
}

#[async_trait]
impl MessageRepository for InMemoryStore {
    async fn insert_message(&self, new: NewMessage) -> AppResult<InsertOutcome> {
        let mut state = self.state.write().await;
        state.check_writable()?;
        if !state.conversations.contains_key(&new.conversation_id) {
            return Err(AppError::NotFound);
        }

        if let Some(client_id) = new.client_id.as_deref() {
            let existing = state.messages.values().find(|m| {
                m.conversation_id == new.conversation_id && m.client_id.as_deref() == Some(client_id)
            });
            if let Some(existing) = existing {
                return Ok(InsertOutcome::Duplicate(existing.clone()));
            }
        }

        state.last_message_id += 1;
        let attachment = new.attachment.unwrap_or_default();
        let message = Message {
            id: state.last_message_id,
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            body: new.body,
            attachment_name: Some(attachment.name).filter(|n| !n.is_empty()),
            attachment_mime: attachment.mime,
            attachment_size: attachment.size,
            client_id: new.client_id,
            delivery_status: DeliveryStatus::Delivered.as_i16(),
            delivered_at: Some(new.created_at),
            read_at: None,
            created_at: new.created_at,
        };
        state.messages.insert(message.id, message.clone());
        Ok(InsertOutcome::Inserted(message))
    }

    async fn get_message(&self, id: i64) -> AppResult<Option<Message>> {
        Ok(self.state.read().await.messages.get(&id).cloned())
    }

    async fn promote_read(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
        up_to: i64,
        limit: Option<i64>,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<StatusChange>> {
        let mut state = self.state.write().await;
        state.check_writable()?;
        let mut ids = state.promotable_ids(conversation_id, reader_id, up_to);
        if let Some(limit) = limit {
            ids.truncate(limit.max(0) as usize);
        }

        let mut changes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(m) = state.messages.get_mut(&id) {
                if m.promote_to_read(at) {
                    changes.push(m.status_change());
                }
            }
        }
        Ok(changes)
    }

    async fn count_promotable(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
        up_to: i64,
    ) -> AppResult<i64> {
        let state = self.state.read().await;
        Ok(state.promotable_ids(conversation_id, reader_id, up_to).len() as i64)
    }

    async fn mark_delivered(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
        limit: i64,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<i64>> {
        let mut state = self.state.write().await;
        let ids: Vec<i64> = state
            .inbound(conversation_id, recipient_id)
            .filter(|m| m.delivered_at.is_none())
            .take(limit.max(0) as usize)
            .map(|m| m.id)
            .collect();

        let mut stamped = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(m) = state.messages.get_mut(&id) {
                if m.stamp_delivered(at) {
                    stamped.push(id);
                }
            }
        }
        Ok(stamped)
    }

    async fn max_message_id(&self, conversation_id: Uuid) -> AppResult<Option<i64>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .values()
            .rev()
            .find(|m| m.conversation_id == conversation_id)
            .map(|m| m.id))
    }

    async fn latest_inbound_id(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<i64>> {
        let state = self.state.read().await;
        Ok(state.inbound(conversation_id, user_id).map(|m| m.id).max())
    }

    async fn last_message(&self, conversation_id: Uuid) -> AppResult<Option<Message>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .values()
            .rev()
            .find(|m| m.conversation_id == conversation_id)
            .cloned())
    }

    async fn history(&self, conversation_id: Uuid, query: HistoryQuery) -> AppResult<Vec<Message>> {
        let state = self.state.read().await;
        let limit = query.limit.max(0) as usize;
        let in_conv = state
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id);

        let page: Vec<Message> = match (query.after, query.before) {
            (Some(after), _) => in_conv.filter(|m| m.id > after).take(limit).cloned().collect(),
            (None, Some(before)) => {
                let mut newest: Vec<Message> = in_conv
                    .filter(|m| m.id < before)
                    .rev()
                    .take(limit)
                    .cloned()
                    .collect();
                newest.reverse();
                newest
            }
            (None, None) => {
                let mut newest: Vec<Message> = in_conv.rev().take(limit).cloned().collect();
                newest.reverse();
                newest
            }
        };
        Ok(page)
    }

    async fn unread_counts(
        &self,
        user_id: Uuid,
        conversation_ids: &[Uuid],
    ) -> AppResult<Vec<(Uuid, i64)>> {
        let state = self.state.read().await;
        let counts = conversation_ids
            .iter()
            .map(|conv| {
                let marker = state
                    .markers
                    .get(&(*conv, user_id))
                    .map(|m| m.last_read_message_id)
                    .unwrap_or(0);
                let count = state
                    .inbound(*conv, user_id)
                    .filter(|m| m.id > marker)
                    .count() as i64;
                (*conv, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect();
        Ok(counts)
    }
}

#[async_trait]
impl ReadMarkerRepository for InMemoryStore {
    async fn read_marker(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Option<i64>> {
        let state = self.state.read().await;
        Ok(state
            .markers
            .get(&(conversation_id, user_id))
            .map(|m| m.last_read_message_id))
    }

    async fn advance_read_marker(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        last_read_id: i64,
    ) -> AppResult<i64> {
        let mut state = self.state.write().await;
        state.check_writable()?;
        let marker = state
            .markers
            .entry((conversation_id, user_id))
            .or_insert_with(|| ReadMarker {
                conversation_id,
                user_id,
                last_read_message_id: 0,
                updated_at: Utc::now(),
            });
        if last_read_id > marker.last_read_message_id {
            marker.last_read_message_id = last_read_id;
            marker.updated_at = Utc::now();
        }
        Ok(marker.last_read_message_id)
    }

    async fn markers_for_conversation(&self, conversation_id: Uuid) -> AppResult<Vec<ReadMarker>> {
        let state = self.state.read().await;
        Ok(state
            .markers
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn list_markers(&self, conversation_id: Option<Uuid>) -> AppResult<Vec<ReadMarker>> {
        let state = self.state.read().await;
        let mut markers: Vec<ReadMarker> = state
            .markers
            .values()
            .filter(|m| m.last_read_message_id > 0)
            .filter(|m| conversation_id.map_or(true, |c| m.conversation_id == c))
            .cloned()
            .collect();
        markers.sort_by_key(|m| (m.conversation_id, m.user_id));
        Ok(markers)
    }
}

#[async_trait]
impl ConversationDirectory for InMemoryStore {
    async fn conversation_exists(&self, conversation_id: Uuid) -> AppResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .conversations
            .contains_key(&conversation_id))
    }

    async fn is_authorized(&self, conversation_id: Uuid, identity: &Identity) -> AppResult<bool> {
        let state = self.state.read().await;
        let Some(conv) = state.conversations.get(&conversation_id) else {
            return Ok(false);
        };
        let user = identity.user_id;
        if conv.user_a == user || conv.user_b == user || conv.member_users.contains(&user) {
            return Ok(true);
        }
        Ok(identity.team_member_id.map_or(false, |team_id| {
            conv.member_teams.contains(&team_id)
                && state.teams.get(&team_id).map_or(false, |t| t.is_active)
        }))
    }

    async fn viewer_ids(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        let state = self.state.read().await;
        let conv = state
            .conversations
            .get(&conversation_id)
            .ok_or(AppError::NotFound)?;
        let owners = conv
            .member_teams
            .iter()
            .filter_map(|team_id| state.teams.get(team_id))
            .filter(|t| t.is_active)
            .map(|t| t.owner_id);
        Ok(dedup_preserving_order(
            [conv.user_a, conv.user_b]
                .into_iter()
                .chain(conv.member_users.iter().copied())
                .chain(owners),
        ))
    }

    async fn conversations_for(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let state = self.state.read().await;
        let mut ids: Vec<Uuid> = state
            .conversations
            .iter()
            .filter(|(_, c)| {
                c.user_a == user_id
                    || c.user_b == user_id
                    || c.member_users.contains(&user_id)
                    || c.member_teams.iter().any(|team_id| {
                        state
                            .teams
                            .get(team_id)
                            .map_or(false, |t| t.is_active && t.owner_id == user_id)
                    })
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn record_last_message(
        &self,
        conversation_id: Uuid,
        at: DateTime<Utc>,
        preview: &str,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        if let Some(conv) = state.conversations.get_mut(&conversation_id) {
            conv.last_message_at = Some(at);
            conv.last_message_preview = preview.to_string();
        }
        Ok(())
    }

    async fn mute(&self, mute: ConversationMute) -> AppResult<()> {
        let mut state = self.state.write().await;
        state
            .mutes
            .insert((mute.conversation_id, mute.user_id), mute);
        Ok(())
    }

    async fn unmute(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        self.state
            .write()
            .await
            .mutes
            .remove(&(conversation_id, user_id));
        Ok(())
    }

    async fn muted_users(
        &self,
        conversation_id: Uuid,
        user_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> AppResult<Vec<Uuid>> {
        let state = self.state.read().await;
        Ok(user_ids
            .iter()
            .copied()
            .filter(|u| {
                state
                    .mutes
                    .get(&(conversation_id, *u))
                    .map_or(false, |m| m.is_active(now))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(conversation_id: Uuid, sender_id: Uuid, client_id: Option<&str>) -> NewMessage {
        NewMessage {
            conversation_id,
            sender_id,
            body: "hello".into(),
            client_id: client_id.map(str::to_string),
            attachment: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_is_delivered_and_idempotent_per_client_id() {
        let store = InMemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = store.create_conversation(a, b).await;

        let first = store
            .insert_message(new_message(conv, a, Some("c-1")))
            .await
            .unwrap();
        let InsertOutcome::Inserted(m) = first else {
            panic!("expected insert");
        };
        assert_eq!(m.status(), DeliveryStatus::Delivered);
        assert!(m.delivered_at.is_some());
        assert!(m.read_at.is_none());

        let again = store
            .insert_message(new_message(conv, a, Some("c-1")))
            .await
            .unwrap();
        assert!(matches!(again, InsertOutcome::Duplicate(ref d) if d.id == m.id));
        assert_eq!(store.messages_in(conv).await.len(), 1);
    }

    #[tokio::test]
    async fn promote_read_skips_own_and_already_read_rows() {
        let store = InMemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = store.create_conversation(a, b).await;

        let m1 = store.insert_message(new_message(conv, a, None)).await.unwrap();
        let _own = store.insert_message(new_message(conv, b, None)).await.unwrap();
        let m3 = store.insert_message(new_message(conv, a, None)).await.unwrap();

        let changes = store
            .promote_read(conv, b, m3.message().id, None, Utc::now())
            .await
            .unwrap();
        let ids: Vec<i64> = changes.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![m1.message().id, m3.message().id]);

        let again = store
            .promote_read(conv, b, m3.message().id, None, Utc::now())
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn markers_never_move_backwards() {
        let store = InMemoryStore::new();
        let (conv, user) = (Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(store.advance_read_marker(conv, user, 10).await.unwrap(), 10);
        assert_eq!(store.advance_read_marker(conv, user, 4).await.unwrap(), 10);
        assert_eq!(store.read_marker(conv, user).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn viewers_include_members_and_active_team_owners() {
        let store = InMemoryStore::new();
        let (a, b, extra, owner) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let conv = store.create_conversation(a, b).await;
        store.add_member(conv, extra).await.unwrap();
        store.add_member(conv, a).await.unwrap();
        let team = store.add_team_member(owner).await;
        store.delegate_to_team(conv, team).await.unwrap();

        assert_eq!(store.viewer_ids(conv).await.unwrap(), vec![a, b, extra, owner]);

        store.set_team_member_active(team, false).await;
        assert_eq!(store.viewer_ids(conv).await.unwrap(), vec![a, b, extra]);
    }

    #[tokio::test]
    async fn team_owners_see_delegated_conversations_while_active() {
        let store = InMemoryStore::new();
        let (a, b, owner) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let conv = store.create_conversation(a, b).await;
        let team = store.add_team_member(owner).await;
        store.delegate_to_team(conv, team).await.unwrap();

        assert!(store.viewer_ids(conv).await.unwrap().contains(&owner));
        assert_eq!(store.conversations_for(owner).await.unwrap(), vec![conv]);

        store.set_team_member_active(team, false).await;
        assert!(store.conversations_for(owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_pages_are_ascending() {
        let store = InMemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = store.create_conversation(a, b).await;
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.insert_message(new_message(conv, a, None)).await.unwrap().message().id);
        }

        let q = |after, before, limit| HistoryQuery { after, before, limit };
        let page: Vec<i64> = store.history(conv, q(Some(ids[1]), None, 2)).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(page, vec![ids[2], ids[3]]);

        let page: Vec<i64> = store.history(conv, q(None, Some(ids[4]), 2)).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(page, vec![ids[2], ids[3]]);

        let page: Vec<i64> = store.history(conv, q(None, None, 3)).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(page, vec![ids[2], ids[3], ids[4]]);
    }
}
