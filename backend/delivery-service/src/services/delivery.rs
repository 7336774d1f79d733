//! Delivery state machine: DELIVERED(1) -> READ(2).
//!
//! Every trigger (send, open-with-peer, explicit read, catch-up) goes through
//! this service. It persists the transition with a conditional update and
//! returns the events to broadcast; callers hand those to the dispatcher.
//! Status never moves backwards: retriggering an already-applied transition
//! yields no changes and no events.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::push::PushNotification;
use super::unread::UnreadAggregator;
use crate::config::DeliveryTuning;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::Identity;
use crate::models::{
    truncate_chars, Attachment, DeliveryStatus, InsertOutcome, Message, NewMessage, StatusChange,
};
use crate::presence::{self, GroupKey, PresenceRegistry};
use crate::store::{ConversationDirectory, MessageRepository, ReadMarkerRepository};
use crate::websocket::events::TypingState;
use crate::websocket::{Outbound, ServerEvent};

/// What a client asked to send.
#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub body: String,
    pub client_id: Option<String>,
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// The message in its final state after any presence promotion.
    pub message: Message,
    /// A retried send; nothing new was persisted or broadcast.
    pub duplicate: bool,
    pub events: Vec<Outbound>,
    pub pushes: Vec<PushNotification>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOutcome {
    /// Effective marker after the read (never lower than before).
    pub last_read_id: i64,
    pub promoted: Vec<StatusChange>,
    pub events: Vec<Outbound>,
}

#[derive(Debug, Clone, Default)]
pub struct CatchUp {
    pub delivered: Vec<i64>,
    pub events: Vec<Outbound>,
}

#[derive(Debug, Clone, Default)]
pub struct InboxCatchUp {
    /// Frames for the socket that just opened, one per conversation.
    pub digests: Vec<ServerEvent>,
    /// Delivery ticks for the senders' conversation groups.
    pub events: Vec<Outbound>,
}

/// What caused a read promotion; used for metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTrigger {
    /// Client reported the last id it rendered.
    Explicit,
    /// Conversation opened while the peer had it open too.
    Open,
    /// History fetched with `mark_read`.
    History,
}

impl ReadTrigger {
    fn label(self) -> &'static str {
        match self {
            ReadTrigger::Explicit => "read",
            ReadTrigger::Open => "open",
            ReadTrigger::History => "history",
        }
    }
}

/// `message.status` events for persisted changes, at most `cap` of them.
pub fn status_events(conversation_id: Uuid, changes: &[StatusChange], cap: usize) -> Vec<Outbound> {
    changes
        .iter()
        .take(cap)
        .map(|change| {
            Outbound::to(
                GroupKey::Conversation(conversation_id),
                ServerEvent::status(change),
            )
        })
        .collect()
}

pub struct DeliveryService {
    messages: Arc<dyn MessageRepository>,
    markers: Arc<dyn ReadMarkerRepository>,
    directory: Arc<dyn ConversationDirectory>,
    presence: Arc<dyn PresenceRegistry>,
    unread: UnreadAggregator,
    tuning: DeliveryTuning,
}

impl DeliveryService {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        markers: Arc<dyn ReadMarkerRepository>,
        directory: Arc<dyn ConversationDirectory>,
        presence: Arc<dyn PresenceRegistry>,
        tuning: DeliveryTuning,
    ) -> Self {
        let unread = UnreadAggregator::new(messages.clone(), directory.clone());
        Self {
            messages,
            markers,
            directory,
            presence,
            unread,
            tuning,
        }
    }

    pub fn tuning(&self) -> &DeliveryTuning {
        &self.tuning
    }

    /// Forbidden for strangers, NotFound for unknown conversations.
    pub async fn authorize(&self, conversation_id: Uuid, identity: &Identity) -> AppResult<()> {
        if self.directory.is_authorized(conversation_id, identity).await? {
            return Ok(());
        }
        if !self.directory.conversation_exists(conversation_id).await? {
            return Err(AppError::NotFound);
        }
        Err(AppError::Forbidden)
    }

    /// Persist a message and work out its fan-out.
    ///
    /// Only the insert can fail the call. Everything after it is
    /// best-effort: the sender always gets the persisted message back.
    pub async fn send(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        draft: Draft,
    ) -> AppResult<SendOutcome> {
        let body = truncate_chars(draft.body.trim(), self.tuning.max_body_chars);
        let attachment = draft.attachment.filter(|a| !a.name.trim().is_empty());
        if body.is_empty() && attachment.is_none() {
            return Err(AppError::BadRequest("message body is empty".into()));
        }
        let client_id = draft
            .client_id
            .map(|c| truncate_chars(c.trim(), 64))
            .filter(|c| !c.is_empty());

        let now = Utc::now();
        let outcome = self
            .messages
            .insert_message(NewMessage {
                conversation_id,
                sender_id,
                body,
                client_id,
                attachment,
                created_at: now,
            })
            .await?;

        let mut message = match outcome {
            InsertOutcome::Duplicate(existing) => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    message_id = existing.id,
                    "duplicate client_id, returning existing message"
                );
                return Ok(SendOutcome {
                    message: existing,
                    duplicate: true,
                    events: Vec::new(),
                    pushes: Vec::new(),
                });
            }
            InsertOutcome::Inserted(message) => message,
        };
        crate::metrics::record_transitions("delivered", "send", 1);

        let stored_preview = truncate_chars(message.preview_source(), self.tuning.stored_preview_chars);
        if let Err(e) = self
            .directory
            .record_last_message(conversation_id, message.created_at, &stored_preview)
            .await
        {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "failed to update conversation preview");
        }

        let viewers = match self.directory.viewer_ids(conversation_id).await {
            Ok(viewers) => viewers,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "viewer lookup failed, inbox fan-out skipped");
                Vec::new()
            }
        };

        let mut present = Vec::new();
        let mut absent = Vec::new();
        for viewer in viewers.iter().copied().filter(|v| *v != sender_id) {
            match presence::user_present(self.presence.as_ref(), conversation_id, viewer).await {
                Ok(true) => present.push(viewer),
                Ok(false) => absent.push(viewer),
                Err(e) => {
                    tracing::warn!(user_id = %viewer, error = %e, "presence lookup failed");
                    absent.push(viewer);
                }
            }
        }

        let mut promoted = Vec::new();
        if !present.is_empty() {
            promoted = self.promote_on_send(&mut message, &present, now).await;
        }

        let mut events = vec![Outbound::to(
            GroupKey::Conversation(conversation_id),
            ServerEvent::chat_message(&message),
        )];
        events.extend(status_events(
            conversation_id,
            &promoted,
            self.tuning.status_broadcast_cap,
        ));

        let inbox_preview = truncate_chars(message.preview_source(), self.tuning.inbox_preview_chars);
        for viewer in viewers.iter().copied().filter(|v| *v != sender_id) {
            match self.unread.conversation_unread(conversation_id, viewer).await {
                Ok(unread_count) => events.push(Outbound::to(
                    GroupKey::Inbox(viewer),
                    ServerEvent::InboxUpdate {
                        conversation_id,
                        last_message_preview: inbox_preview.clone(),
                        last_message_at: Some(message.created_at),
                        unread_count,
                    },
                )),
                Err(e) => {
                    tracing::warn!(user_id = %viewer, error = %e, "unread count failed, inbox update skipped");
                }
            }
        }

        let pushes = self.pushes_for(&message, &absent).await;

        Ok(SendOutcome {
            message,
            duplicate: false,
            events,
            pushes,
        })
    }

    /// Recipient has the thread open: the new message is read on arrival.
    ///
    /// Older inbound rows still below the new id are promoted along with it,
    /// so every returned change needs its own status event.
    async fn promote_on_send(
        &self,
        message: &mut Message,
        readers: &[Uuid],
        at: DateTime<Utc>,
    ) -> Vec<StatusChange> {
        // Every viewer other than the sender may promote it; any present one will do.
        let reader = readers[0];
        let mut changes = match self
            .messages
            .promote_read(message.conversation_id, reader, message.id, None, at)
            .await
        {
            Ok(changes) => changes,
            Err(e) => {
                tracing::warn!(message_id = message.id, error = %e, "read promotion on send failed");
                return Vec::new();
            }
        };

        for reader in readers {
            if let Err(e) = self
                .markers
                .advance_read_marker(message.conversation_id, *reader, message.id)
                .await
            {
                tracing::warn!(user_id = %reader, error = %e, "failed to advance read marker");
            }
        }

        if let Some(own) = changes.iter().find(|c| c.id == message.id) {
            message.delivery_status = DeliveryStatus::Read.as_i16();
            message.read_at = own.read_at;
        }
        // The new message leads so the broadcast cap never drops its status.
        changes.sort_by_key(|c| c.id != message.id);
        crate::metrics::record_transitions("read", "send", changes.len());
        changes
    }

    async fn pushes_for(&self, message: &Message, recipients: &[Uuid]) -> Vec<PushNotification> {
        if recipients.is_empty() {
            return Vec::new();
        }
        let muted = match self
            .directory
            .muted_users(message.conversation_id, recipients, Utc::now())
            .await
        {
            Ok(muted) => muted,
            Err(e) => {
                tracing::warn!(error = %e, "mute lookup failed, pushing to everyone");
                Vec::new()
            }
        };

        let body = truncate_chars(message.preview_source(), self.tuning.push_preview_chars);
        let mut pushes = Vec::new();
        for user_id in recipients.iter().copied().filter(|u| !muted.contains(u)) {
            match self.unread.total_unread(user_id).await {
                Ok(unread_count) => pushes.push(PushNotification {
                    user_id,
                    conversation_id: message.conversation_id,
                    title: self.tuning.push_title.clone(),
                    body: body.clone(),
                    unread_count,
                }),
                Err(e) => tracing::warn!(user_id = %user_id, error = %e, "unread total failed, push skipped"),
            }
        }
        pushes
    }

    /// Reader has seen everything up to `up_to` (or all inbound when `None`).
    ///
    /// The mark is clamped to the newest message in the conversation so a
    /// bogus client value cannot pre-read future messages.
    pub async fn mark_read(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
        up_to: Option<i64>,
        trigger: ReadTrigger,
    ) -> AppResult<ReadOutcome> {
        let target = match up_to {
            Some(requested) => {
                let newest = self.messages.max_message_id(conversation_id).await?;
                newest.map(|max| requested.min(max))
            }
            None => {
                self.messages
                    .latest_inbound_id(conversation_id, reader_id)
                    .await?
            }
        };
        let previous = self
            .markers
            .read_marker(conversation_id, reader_id)
            .await?
            .unwrap_or(0);

        let Some(target) = target.filter(|t| *t > 0) else {
            return Ok(ReadOutcome {
                last_read_id: previous,
                ..ReadOutcome::default()
            });
        };

        let now = Utc::now();
        let promoted = self
            .messages
            .promote_read(conversation_id, reader_id, target, None, now)
            .await?;
        let last_read_id = self
            .markers
            .advance_read_marker(conversation_id, reader_id, target)
            .await?;

        crate::metrics::record_transitions("read", trigger.label(), promoted.len());

        if promoted.is_empty() && last_read_id == previous {
            return Ok(ReadOutcome {
                last_read_id,
                promoted,
                events: Vec::new(),
            });
        }

        tracing::debug!(
            conversation_id = %conversation_id,
            reader_id = %reader_id,
            last_read_id,
            promoted = promoted.len(),
            trigger = trigger.label(),
            "messages marked read"
        );

        let mut events = vec![Outbound::to(
            GroupKey::Conversation(conversation_id),
            ServerEvent::ChatRead {
                reader: reader_id,
                last_read_id,
            },
        )];
        events.extend(status_events(
            conversation_id,
            &promoted,
            self.tuning.status_broadcast_cap,
        ));
        match self.inbox_update(conversation_id, reader_id).await {
            Ok(Some(update)) => events.push(Outbound::to(GroupKey::Inbox(reader_id), update)),
            Ok(None) => {}
            Err(e) => tracing::warn!(user_id = %reader_id, error = %e, "inbox refresh after read failed"),
        }

        Ok(ReadOutcome {
            last_read_id,
            promoted,
            events,
        })
    }

    /// Stamp delivery on inbound rows still missing it, bounded per call.
    /// Never promotes to READ.
    pub async fn catch_up_conversation(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
    ) -> AppResult<CatchUp> {
        let delivered = self
            .messages
            .mark_delivered(
                conversation_id,
                recipient_id,
                self.tuning.catch_up_batch,
                Utc::now(),
            )
            .await?;
        crate::metrics::record_transitions("delivered", "catch_up", delivered.len());

        let events = delivered
            .iter()
            .take(self.tuning.status_broadcast_cap)
            .map(|id| {
                Outbound::to(
                    GroupKey::Conversation(conversation_id),
                    ServerEvent::delivered(*id),
                )
            })
            .collect();
        Ok(CatchUp { delivered, events })
    }

    /// Catch-up for a freshly opened inbox: delivery stamps for every
    /// conversation plus one digest per conversation that has news.
    pub async fn catch_up_inbox(&self, user_id: Uuid) -> AppResult<InboxCatchUp> {
        let conversations = self.directory.conversations_for(user_id).await?;
        let mut result = InboxCatchUp::default();

        for conversation_id in conversations {
            let caught = match self.catch_up_conversation(conversation_id, user_id).await {
                Ok(caught) => caught,
                Err(e) => {
                    tracing::warn!(conversation_id = %conversation_id, error = %e, "inbox catch-up failed for conversation");
                    continue;
                }
            };
            let newly_delivered = !caught.delivered.is_empty();
            result.events.extend(caught.events);

            match self.inbox_update(conversation_id, user_id).await {
                Ok(Some(update)) => {
                    let has_unread = matches!(
                        update,
                        ServerEvent::InboxUpdate { unread_count, .. } if unread_count > 0
                    );
                    if newly_delivered || has_unread {
                        result.digests.push(update);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(conversation_id = %conversation_id, error = %e, "digest failed"),
            }
        }
        Ok(result)
    }

    /// Current preview + unread count for one user's inbox row.
    pub async fn inbox_update(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<ServerEvent>> {
        let Some(last) = self.messages.last_message(conversation_id).await? else {
            return Ok(None);
        };
        let unread_count = self.unread.conversation_unread(conversation_id, user_id).await?;
        Ok(Some(ServerEvent::InboxUpdate {
            conversation_id,
            last_message_preview: truncate_chars(last.preview_source(), self.tuning.inbox_preview_chars),
            last_message_at: Some(last.created_at),
            unread_count,
        }))
    }

    /// Typing is ephemeral: nothing is persisted.
    pub fn typing(&self, conversation_id: Uuid, user_id: Uuid, state: Option<&str>) -> Outbound {
        Outbound::to(
            GroupKey::Conversation(conversation_id),
            ServerEvent::ChatTyping {
                user: user_id,
                state: TypingState::from_client(state),
            },
        )
    }
}
