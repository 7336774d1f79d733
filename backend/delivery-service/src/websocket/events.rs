//! Server → client frames.
//!
//! Event names follow `object.action`. Every frame carries a `type` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{DeliveryStatus, Message, StatusChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingState {
    Start,
    Stop,
}

impl TypingState {
    /// Anything other than an explicit stop counts as typing.
    pub fn from_client(state: Option<&str>) -> Self {
        match state.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("stop") | Some("end") => TypingState::Stop,
            _ => TypingState::Start,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentView {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i32>,
}

impl AttachmentView {
    pub fn from_message(message: &Message) -> Option<Self> {
        message.attachment_name.as_ref().map(|name| Self {
            name: name.clone(),
            mime: message.attachment_mime.clone(),
            size: message.attachment_size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "chat.message")]
    ChatMessage {
        id: i64,
        conversation_id: Uuid,
        sender: Uuid,
        body: String,
        created_at: DateTime<Utc>,
        status: String,
        delivery_status: i16,
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<AttachmentView>,
    },

    #[serde(rename = "message.status")]
    MessageStatus {
        id: i64,
        delivery_status: i16,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        read_at: Option<DateTime<Utc>>,
    },

    #[serde(rename = "chat.read")]
    ChatRead { reader: Uuid, last_read_id: i64 },

    #[serde(rename = "chat.typing")]
    ChatTyping { user: Uuid, state: TypingState },

    #[serde(rename = "inbox.update")]
    InboxUpdate {
        conversation_id: Uuid,
        last_message_preview: String,
        last_message_at: Option<DateTime<Utc>>,
        unread_count: i64,
    },

    #[serde(rename = "inbox.hello")]
    InboxHello,

    #[serde(rename = "pong")]
    Pong,

    /// Sent only to the socket whose request failed.
    #[serde(rename = "error")]
    Error { code: String, detail: String },
}

impl ServerEvent {
    pub fn chat_message(message: &Message) -> Self {
        let status = message.status();
        ServerEvent::ChatMessage {
            id: message.id,
            conversation_id: message.conversation_id,
            sender: message.sender_id,
            body: message.body.clone(),
            created_at: message.created_at,
            status: status.label().to_string(),
            delivery_status: status.as_i16(),
            client_id: message.client_id.clone(),
            attachment: AttachmentView::from_message(message),
        }
    }

    pub fn status(change: &StatusChange) -> Self {
        ServerEvent::MessageStatus {
            id: change.id,
            delivery_status: change.delivery_status.as_i16(),
            status: change.delivery_status.label().to_string(),
            read_at: change.read_at,
        }
    }

    pub fn delivered(id: i64) -> Self {
        Self::status(&StatusChange {
            id,
            delivery_status: DeliveryStatus::Delivered,
            read_at: None,
        })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::ChatMessage { .. } => "chat.message",
            ServerEvent::MessageStatus { .. } => "message.status",
            ServerEvent::ChatRead { .. } => "chat.read",
            ServerEvent::ChatTyping { .. } => "chat.typing",
            ServerEvent::InboxUpdate { .. } => "inbox.update",
            ServerEvent::InboxHello => "inbox.hello",
            ServerEvent::Pong => "pong",
            ServerEvent::Error { .. } => "error",
        }
    }
}
