use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Two-valued tick progression. Ordering is meaningful: `Delivered < Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeliveryStatus {
    Delivered = 1,
    Read = 2,
}

impl DeliveryStatus {
    pub fn from_i16(value: i16) -> Self {
        if value >= 2 {
            DeliveryStatus::Read
        } else {
            DeliveryStatus::Delivered
        }
    }

    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn label(self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }
}

/// Row in `messages`. Ids are BIGSERIAL and give the total order within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub attachment_name: Option<String>,
    pub attachment_mime: Option<String>,
    pub attachment_size: Option<i32>,
    pub client_id: Option<String>,
    pub delivery_status: i16,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn status(&self) -> DeliveryStatus {
        DeliveryStatus::from_i16(self.delivery_status)
    }

    pub fn is_read(&self) -> bool {
        self.status() == DeliveryStatus::Read
    }

    /// Conditional promotion to READ. Returns false when already read.
    pub fn promote_to_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_read() {
            return false;
        }
        self.delivery_status = DeliveryStatus::Read.as_i16();
        self.read_at.get_or_insert(at);
        self.delivered_at.get_or_insert(at);
        true
    }

    /// Stamps `delivered_at` if missing. Never touches the status.
    pub fn stamp_delivered(&mut self, at: DateTime<Utc>) -> bool {
        if self.delivered_at.is_some() {
            return false;
        }
        self.delivered_at = Some(at);
        true
    }

    pub fn status_change(&self) -> StatusChange {
        StatusChange {
            id: self.id,
            delivery_status: self.status(),
            read_at: self.read_at,
        }
    }

    /// Text used for previews: the body, or the attachment name for attachment-only messages.
    pub fn preview_source(&self) -> &str {
        if self.body.is_empty() {
            self.attachment_name.as_deref().unwrap_or("")
        } else {
            &self.body
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime: Option<String>,
    pub size: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub client_id: Option<String>,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Message),
    /// A row with the same `(conversation_id, client_id)` already existed.
    Duplicate(Message),
}

impl InsertOutcome {
    pub fn message(&self) -> &Message {
        match self {
            InsertOutcome::Inserted(m) | InsertOutcome::Duplicate(m) => m,
        }
    }
}

/// A persisted status transition, as returned by conditional updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub id: i64,
    pub delivery_status: DeliveryStatus,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryQuery {
    pub after: Option<i64>,
    pub before: Option<i64>,
    pub limit: i64,
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivered(id: i64) -> Message {
        let now = Utc::now();
        Message {
            id,
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            body: "hi".into(),
            attachment_name: None,
            attachment_mime: None,
            attachment_size: None,
            client_id: None,
            delivery_status: 1,
            delivered_at: Some(now),
            read_at: None,
            created_at: now,
        }
    }

    #[test]
    fn promotion_is_monotonic() {
        let mut m = delivered(1);
        let first = Utc::now();
        assert!(m.promote_to_read(first));
        assert!(m.is_read());
        assert_eq!(m.read_at, Some(first));

        // A second trigger keeps the original read_at.
        assert!(!m.promote_to_read(first + chrono::Duration::seconds(5)));
        assert_eq!(m.read_at, Some(first));
    }

    #[test]
    fn promotion_stamps_missing_delivered_at() {
        let mut m = delivered(2);
        m.delivered_at = None;
        let at = Utc::now();
        m.promote_to_read(at);
        assert_eq!(m.delivered_at, Some(at));
    }

    #[test]
    fn status_ordering() {
        assert!(DeliveryStatus::Delivered < DeliveryStatus::Read);
        assert_eq!(DeliveryStatus::from_i16(0), DeliveryStatus::Delivered);
        assert_eq!(DeliveryStatus::from_i16(2).label(), "read");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 80), "short");
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
    }

    #[test]
    fn attachment_only_preview_uses_file_name() {
        let mut m = delivered(3);
        m.body.clear();
        m.attachment_name = Some("invoice.pdf".into());
        assert_eq!(m.preview_source(), "invoice.pdf");
    }
}
