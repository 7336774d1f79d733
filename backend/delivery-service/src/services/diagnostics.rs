//! Consistency checks between message rows and read markers, for operators.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::read_marker::watermark_excluding;
use crate::models::{DeliveryStatus, HistoryQuery, Message, ReadMarker};
use crate::store::{MessageRepository, ReadMarkerRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// A counterpart marker covers the row but its status is still DELIVERED.
    ExpectedReadNotPersisted,
    Status2NoReadAt,
    ReadAtStatus1,
}

impl Anomaly {
    pub fn tag(self) -> &'static str {
        match self {
            Anomaly::ExpectedReadNotPersisted => "EXPECTED_READ_NOT_PERSISTED",
            Anomaly::Status2NoReadAt => "STATUS2_NO_READ_AT",
            Anomaly::ReadAtStatus1 => "READ_AT_STATUS1",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageDiagnosis {
    pub id: i64,
    pub sender_id: Uuid,
    pub delivery_status: i16,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub expected_read: bool,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone)]
pub struct ConversationDiagnosis {
    pub conversation_id: Uuid,
    pub markers: Vec<ReadMarker>,
    pub messages: Vec<MessageDiagnosis>,
}

impl ConversationDiagnosis {
    pub fn anomaly_count(&self, kind: Anomaly) -> usize {
        self.messages
            .iter()
            .filter(|m| m.anomalies.contains(&kind))
            .count()
    }
}

pub fn diagnose(message: &Message, markers: &[ReadMarker]) -> MessageDiagnosis {
    let status = message.status();
    let expected_read = watermark_excluding(markers, message.sender_id) >= message.id;

    let mut anomalies = Vec::new();
    if expected_read && status < DeliveryStatus::Read {
        anomalies.push(Anomaly::ExpectedReadNotPersisted);
    }
    if status == DeliveryStatus::Read && message.read_at.is_none() {
        anomalies.push(Anomaly::Status2NoReadAt);
    }
    if status == DeliveryStatus::Delivered && message.read_at.is_some() {
        anomalies.push(Anomaly::ReadAtStatus1);
    }

    MessageDiagnosis {
        id: message.id,
        sender_id: message.sender_id,
        delivery_status: message.delivery_status,
        delivered_at: message.delivered_at,
        read_at: message.read_at,
        expected_read,
        anomalies,
    }
}

/// The latest `limit` messages of a conversation, checked against its markers.
pub async fn diagnose_conversation(
    messages: &Arc<dyn MessageRepository>,
    markers: &Arc<dyn ReadMarkerRepository>,
    conversation_id: Uuid,
    limit: i64,
) -> AppResult<ConversationDiagnosis> {
    let rows = messages
        .history(
            conversation_id,
            HistoryQuery {
                after: None,
                before: None,
                limit: limit.max(1),
            },
        )
        .await?;
    let markers = markers.markers_for_conversation(conversation_id).await?;
    let messages = rows.iter().map(|m| diagnose(m, &markers)).collect();

    Ok(ConversationDiagnosis {
        conversation_id,
        markers,
        messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMessage;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn lagging_rows_are_flagged() {
        let store = Arc::new(InMemoryStore::new());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = store.create_conversation(a, b).await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = store
                .insert_message(NewMessage {
                    conversation_id: conv,
                    sender_id: a,
                    body: "hi".into(),
                    client_id: None,
                    attachment: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap()
                .message()
                .id;
            ids.push(id);
        }
        store.advance_read_marker(conv, b, ids[1]).await.unwrap();

        let messages: Arc<dyn MessageRepository> = store.clone();
        let markers: Arc<dyn ReadMarkerRepository> = store.clone();
        let report = diagnose_conversation(&messages, &markers, conv, 30)
            .await
            .unwrap();

        assert_eq!(report.messages.len(), 3);
        assert_eq!(report.anomaly_count(Anomaly::ExpectedReadNotPersisted), 2);
        assert!(!report.messages[2].expected_read);
        assert!(report.messages[2].anomalies.is_empty());
    }

    #[test]
    fn inconsistent_read_stamps_are_flagged() {
        let mut message = Message {
            id: 7,
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            body: "x".into(),
            attachment_name: None,
            attachment_mime: None,
            attachment_size: None,
            client_id: None,
            delivery_status: 2,
            delivered_at: Some(Utc::now()),
            read_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(diagnose(&message, &[]).anomalies, vec![Anomaly::Status2NoReadAt]);

        message.delivery_status = 1;
        message.read_at = Some(Utc::now());
        assert_eq!(diagnose(&message, &[]).anomalies, vec![Anomaly::ReadAtStatus1]);
    }
}
