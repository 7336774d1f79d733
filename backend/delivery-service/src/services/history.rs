use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::DeliveryTuning;
use crate::error::AppResult;
use crate::models::read_marker::watermark_excluding;
use crate::models::{DeliveryStatus, HistoryQuery, Message};
use crate::store::{MessageRepository, ReadMarkerRepository};
use crate::websocket::events::AttachmentView;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageView {
    pub id: i64,
    pub conversation_id: Uuid,
    pub sender: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub status: String,
    pub delivery_status: i16,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentView>,
}

impl MessageView {
    fn render(message: &Message, status: DeliveryStatus) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender: message.sender_id,
            body: message.body.clone(),
            created_at: message.created_at,
            status: status.label().to_string(),
            delivery_status: status.as_i16(),
            delivered_at: message.delivered_at,
            read_at: message.read_at,
            client_id: message.client_id.clone(),
            attachment: AttachmentView::from_message(message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<MessageView>,
    /// Rows shown as read because of a marker while the row itself lags.
    #[serde(skip)]
    pub lagging: usize,
}

/// Raw paging parameters as clients send them.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct HistoryParams {
    #[serde(alias = "since_id")]
    pub after: Option<i64>,
    pub before: Option<i64>,
    pub limit: Option<i64>,
}

/// History with marker-freeze rendering: a message counts as read once any
/// viewer other than its sender has a marker at or above its id, whatever
/// the row's own status column says.
pub struct HistoryService {
    messages: Arc<dyn MessageRepository>,
    markers: Arc<dyn ReadMarkerRepository>,
    default_limit: i64,
    max_limit: i64,
}

impl HistoryService {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        markers: Arc<dyn ReadMarkerRepository>,
        tuning: &DeliveryTuning,
    ) -> Self {
        Self {
            messages,
            markers,
            default_limit: tuning.history_default_limit,
            max_limit: tuning.history_max_limit,
        }
    }

    pub fn query(&self, params: HistoryParams) -> HistoryQuery {
        HistoryQuery {
            after: params.after,
            before: params.before,
            limit: params
                .limit
                .filter(|l| *l > 0)
                .unwrap_or(self.default_limit)
                .min(self.max_limit),
        }
    }

    pub async fn fetch(&self, conversation_id: Uuid, params: HistoryParams) -> AppResult<HistoryPage> {
        let rows = self
            .messages
            .history(conversation_id, self.query(params))
            .await?;
        let markers = self.markers.markers_for_conversation(conversation_id).await?;

        let mut lagging = 0;
        let messages = rows
            .iter()
            .map(|m| {
                let mut status = m.status();
                if status < DeliveryStatus::Read && watermark_excluding(&markers, m.sender_id) >= m.id {
                    status = DeliveryStatus::Read;
                    lagging += 1;
                }
                MessageView::render(m, status)
            })
            .collect();

        Ok(HistoryPage { messages, lagging })
    }
}
