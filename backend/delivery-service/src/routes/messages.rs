use actix_web::{delete, get, post, web, HttpResponse};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::guards::AuthenticatedUser;
use crate::models::{Attachment, ConversationMute};
use crate::services::push::spawn_pushes;
use crate::services::{Draft, HistoryParams, MessageView, ReadTrigger};
use crate::state::AppState;
use crate::websocket::events::AttachmentView;

#[derive(Debug, Deserialize)]
pub struct HistoryRequest {
    #[serde(alias = "since_id")]
    pub after: Option<i64>,
    pub before: Option<i64>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub mark_read: bool,
}

impl HistoryRequest {
    fn page(&self) -> HistoryParams {
        HistoryParams {
            after: self.after,
            before: self.before,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub body: String,
    pub client_id: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_mime: Option<String>,
    pub attachment_size: Option<i32>,
}

impl SendMessageRequest {
    fn into_draft(self) -> Draft {
        let attachment = self.attachment_name.map(|name| Attachment {
            name,
            mime: self.attachment_mime,
            size: self.attachment_size,
        });
        Draft {
            body: self.body,
            client_id: self.client_id,
            attachment,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub id: i64,
    pub conversation_id: Uuid,
    pub sender: Uuid,
    pub body: String,
    pub created_at: chrono::DateTime<Utc>,
    pub status: String,
    pub delivery_status: i16,
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentView>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReadRequest {
    pub last_read_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    pub last_read_id: i64,
    pub promoted: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct MuteRequest {
    /// Omitted for an open-ended mute.
    pub minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub messages: Vec<MessageView>,
}

/// GET /api/v1/conversations/{id}/messages
#[get("/api/v1/conversations/{id}/messages")]
pub async fn get_messages(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<HistoryRequest>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let conversation_id = path.into_inner();
    let identity = user.0;
    state.delivery.authorize(conversation_id, &identity).await?;

    if query.mark_read {
        let outcome = state
            .delivery
            .mark_read(conversation_id, identity.user_id, None, ReadTrigger::History)
            .await?;
        state.dispatcher.dispatch(outcome.events).await;
    }

    let page = state.history.fetch(conversation_id, query.page()).await?;
    if page.lagging > 0 {
        tracing::info!(
            conversation_id = %conversation_id,
            lagging = page.lagging,
            "history rendered rows ahead of their status, healing"
        );
        let reconciler = state.reconciler.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler.heal_conversation(conversation_id).await {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "on-demand heal failed");
            }
        });
    }

    Ok(HttpResponse::Ok().json(HistoryResponse {
        messages: page.messages,
    }))
}

/// POST /api/v1/conversations/{id}/messages
#[post("/api/v1/conversations/{id}/messages")]
pub async fn send_message(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    user: AuthenticatedUser,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let conversation_id = path.into_inner();
    let identity = user.0;
    state.delivery.authorize(conversation_id, &identity).await?;

    let outcome = state
        .delivery
        .send(conversation_id, identity.user_id, body.into_inner().into_draft())
        .await?;

    let message = &outcome.message;
    let response = SendMessageResponse {
        id: message.id,
        conversation_id: message.conversation_id,
        sender: message.sender_id,
        body: message.body.clone(),
        created_at: message.created_at,
        status: message.status().label().to_string(),
        delivery_status: message.delivery_status,
        client_id: message.client_id.clone(),
        attachment: AttachmentView::from_message(message),
    };

    if outcome.duplicate {
        return Ok(HttpResponse::Ok().json(response));
    }
    state.dispatcher.dispatch(outcome.events).await;
    spawn_pushes(state.push.clone(), outcome.pushes);
    Ok(HttpResponse::Created().json(response))
}

/// POST /api/v1/conversations/{id}/read
#[post("/api/v1/conversations/{id}/read")]
pub async fn mark_read(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    user: AuthenticatedUser,
    body: Option<web::Json<ReadRequest>>,
) -> Result<HttpResponse, AppError> {
    let conversation_id = path.into_inner();
    let identity = user.0;
    state.delivery.authorize(conversation_id, &identity).await?;

    let up_to = body.and_then(|b| b.last_read_id);
    let outcome = state
        .delivery
        .mark_read(conversation_id, identity.user_id, up_to, ReadTrigger::Explicit)
        .await?;
    let response = ReadResponse {
        last_read_id: outcome.last_read_id,
        promoted: outcome.promoted.len(),
    };
    state.dispatcher.dispatch(outcome.events).await;

    Ok(HttpResponse::Ok().json(response))
}

/// POST /api/v1/conversations/{id}/mute
#[post("/api/v1/conversations/{id}/mute")]
pub async fn mute_conversation(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    user: AuthenticatedUser,
    body: Option<web::Json<MuteRequest>>,
) -> Result<HttpResponse, AppError> {
    let conversation_id = path.into_inner();
    let identity = user.0;
    state.delivery.authorize(conversation_id, &identity).await?;

    let muted_until = match body.and_then(|b| b.minutes) {
        None => None,
        Some(m) if m <= 0 => {
            return Err(AppError::BadRequest("minutes must be positive".into()));
        }
        Some(m) => Some(
            Duration::try_minutes(m)
                .and_then(|d| Utc::now().checked_add_signed(d))
                .ok_or_else(|| AppError::BadRequest("minutes out of range".into()))?,
        ),
    };
    let mute = ConversationMute {
        conversation_id,
        user_id: identity.user_id,
        muted_until,
    };
    state.directory.mute(mute.clone()).await?;

    Ok(HttpResponse::Ok().json(mute))
}

/// DELETE /api/v1/conversations/{id}/mute
#[delete("/api/v1/conversations/{id}/mute")]
pub async fn unmute_conversation(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let conversation_id = path.into_inner();
    let identity = user.0;
    state.delivery.authorize(conversation_id, &identity).await?;

    state
        .directory
        .unmute(conversation_id, identity.user_id)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}
