use actix_web::{get, rt, web, Error, HttpRequest, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::auth::{extract_token, Identity};
use crate::state::AppState;
use crate::websocket::{transport, ConnectionHandle, ConversationSession, InboxSession};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

fn authenticate(state: &AppState, req: &HttpRequest, params: &WsParams) -> Result<Identity, AppError> {
    let token = extract_token(req, params.token.as_deref()).ok_or(AppError::Unauthorized)?;
    state.jwt.verify(&token)
}

/// GET /ws/conversations/{id}
///
/// Bad tokens are rejected before the upgrade. Membership is checked after
/// it, and a stranger gets a policy-violation close.
#[get("/ws/conversations/{id}")]
pub async fn conversation_socket(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<WsParams>,
    req: HttpRequest,
    body: web::Payload,
) -> Result<HttpResponse, Error> {
    let identity = authenticate(&state, &req, &query)?;
    let conversation_id = path.into_inner();

    let (response, session, stream) = actix_ws::handle(&req, body)?;
    let (handle, outbound) = ConnectionHandle::new();
    let hooks = ConversationSession::new(state.get_ref().clone(), identity, conversation_id, handle);
    let ws_config = state.config.ws.clone();

    rt::spawn(transport::drive(hooks, session, stream, outbound, ws_config));
    Ok(response)
}

/// GET /ws/inbox
#[get("/ws/inbox")]
pub async fn inbox_socket(
    state: web::Data<AppState>,
    query: web::Query<WsParams>,
    req: HttpRequest,
    body: web::Payload,
) -> Result<HttpResponse, Error> {
    let identity = authenticate(&state, &req, &query)?;

    let (response, session, stream) = actix_ws::handle(&req, body)?;
    let (handle, outbound) = ConnectionHandle::new();
    let hooks = InboxSession::new(state.get_ref().clone(), identity, handle);
    let ws_config = state.config.ws.clone();

    rt::spawn(transport::drive(hooks, session, stream, outbound, ws_config));
    Ok(response)
}
