use actix_web::{get, web, HttpResponse};
use serde::Serialize;

use crate::error::AppError;
use crate::middleware::guards::AuthenticatedUser;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct UnreadResponse {
    pub total_unread: i64,
}

/// GET /api/v1/unread
#[get("/api/v1/unread")]
pub async fn get_unread(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let total_unread = state.unread.total_unread(user.0.user_id).await?;
    Ok(HttpResponse::Ok().json(UnreadResponse { total_unread }))
}
