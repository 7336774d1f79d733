use crate::error::AppError;
use actix_web::{http::StatusCode, HttpResponse};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
    pub status: u16,
}

pub fn into_response(err: &AppError) -> HttpResponse {
    let status = err.status_code();
    if status >= 500 {
        tracing::error!(error = %err, "request failed");
    }

    // Internal details stay in the logs.
    let message = match err {
        AppError::Database(_) | AppError::Redis(_) | AppError::Internal => {
            "internal server error".to_string()
        }
        other => other.to_string(),
    };

    let body = ErrorResponse {
        error: err.code(),
        message,
        status,
    };

    HttpResponse::build(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .json(body)
}
