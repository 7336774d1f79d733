use actix_web::{dev::Payload, web, Error, FromRequest, HttpRequest};
use std::future::{ready, Ready};

use super::auth::{bearer_token, Identity};
use crate::error::AppError;
use crate::state::AppState;

/// Caller authenticated from the `Authorization: Bearer` header.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser(pub Identity);

impl FromRequest for AuthenticatedUser {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let result = (|| {
            let state = req
                .app_data::<web::Data<AppState>>()
                .ok_or(AppError::Internal)?;
            let token = bearer_token(req).ok_or(AppError::Unauthorized)?;
            state.jwt.verify(&token).map(AuthenticatedUser)
        })();
        ready(result.map_err(Error::from))
    }
}
