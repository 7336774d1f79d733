use actix_web::HttpRequest;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_member_id: Option<Uuid>,
}

/// Authenticated caller. `team_member_id` is set when a team member acts
/// for the owner in `user_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub team_member_id: Option<Uuid>,
}

impl Identity {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id,
            team_member_id: None,
        }
    }
}

/// HS256 token verification.
#[derive(Clone)]
pub struct JwtVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> AppResult<Identity> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "jwt rejected");
            AppError::Unauthorized
        })?;
        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| AppError::Unauthorized)?;
        Ok(Identity {
            user_id,
            team_member_id: data.claims.team_member_id,
        })
    }

    /// Mint a token. Used by tests and local tooling; production tokens come
    /// from the identity service.
    pub fn issue(&self, identity: Identity, ttl_secs: i64) -> AppResult<String> {
        let exp = (chrono::Utc::now().timestamp() + ttl_secs).max(0) as usize;
        let claims = Claims {
            sub: identity.user_id.to_string(),
            exp,
            team_member_id: identity.team_member_id,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| AppError::Internal)
    }
}

/// Token from `?token=` (browsers cannot set headers on sockets) or a Bearer header.
pub fn extract_token(req: &HttpRequest, query_token: Option<&str>) -> Option<String> {
    query_token
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| bearer_token(req))
}

pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
}
