//! Session identity: JWT from a Bearer header, or `?token=` on the socket upgrade.

use axum::http::{header::AUTHORIZATION, HeaderMap};

use crate::error::AppError;
use crate::handlers::http::AppState;
use crate::models::UserId;

const BEARER_PREFIX: &str = "Bearer ";

/// Extractor: authenticated user id from the `Authorization: Bearer` header.
#[derive(Clone, Copy, Debug)]
pub struct AuthUser(pub UserId);

#[axum::async_trait]
impl axum::extract::FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| AppError::Auth("Missing or invalid Authorization header".to_string()))?;
        let user_id = state.jwt_secret().validate(token)?;
        Ok(AuthUser(user_id))
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
