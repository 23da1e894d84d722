//! Session tokens: the chat core only validates them, the REST layer issues them.

use crate::error::{AppError, AppResult};
use crate::models::UserId;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub exp: i64,
    pub iat: i64,
}

#[derive(Clone)]
pub struct JwtSecret {
    secret: String,
}

impl JwtSecret {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Issue a token for `user_id`. Used by tests and local tooling.
    pub fn issue(&self, user_id: UserId) -> AppResult<String> {
        let now = Utc::now();
        let exp = (now + Duration::days(7)).timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            exp,
            iat: now.timestamp(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AppError::Jwt(e.to_string()))?;
        Ok(token)
    }

    /// Resolve the user id bound to a token.
    pub fn validate(&self, token: &str) -> AppResult<UserId> {
        let mut validation = Validation::default();
        validation.validate_exp = true;
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| AppError::Jwt(e.to_string()))?;
        let id = data
            .claims
            .sub
            .parse::<UserId>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| AppError::Jwt("subject is not a user id".to_string()))?;
        Ok(id)
    }
}
