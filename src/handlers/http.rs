//! HTTP handlers: health and presence lookups.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::JwtSecret;
use crate::config::Config;
use crate::db::ChatStore;
use crate::error::AppError;
use crate::middleware::AuthUser;
use crate::models::{RawId, UserPresence};
use crate::services::{
    Broadcaster, ConnectionRegistry, MessageRelay, PresenceService, ReadReceiptService,
    RoomAuthorizer, RoomService, TypingService,
};

/// Socket-level limits copied out of [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct SocketSettings {
    pub idle_timeout: Duration,
    pub max_message_len: usize,
}

/// Shared application state for HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub rooms: RoomService,
    pub presence: PresenceService,
    pub broadcaster: Broadcaster,
    pub relay: MessageRelay,
    pub typing: TypingService,
    pub receipts: ReadReceiptService,
    pub authorizer: RoomAuthorizer,
    pub jwt_secret: JwtSecret,
    pub settings: SocketSettings,
}

impl AppState {
    /// Wire every service around one storage collaborator.
    pub fn new(config: &Config, store: Arc<dyn ChatStore>) -> Self {
        let registry = ConnectionRegistry::new();
        let rooms = RoomService::new();
        let presence = PresenceService::new();
        let broadcaster = Broadcaster::new(registry.clone(), rooms.clone());

        Self {
            relay: MessageRelay::new(
                store.clone(),
                broadcaster.clone(),
                presence.clone(),
                config.persist_timeout,
            ),
            typing: TypingService::new(broadcaster.clone()),
            receipts: ReadReceiptService::new(
                store.clone(),
                broadcaster.clone(),
                config.persist_timeout,
            ),
            authorizer: RoomAuthorizer::new(
                store,
                config.enforce_participants,
                config.persist_timeout,
            ),
            jwt_secret: JwtSecret::new(config.jwt_secret.clone()),
            settings: SocketSettings {
                idle_timeout: config.idle_timeout,
                max_message_len: config.max_message_len,
            },
            registry,
            rooms,
            presence,
            broadcaster,
        }
    }

    pub fn jwt_secret(&self) -> &JwtSecret {
        &self.jwt_secret
    }
}

/// GET /health: liveness probe.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "unitask-chat" })),
    )
}

/// GET /api/presence/online: ids of users with at least one live connection.
pub async fn online_users(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
) -> Json<serde_json::Value> {
    let users: Vec<String> = state
        .presence
        .online_users()
        .await
        .into_iter()
        .map(|id| id.to_string())
        .collect();
    Json(json!({ "users": users }))
}

/// GET /api/presence/:user_id
pub async fn user_presence(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(user_id): Path<String>,
) -> Result<Json<UserPresence>, AppError> {
    let user_id = RawId::Text(user_id)
        .parse()
        .ok_or_else(|| AppError::Validation("user id must be a positive integer".to_string()))?;
    Ok(Json(state.presence.presence_of(user_id).await))
}
