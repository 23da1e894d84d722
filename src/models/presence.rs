//! Presence: who has at least one live connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UserId;

/// Transport-level connection id; lives as long as one socket.
pub type ConnectionId = String;

/// Presence as reported over HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: UserId,
    pub online: bool,
    pub last_active: Option<DateTime<Utc>>,
}

/// Generate a unique socket/connection id.
pub fn generate_socket_id() -> ConnectionId {
    format!("{}.{}", std::process::id(), Uuid::new_v4().as_simple())
}
