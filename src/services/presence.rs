//! Online set and last-active timestamps, reference-counted per connection.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::models::{ConnectionId, UserId, UserPresence};

#[derive(Debug, Clone)]
struct PresenceRecord {
    connections: usize,
    last_active: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PresenceState {
    /// Connections that announced `user-online`, and for whom.
    bound: HashMap<ConnectionId, UserId>,
    /// Every user seen since start; `connections == 0` means offline.
    users: HashMap<UserId, PresenceRecord>,
}

/// Outcome of a connection closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub user_id: UserId,
    /// True when this was the user's last live connection.
    pub went_offline: bool,
}

/// In-memory presence. Each mutation (including decrement-then-check on disconnect)
/// happens under one write lock, with no await in between.
#[derive(Clone, Default)]
pub struct PresenceService {
    state: Arc<RwLock<PresenceState>>,
}

impl PresenceService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `socket_id` as a live connection of `user_id`. Returns true if the user
    /// was offline before. Re-announcing on the same connection only refreshes activity.
    #[instrument(skip(self))]
    pub async fn register_online(&self, socket_id: &ConnectionId, user_id: UserId) -> bool {
        let mut state = self.state.write().await;
        let now = Utc::now();

        match state.bound.get(socket_id).copied() {
            Some(existing) if existing == user_id => {
                if let Some(record) = state.users.get_mut(&user_id) {
                    record.last_active = now;
                }
                return false;
            }
            Some(existing) => {
                state.bound.remove(socket_id);
                release(&mut state, existing);
            }
            None => {}
        }

        state.bound.insert(socket_id.clone(), user_id);
        let record = state.users.entry(user_id).or_insert(PresenceRecord {
            connections: 0,
            last_active: now,
        });
        record.connections += 1;
        record.last_active = now;
        let came_online = record.connections == 1;
        info!(user_id, connections = record.connections, "user online");
        came_online
    }

    /// Refresh last-active without touching online/offline. Returns false for users
    /// never registered.
    pub async fn heartbeat(&self, user_id: UserId) -> bool {
        let mut state = self.state.write().await;
        match state.users.get_mut(&user_id) {
            Some(record) => {
                record.last_active = Utc::now();
                true
            }
            None => {
                debug!(user_id, "heartbeat from unregistered user");
                false
            }
        }
    }

    /// Drop a connection. Idempotent: unknown or already-released connections yield `None`.
    #[instrument(skip(self))]
    pub async fn connection_closed(&self, socket_id: &ConnectionId) -> Option<Departure> {
        let mut state = self.state.write().await;
        let user_id = state.bound.remove(socket_id)?;
        let went_offline = release(&mut state, user_id);
        if went_offline {
            info!(user_id, "user offline");
        }
        Some(Departure {
            user_id,
            went_offline,
        })
    }

    /// Current online set, sorted.
    pub async fn online_users(&self) -> Vec<UserId> {
        let state = self.state.read().await;
        let mut users: Vec<UserId> = state
            .users
            .iter()
            .filter(|(_, record)| record.connections > 0)
            .map(|(id, _)| *id)
            .collect();
        users.sort_unstable();
        users
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        let state = self.state.read().await;
        state
            .users
            .get(&user_id)
            .map(|record| record.connections > 0)
            .unwrap_or(false)
    }

    pub async fn presence_of(&self, user_id: UserId) -> UserPresence {
        let state = self.state.read().await;
        let record = state.users.get(&user_id);
        UserPresence {
            user_id,
            online: record.map(|r| r.connections > 0).unwrap_or(false),
            last_active: record.map(|r| r.last_active),
        }
    }
}

/// Decrement the user's connection count; true when it reached zero.
fn release(state: &mut PresenceState, user_id: UserId) -> bool {
    match state.users.get_mut(&user_id) {
        Some(record) if record.connections > 0 => {
            record.connections -= 1;
            record.connections == 0
        }
        _ => false,
    }
}
