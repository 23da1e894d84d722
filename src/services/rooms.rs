//! Room membership: one multicast group per conversation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::models::{ConnectionId, ConversationId};

#[derive(Debug, Default)]
struct RoomState {
    rooms: HashMap<ConversationId, HashSet<ConnectionId>>,
    joined: HashMap<ConnectionId, HashSet<ConversationId>>,
}

/// Which connections currently receive a conversation's events. Membership is not
/// remembered across a disconnect; clients re-join after reconnecting.
#[derive(Clone, Default)]
pub struct RoomService {
    state: Arc<RwLock<RoomState>>,
}

impl RoomService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the connection to the conversation's room. Returns false if already a member.
    pub async fn join(&self, socket_id: &ConnectionId, conversation_id: ConversationId) -> bool {
        let mut state = self.state.write().await;
        let added = state
            .rooms
            .entry(conversation_id)
            .or_default()
            .insert(socket_id.clone());
        state
            .joined
            .entry(socket_id.clone())
            .or_default()
            .insert(conversation_id);
        if added {
            info!(socket_id = %socket_id, conversation_id, "joined room");
        }
        added
    }

    /// Remove the connection from one room. Idempotent.
    pub async fn leave(&self, socket_id: &ConnectionId, conversation_id: ConversationId) -> bool {
        let mut state = self.state.write().await;
        let removed = remove_member(&mut state.rooms, conversation_id, socket_id);
        if let Some(rooms) = state.joined.get_mut(socket_id) {
            rooms.remove(&conversation_id);
            if rooms.is_empty() {
                state.joined.remove(socket_id);
            }
        }
        if removed {
            debug!(socket_id = %socket_id, conversation_id, "left room");
        }
        removed
    }

    /// Remove the connection from every room it joined; returns those rooms.
    pub async fn leave_all(&self, socket_id: &ConnectionId) -> Vec<ConversationId> {
        let mut state = self.state.write().await;
        let joined = state.joined.remove(socket_id).unwrap_or_default();
        for conversation_id in &joined {
            remove_member(&mut state.rooms, *conversation_id, socket_id);
        }
        let mut left: Vec<ConversationId> = joined.into_iter().collect();
        left.sort_unstable();
        left
    }

    pub async fn members(&self, conversation_id: ConversationId) -> Vec<ConnectionId> {
        let state = self.state.read().await;
        state
            .rooms
            .get(&conversation_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, socket_id: &ConnectionId, conversation_id: ConversationId) -> bool {
        let state = self.state.read().await;
        state
            .rooms
            .get(&conversation_id)
            .map(|members| members.contains(socket_id))
            .unwrap_or(false)
    }

    pub async fn rooms_of(&self, socket_id: &ConnectionId) -> Vec<ConversationId> {
        let state = self.state.read().await;
        let mut rooms: Vec<ConversationId> = state
            .joined
            .get(socket_id)
            .map(|rooms| rooms.iter().copied().collect())
            .unwrap_or_default();
        rooms.sort_unstable();
        rooms
    }
}

/// Empty rooms are dropped.
fn remove_member(
    rooms: &mut HashMap<ConversationId, HashSet<ConnectionId>>,
    conversation_id: ConversationId,
    socket_id: &ConnectionId,
) -> bool {
    let Some(members) = rooms.get_mut(&conversation_id) else {
        return false;
    };
    let removed = members.remove(socket_id);
    if members.is_empty() {
        rooms.remove(&conversation_id);
    }
    removed
}
