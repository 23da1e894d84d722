//! Live connections and their outbound queues.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::models::{ConnectionId, UserId};

/// Writer side of one socket, tagged with the user bound at upgrade time.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub user_id: UserId,
    tx: mpsc::UnboundedSender<String>,
}

/// Tracks which live connection belongs to which user. Entries exist from socket
/// open to socket close; nothing here survives a disconnect.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(
        &self,
        socket_id: &ConnectionId,
        user_id: UserId,
        tx: mpsc::UnboundedSender<String>,
    ) {
        let mut connections = self.connections.write().await;
        connections.insert(socket_id.clone(), ConnectionHandle { user_id, tx });
        info!(socket_id = %socket_id, user_id, total = connections.len(), "connection registered");
    }

    /// Remove a connection. Removing an unknown id is a no-op.
    pub async fn remove(&self, socket_id: &ConnectionId) -> Option<ConnectionHandle> {
        let removed = self.connections.write().await.remove(socket_id);
        if removed.is_none() {
            debug!(socket_id = %socket_id, "connection already removed");
        }
        removed
    }

    /// Queue a frame for several connections; returns how many accepted it.
    pub async fn send_many<'a, I>(&self, socket_ids: I, payload: &str) -> usize
    where
        I: IntoIterator<Item = &'a ConnectionId>,
    {
        let connections = self.connections.read().await;
        socket_ids
            .into_iter()
            .filter_map(|id| connections.get(id))
            .filter(|handle| handle.tx.send(payload.to_string()).is_ok())
            .count()
    }

    /// Queue a frame for every live connection.
    pub async fn send_all(&self, payload: &str) -> usize {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|handle| handle.tx.send(payload.to_string()).is_ok())
            .count()
    }
}
