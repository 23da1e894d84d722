//! Fan-out of server events to a room or to everybody.

use tracing::{debug, instrument};

use super::{ConnectionRegistry, RoomService};
use crate::error::AppResult;
use crate::models::{ConnectionId, ConversationId, ServerEvent};

/// Serializes each event once and queues it on the target connections' writers.
#[derive(Clone)]
pub struct Broadcaster {
    registry: ConnectionRegistry,
    rooms: RoomService,
}

impl Broadcaster {
    pub fn new(registry: ConnectionRegistry, rooms: RoomService) -> Self {
        Self { registry, rooms }
    }

    /// Deliver to every member of the conversation's room, optionally skipping one
    /// connection. An empty room is not an error.
    #[instrument(skip(self, event))]
    pub async fn to_room(
        &self,
        conversation_id: ConversationId,
        event: &ServerEvent,
        except: Option<&ConnectionId>,
    ) -> AppResult<usize> {
        let payload = serde_json::to_string(event)?;
        let members = self.rooms.members(conversation_id).await;
        let targets = members.iter().filter(|id| Some(*id) != except);
        let delivered = self.registry.send_many(targets, &payload).await;
        debug!(conversation_id, delivered, "room broadcast");
        Ok(delivered)
    }

    pub async fn to_all(&self, event: &ServerEvent) -> AppResult<usize> {
        let payload = serde_json::to_string(event)?;
        let delivered = self.registry.send_all(&payload).await;
        debug!(delivered, "global broadcast");
        Ok(delivered)
    }
}
