//! Typing indicators: relayed to the other room members, never stored.

use tracing::debug;

use super::Broadcaster;
use crate::error::AppResult;
use crate::models::{ConnectionId, ConversationId, ServerEvent, TypingEvent, UserId};

#[derive(Clone)]
pub struct TypingService {
    broadcaster: Broadcaster,
}

impl TypingService {
    pub fn new(broadcaster: Broadcaster) -> Self {
        Self { broadcaster }
    }

    /// Fire-and-forget relay to everyone in the room except the typing connection.
    pub async fn relay(
        &self,
        socket_id: &ConnectionId,
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    ) -> AppResult<usize> {
        let event = ServerEvent::UserTyping(TypingEvent {
            conversation_id,
            user_id,
            is_typing,
        });
        let delivered = self
            .broadcaster
            .to_room(conversation_id, &event, Some(socket_id))
            .await?;
        debug!(conversation_id, user_id, is_typing, delivered, "typing relayed");
        Ok(delivered)
    }
}
