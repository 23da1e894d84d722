//! Read receipts: flip `read` for other people's messages and tell the room.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use super::{bounded, Broadcaster};
use crate::db::ChatStore;
use crate::error::AppResult;
use crate::models::{ConversationId, MessageId, ReadEvent, ServerEvent, UserId};

#[derive(Clone)]
pub struct ReadReceiptService {
    store: Arc<dyn ChatStore>,
    broadcaster: Broadcaster,
    timeout: Duration,
}

impl ReadReceiptService {
    pub fn new(store: Arc<dyn ChatStore>, broadcaster: Broadcaster, timeout: Duration) -> Self {
        Self {
            store,
            broadcaster,
            timeout,
        }
    }

    /// Mark `message_ids` read on behalf of `reader` and broadcast `message-read` to the
    /// room. Safe to repeat: already-read ids and the reader's own messages are skipped by
    /// the store. Returns the ids that actually flipped.
    #[instrument(skip(self, message_ids), fields(count = message_ids.len()))]
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
        reader: UserId,
    ) -> AppResult<Vec<MessageId>> {
        let ids: Vec<MessageId> = message_ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let flipped = bounded(
            self.timeout,
            self.store.mark_messages_read(&ids, conversation_id, reader),
        )
        .await?;

        let event = ServerEvent::MessageRead(ReadEvent {
            message_ids: ids,
            conversation_id,
            user_id: reader,
        });
        let delivered = self.broadcaster.to_room(conversation_id, &event, None).await?;
        info!(conversation_id, reader, flipped = flipped.len(), delivered, "messages marked read");
        Ok(flipped)
    }
}
