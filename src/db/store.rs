//! The persistence collaborator the chat core talks to.

use async_trait::async_trait;

use crate::error::AppResult;
use crate::models::{ConversationId, Message, MessageId, UserId};

/// Minimal storage surface used by the chat core. Conversations and their participant
/// lists are created elsewhere (REST layer) before any chat traffic happens.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist a message; the store assigns id, timestamp and `read = false`.
    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> AppResult<Message>;

    /// Bump the conversation's `updated_at`.
    async fn touch_conversation(&self, conversation_id: ConversationId) -> AppResult<()>;

    /// Flip `read` to true for the listed messages of the conversation that were not sent
    /// by `reader`. Returns the ids that actually changed.
    async fn mark_messages_read(
        &self,
        message_ids: &[MessageId],
        conversation_id: ConversationId,
        reader: UserId,
    ) -> AppResult<Vec<MessageId>>;

    /// Participant user ids of a conversation (empty if it does not exist).
    async fn participants(&self, conversation_id: ConversationId) -> AppResult<Vec<UserId>>;
}
