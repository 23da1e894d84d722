//! In-process `ChatStore`: used when no database is configured and by the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::ChatStore;
use crate::error::{AppError, AppResult};
use crate::models::{ConversationId, Message, MessageId, UserId};

#[derive(Debug)]
struct ConversationRecord {
    participants: Vec<UserId>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    last_id: MessageId,
    messages: Vec<Message>,
    conversations: HashMap<ConversationId, ConversationRecord>,
}

/// Message ids are assigned from one counter, so they grow in insertion order.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a conversation with the given participants.
    pub async fn create_conversation(&self, conversation_id: ConversationId, participants: &[UserId]) {
        let mut state = self.state.write().await;
        state.conversations.insert(
            conversation_id,
            ConversationRecord {
                participants: participants.to_vec(),
                updated_at: Utc::now(),
            },
        );
        debug!(conversation_id, "conversation created");
    }

    /// Messages of a conversation in persistence order.
    pub async fn messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        let state = self.state.read().await;
        state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub async fn updated_at(&self, conversation_id: ConversationId) -> Option<DateTime<Utc>> {
        let state = self.state.read().await;
        state.conversations.get(&conversation_id).map(|c| c.updated_at)
    }

    /// Simulate a storage outage: every call fails until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable("message store is not reachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> AppResult<Message> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&conversation_id) {
            return Err(AppError::Validation(format!(
                "conversation {} does not exist",
                conversation_id
            )));
        }
        state.last_id += 1;
        let message = Message {
            id: state.last_id,
            conversation_id,
            sender_id,
            content: content.to_string(),
            read: false,
            created_at: Utc::now(),
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn touch_conversation(&self, conversation_id: ConversationId) -> AppResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
            conversation.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_messages_read(
        &self,
        message_ids: &[MessageId],
        conversation_id: ConversationId,
        reader: UserId,
    ) -> AppResult<Vec<MessageId>> {
        self.check_available()?;
        let wanted: HashSet<MessageId> = message_ids.iter().copied().collect();
        let mut state = self.state.write().await;
        let mut flipped = Vec::new();
        for message in state.messages.iter_mut() {
            if message.conversation_id == conversation_id
                && wanted.contains(&message.id)
                && message.sender_id != reader
                && !message.read
            {
                message.read = true;
                flipped.push(message.id);
            }
        }
        Ok(flipped)
    }

    async fn participants(&self, conversation_id: ConversationId) -> AppResult<Vec<UserId>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .conversations
            .get(&conversation_id)
            .map(|c| c.participants.clone())
            .unwrap_or_default())
    }
}
