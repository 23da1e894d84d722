//! Local message list of one conversation: optimistic sends plus server-confirmed messages.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::models::{ConversationId, Message, MessageId, UserId};

/// Identity of a message in the local list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    /// Optimistic copy waiting for its ack.
    Pending(u64),
    Persisted(MessageId),
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKey::Pending(n) => write!(f, "temp-{}", n),
            MessageKey::Persisted(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalMessage {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl LocalMessage {
    pub fn is_pending(&self) -> bool {
        matches!(self.key, MessageKey::Pending(_))
    }

    pub fn persisted_id(&self) -> Option<MessageId> {
        match self.key {
            MessageKey::Persisted(id) => Some(id),
            MessageKey::Pending(_) => None,
        }
    }
}

impl From<Message> for LocalMessage {
    fn from(message: Message) -> Self {
        Self {
            key: MessageKey::Persisted(message.id),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content,
            read: message.read,
            created_at: message.created_at,
        }
    }
}

/// Persisted messages ordered by id, then pending ones in the order they were sent.
/// A persisted id appears at most once.
#[derive(Debug, Clone, Default)]
pub struct ConversationView {
    messages: Vec<LocalMessage>,
}

impl ConversationView {
    pub fn messages(&self) -> &[LocalMessage] {
        &self.messages
    }

    pub fn add_optimistic(
        &mut self,
        temp_id: u64,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) {
        self.messages.push(LocalMessage {
            key: MessageKey::Pending(temp_id),
            conversation_id,
            sender_id,
            content: content.to_string(),
            read: false,
            created_at: Utc::now(),
        });
    }

    /// The ack for `temp_id` arrived. If the broadcast echo got here first the
    /// placeholder is simply dropped.
    pub fn reconcile(&mut self, temp_id: u64, message: Message) {
        let persisted = self.position_of(message.id);
        let pending = self
            .messages
            .iter()
            .position(|m| m.key == MessageKey::Pending(temp_id));

        match (persisted, pending) {
            (Some(_), Some(idx)) => {
                self.messages.remove(idx);
            }
            (Some(_), None) => {}
            (None, Some(idx)) => self.messages[idx] = message.into(),
            (None, None) => self.messages.push(message.into()),
        }
        self.normalize();
    }

    /// A `new-message` broadcast. Returns false if it was already known.
    pub fn apply_incoming(&mut self, message: Message) -> bool {
        if self.position_of(message.id).is_some() {
            return false;
        }
        let echo = self.messages.iter().position(|m| {
            m.is_pending() && m.sender_id == message.sender_id && m.content == message.content
        });
        match echo {
            Some(idx) => self.messages[idx] = message.into(),
            None => self.messages.push(message.into()),
        }
        self.normalize();
        true
    }

    pub fn remove_pending(&mut self, temp_id: u64) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.key != MessageKey::Pending(temp_id));
        self.messages.len() != before
    }

    /// Apply a `message-read` receipt; the reader's own messages are never flipped.
    pub fn apply_read(&mut self, message_ids: &[MessageId], reader: UserId) -> bool {
        let mut changed = false;
        for message in &mut self.messages {
            let hit = message
                .persisted_id()
                .is_some_and(|id| message_ids.contains(&id));
            if hit && message.sender_id != reader && !message.read {
                message.read = true;
                changed = true;
            }
        }
        changed
    }

    /// Persisted messages from other people that `me` has not read yet.
    pub fn unread_from_others(&self, me: UserId) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| m.sender_id != me && !m.read)
            .filter_map(LocalMessage::persisted_id)
            .collect()
    }

    fn position_of(&self, id: MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.key == MessageKey::Persisted(id))
    }

    fn normalize(&mut self) {
        self.messages.sort_by_key(|m| match m.key {
            MessageKey::Persisted(id) => (false, id),
            MessageKey::Pending(_) => (true, 0),
        });
    }
}
