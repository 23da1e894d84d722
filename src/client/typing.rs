//! Typing indicator timing on the client.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

use crate::models::{ConversationId, UserId};

/// Trailing-edge debounce per conversation: announce `true` once, then `false` after
/// `idle` without input. Every keystroke pushes the deadline out.
#[derive(Debug)]
pub struct TypingDebouncer {
    idle: Duration,
    deadlines: HashMap<ConversationId, Instant>,
}

impl TypingDebouncer {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            deadlines: HashMap::new(),
        }
    }

    /// Record input. Returns true when `isTyping=true` should be sent.
    pub fn on_input(&mut self, conversation_id: ConversationId, now: Instant) -> bool {
        self.deadlines
            .insert(conversation_id, now + self.idle)
            .is_none()
    }

    /// Explicit stop (message sent, input cleared). Returns true when `isTyping=false`
    /// should be sent.
    pub fn stop(&mut self, conversation_id: ConversationId) -> bool {
        self.deadlines.remove(&conversation_id).is_some()
    }

    /// Conversations whose idle window has passed; each needs `isTyping=false`.
    pub fn expired(&mut self, now: Instant) -> Vec<ConversationId> {
        let mut done: Vec<ConversationId> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        done.sort_unstable();
        for id in &done {
            self.deadlines.remove(id);
        }
        done
    }
}

/// Who is typing where, as seen by this client. Entries expire after `ttl` even when
/// the matching `isTyping=false` never arrives.
#[derive(Debug)]
pub struct TypingDisplay {
    ttl: Duration,
    entries: HashMap<(ConversationId, UserId), Instant>,
}

impl TypingDisplay {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn apply(&mut self, conversation_id: ConversationId, user_id: UserId, is_typing: bool, now: Instant) {
        if is_typing {
            self.entries.insert((conversation_id, user_id), now + self.ttl);
        } else {
            self.entries.remove(&(conversation_id, user_id));
        }
    }

    pub fn typing_in(&self, conversation_id: ConversationId, now: Instant) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .entries
            .iter()
            .filter(|((conv, _), deadline)| *conv == conversation_id && **deadline > now)
            .map(|((_, user), _)| *user)
            .collect();
        users.sort_unstable();
        users
    }

    /// Drop expired entries and return them.
    pub fn prune(&mut self, now: Instant) -> Vec<(ConversationId, UserId)> {
        let expired: HashSet<(ConversationId, UserId)> = self
            .entries
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        self.entries.retain(|key, _| !expired.contains(key));
        let mut expired: Vec<_> = expired.into_iter().collect();
        expired.sort_unstable();
        expired
    }

    pub fn clear_conversation(&mut self, conversation_id: ConversationId) {
        self.entries.retain(|(conv, _), _| *conv != conversation_id);
    }
}
