//! Persisted chat messages and the identifiers that address them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type ConversationId = i64;
pub type MessageId = i64;

/// A persisted message. Immutable once stored except for `read`, which only goes false -> true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Identifier as sent by a client: browsers send numbers or numeric strings.
/// Anything else is kept so validation can report it instead of failing the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Number(i64),
    Text(String),
    Other(serde_json::Value),
}

impl RawId {
    /// Positive integer value, if the raw id is one.
    pub fn parse(&self) -> Option<i64> {
        match self {
            RawId::Number(n) => Some(*n),
            RawId::Text(s) => s.trim().parse::<i64>().ok(),
            RawId::Other(_) => None,
        }
        .filter(|id| *id > 0)
    }
}

impl From<i64> for RawId {
    fn from(value: i64) -> Self {
        RawId::Number(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_id_accepts_numbers_and_numeric_strings() {
        let n: RawId = serde_json::from_str("7").unwrap();
        let s: RawId = serde_json::from_str("\" 12 \"").unwrap();
        assert_eq!(n.parse(), Some(7));
        assert_eq!(s.parse(), Some(12));
    }

    #[test]
    fn raw_id_rejects_garbage_without_failing_deserialization() {
        for raw in ["-3", "0", "\"abc\"", "7.5", "null", "{\"id\":1}"] {
            let id: RawId = serde_json::from_str(raw).unwrap();
            assert_eq!(id.parse(), None, "{raw} should not parse");
        }
    }

    #[test]
    fn message_serializes_with_snake_case_fields() {
        let msg = Message {
            id: 42,
            conversation_id: 7,
            sender_id: 1,
            content: "hi".to_string(),
            read: false,
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["conversation_id"], 7);
        assert_eq!(value["sender_id"], 1);
        assert_eq!(value["read"], false);
    }
}
