//! Socket frames exchanged between chat clients and the server.

use serde::{Deserialize, Serialize};

use super::{ConversationId, Message, MessageId, RawId, UserId};

/// Frame sent by a client. An optional top-level `ack` number next to `event` and
/// `data` asks for a direct reply; it is read from the envelope, not from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientMessage {
    UserOnline {
        data: RawId,
    },
    UserActiveUpdate {
        #[serde(default)]
        data: Option<RawId>,
    },
    JoinConversation {
        data: RoomPayload,
    },
    LeaveConversation {
        data: RoomPayload,
    },
    SendMessage {
        data: SendMessagePayload,
    },
    Typing {
        data: TypingPayload,
    },
    MarkMessagesRead {
        data: MarkReadPayload,
    },
}

impl ClientMessage {
    /// Wire name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::UserOnline { .. } => "user-online",
            ClientMessage::UserActiveUpdate { .. } => "user-active-update",
            ClientMessage::JoinConversation { .. } => "join-conversation",
            ClientMessage::LeaveConversation { .. } => "leave-conversation",
            ClientMessage::SendMessage { .. } => "send-message",
            ClientMessage::Typing { .. } => "typing",
            ClientMessage::MarkMessagesRead { .. } => "mark-messages-read",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    pub conversation_id: RawId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<RawId>,
}

/// Send intent as received; every field is checked before anything is persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    #[serde(default)]
    pub conversation_id: Option<RawId>,
    #[serde(default)]
    pub sender_id: Option<RawId>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: RawId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<RawId>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadPayload {
    pub conversation_id: RawId,
    #[serde(default)]
    pub message_ids: Vec<RawId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<RawId>,
}

/// Frame sent by the server: `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    ConnectionEstablished(ConnectionInfo),
    OnlineUsers(Vec<String>),
    NewMessage(Message),
    UserTyping(TypingEvent),
    MessageRead(ReadEvent),
    Ack(AckPayload),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub socket_id: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadEvent {
    pub message_ids: Vec<MessageId>,
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

/// Direct reply to a frame that carried an `ack` number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub ack: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckPayload {
    pub fn ok(ack: u64, message: Option<Message>) -> Self {
        Self {
            ack,
            success: true,
            message,
            error: None,
        }
    }

    pub fn failed(ack: u64, error: impl Into<String>) -> Self {
        Self {
            ack,
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}
