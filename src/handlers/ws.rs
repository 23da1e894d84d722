//! WebSocket handler: session binding, frame dispatch, acks and disconnect cleanup.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::handlers::http::AppState;
use crate::middleware::bearer_token;
use crate::models::{
    generate_socket_id, AckPayload, Authorization, ClientMessage, ConnectionId, ConnectionInfo,
    ConversationId, ErrorPayload, Message as ChatMessage, MessageId, RawId, ServerEvent, UserId,
};
use crate::services::{resolve_user, SendIntent};

/// Upgrade HTTP to WebSocket. The session token is checked before the upgrade.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let token = params
        .get("token")
        .map(String::as_str)
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| AppError::Auth("Missing session token".to_string()))?;
    let user_id = state.jwt_secret().validate(token)?;

    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, user_id)))
}

async fn handle_socket(state: AppState, socket: WebSocket, user_id: UserId) {
    let socket_id = generate_socket_id();
    info!(socket_id = %socket_id, user_id, "ws connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.registry.insert(&socket_id, user_id, tx.clone()).await;

    let mut session = Session::new(&state, &socket_id, user_id, tx);
    session.push(&ServerEvent::ConnectionEstablished(ConnectionInfo {
        socket_id: socket_id.clone(),
        user_id,
    }));

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = match timeout(state.settings.idle_timeout, receiver.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                debug!(socket_id = %socket_id, error = %e, "ws read failed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(socket_id = %socket_id, "ws idle timeout");
                break;
            }
        };
        match frame {
            Message::Text(text) => session.handle_text(&text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    drop(session);
    disconnect(&state, &socket_id).await;
    send_task.abort();
    info!(socket_id = %socket_id, user_id, "ws disconnected");
}

/// Remove every trace of a closed connection and announce the user offline if it was
/// their last one.
async fn disconnect(state: &AppState, socket_id: &ConnectionId) {
    let left = state.rooms.leave_all(socket_id).await;
    state.registry.remove(socket_id).await;
    debug!(socket_id = %socket_id, rooms = left.len(), "connection removed");

    if let Some(departure) = state.presence.connection_closed(socket_id).await {
        if departure.went_offline {
            info!(user_id = departure.user_id, "user offline");
            broadcast_online_users(state).await;
        }
    }
}

async fn broadcast_online_users(state: &AppState) {
    let users = state
        .presence
        .online_users()
        .await
        .into_iter()
        .map(|id| id.to_string())
        .collect();
    if let Err(e) = state.broadcaster.to_all(&ServerEvent::OnlineUsers(users)).await {
        warn!(error = %e, "online-users broadcast failed");
    }
}

/// Successful replies by ack number. A repeated ack number is answered from here and
/// not run again.
#[derive(Debug, Default)]
struct AnsweredAcks {
    replies: HashMap<u64, AckPayload>,
    order: VecDeque<u64>,
}

impl AnsweredAcks {
    fn get(&self, ack: u64) -> Option<&AckPayload> {
        self.replies.get(&ack)
    }

    fn remember(&mut self, reply: AckPayload) {
        if self.replies.insert(reply.ack, reply.clone()).is_none() {
            self.order.push_back(reply.ack);
        }
        while self.order.len() > ANSWERED_ACKS_KEPT {
            if let Some(oldest) = self.order.pop_front() {
                self.replies.remove(&oldest);
            }
        }
    }
}

const ANSWERED_ACKS_KEPT: usize = 256;

struct Session<'a> {
    state: &'a AppState,
    socket_id: &'a ConnectionId,
    user_id: UserId,
    tx: mpsc::UnboundedSender<String>,
    answered: AnsweredAcks,
}

impl<'a> Session<'a> {
    fn new(
        state: &'a AppState,
        socket_id: &'a ConnectionId,
        user_id: UserId,
        tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            state,
            socket_id,
            user_id,
            tx,
            answered: AnsweredAcks::default(),
        }
    }

    fn push(&self, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(text) => {
                let _ = self.tx.send(text);
            }
            Err(e) => warn!(socket_id = %self.socket_id, error = %e, "event serialization failed"),
        }
    }

    /// Parse one text frame, run it, and answer through the ack or an `error` event.
    async fn handle_text(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                self.reject(None, None, AppError::Validation(format!("malformed frame: {}", e)));
                return;
            }
        };
        let ack = value.get("ack").and_then(Value::as_u64);
        let event = value.get("event").and_then(Value::as_str).map(str::to_string);

        if let Some(reply) = ack.and_then(|ack| self.answered.get(ack)) {
            debug!(socket_id = %self.socket_id, ack = reply.ack, "repeated ack, replaying reply");
            self.push(&ServerEvent::Ack(reply.clone()));
            return;
        }

        let msg = match serde_json::from_value::<ClientMessage>(value) {
            Ok(msg) => msg,
            Err(e) => {
                self.reject(ack, event, AppError::Validation(format!("invalid frame: {}", e)));
                return;
            }
        };

        let name = msg.name();
        match self.dispatch(msg).await {
            Ok(message) => {
                if let Some(ack) = ack {
                    let reply = AckPayload::ok(ack, message);
                    self.push(&ServerEvent::Ack(reply.clone()));
                    self.answered.remember(reply);
                }
            }
            Err(e) => self.reject(ack, Some(name.to_string()), e),
        }
    }

    fn reject(&self, ack: Option<u64>, event: Option<String>, error: AppError) {
        warn!(socket_id = %self.socket_id, event = ?event, error = %error, "frame rejected");
        let message = error.client_message();
        match ack {
            Some(ack) => self.push(&ServerEvent::Ack(AckPayload::failed(ack, message))),
            None => self.push(&ServerEvent::Error(ErrorPayload { message, event })),
        }
    }

    async fn dispatch(&self, msg: ClientMessage) -> AppResult<Option<ChatMessage>> {
        let state = self.state;
        match msg {
            ClientMessage::UserOnline { data } => {
                let user_id = resolve_user(Some(&data), self.user_id)?;
                if state.presence.register_online(self.socket_id, user_id).await {
                    info!(user_id, "user online");
                }
                broadcast_online_users(state).await;
                Ok(None)
            }
            ClientMessage::UserActiveUpdate { data } => {
                let user_id = resolve_user(data.as_ref(), self.user_id)?;
                state.presence.heartbeat(user_id).await;
                Ok(None)
            }
            ClientMessage::JoinConversation { data } => {
                let conversation_id = conversation_id(&data.conversation_id)?;
                let user_id = resolve_user(data.user_id.as_ref(), self.user_id)?;
                match state.authorizer.authorize(conversation_id, user_id).await? {
                    Authorization::Allowed => {
                        state.rooms.join(self.socket_id, conversation_id).await;
                        Ok(None)
                    }
                    Authorization::Denied(reason) => Err(AppError::Forbidden(reason)),
                }
            }
            ClientMessage::LeaveConversation { data } => {
                let conversation_id = conversation_id(&data.conversation_id)?;
                state.rooms.leave(self.socket_id, conversation_id).await;
                Ok(None)
            }
            ClientMessage::SendMessage { data } => {
                let intent =
                    SendIntent::from_payload(&data, self.user_id, state.settings.max_message_len)?;
                self.require_member(intent.conversation_id).await?;
                let message = state.relay.send(intent).await?;
                Ok(Some(message))
            }
            ClientMessage::Typing { data } => {
                let conversation_id = conversation_id(&data.conversation_id)?;
                let user_id = resolve_user(data.user_id.as_ref(), self.user_id)?;
                self.require_member(conversation_id).await?;
                state
                    .typing
                    .relay(self.socket_id, conversation_id, user_id, data.is_typing)
                    .await?;
                Ok(None)
            }
            ClientMessage::MarkMessagesRead { data } => {
                let conversation_id = conversation_id(&data.conversation_id)?;
                let reader = resolve_user(data.user_id.as_ref(), self.user_id)?;
                let ids = data
                    .message_ids
                    .iter()
                    .map(|raw| {
                        raw.parse().ok_or_else(|| {
                            AppError::Validation("messageIds must be positive integers".to_string())
                        })
                    })
                    .collect::<AppResult<Vec<MessageId>>>()?;
                self.require_member(conversation_id).await?;
                state.receipts.mark_read(conversation_id, &ids, reader).await?;
                Ok(None)
            }
        }
    }

    async fn require_member(&self, conversation_id: ConversationId) -> AppResult<()> {
        if self.state.authorizer.enforcing()
            && !self.state.rooms.is_member(self.socket_id, conversation_id).await
        {
            return Err(AppError::Forbidden(format!(
                "join conversation {} first",
                conversation_id
            )));
        }
        Ok(())
    }
}

fn conversation_id(raw: &RawId) -> AppResult<ConversationId> {
    raw.parse()
        .ok_or_else(|| AppError::Validation("conversationId must be a positive integer".to_string()))
}
