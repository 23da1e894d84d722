//! Reconnecting chat client.
//!
//! [`ChatClient::connect`] spawns a supervisor that owns the WebSocket, reconnects with
//! backoff, re-announces presence and re-joins active conversations after every
//! connect. The returned handle is cheap to clone and is the only way to talk to it.

mod backoff;
mod connection;
mod conversation;
mod typing;

pub use backoff::Backoff;
pub use conversation::{ConversationView, LocalMessage, MessageKey};
pub use typing::{TypingDebouncer, TypingDisplay};

use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::{AckPayload, ConversationId, Message, ServerEvent, UserId};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:4000/ws`.
    pub url: String,
    /// Session JWT; sent as `?token=`.
    pub token: String,
    pub user_id: UserId,
    pub connect_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub ack_timeout: Duration,
    /// Extra attempts after the first unacknowledged send.
    pub send_retries: u32,
    pub heartbeat_interval: Duration,
    pub typing_idle: Duration,
    pub typing_ttl: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>, user_id: UserId) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            user_id,
            connect_timeout: Duration::from_secs(20),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
            send_retries: 2,
            heartbeat_interval: Duration::from_secs(30),
            typing_idle: Duration::from_secs(3),
            typing_ttl: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    Status(ConnectionStatus),
    /// Every server event except acks, after local state has been updated.
    Server(ServerEvent),
    MessagesChanged(ConversationId),
    TypingExpired {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no acknowledgment after {attempts} attempts")]
    AckTimeout { attempts: u32 },
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("client closed")]
    Closed,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

struct ClientState {
    active: BTreeSet<ConversationId>,
    open: Option<ConversationId>,
    conversations: HashMap<ConversationId, ConversationView>,
    online: Vec<String>,
    debouncer: TypingDebouncer,
    display: TypingDisplay,
}

pub(crate) struct Shared {
    config: ClientConfig,
    state: Mutex<ClientState>,
    pending: Mutex<HashMap<u64, oneshot::Sender<AckPayload>>>,
    outbound: mpsc::UnboundedSender<String>,
    updates: mpsc::UnboundedSender<ChatUpdate>,
    status: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
    next_ack: AtomicU64,
    next_temp: AtomicU64,
}

/// Handle to a running client. Dropping every handle does not stop the supervisor;
/// call [`ChatClient::disconnect`].
#[derive(Clone)]
pub struct ChatClient {
    shared: Arc<Shared>,
}

pub(crate) fn frame(event: &str, data: Value, ack: Option<u64>) -> String {
    match ack {
        Some(ack) => json!({ "event": event, "data": data, "ack": ack }),
        None => json!({ "event": event, "data": data }),
    }
    .to_string()
}

impl ChatClient {
    /// Start the supervisor. Must be called inside a tokio runtime.
    pub fn connect(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<ChatUpdate>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);

        let shared = Arc::new(Shared {
            state: Mutex::new(ClientState {
                active: BTreeSet::new(),
                open: None,
                conversations: HashMap::new(),
                online: Vec::new(),
                debouncer: TypingDebouncer::new(config.typing_idle),
                display: TypingDisplay::new(config.typing_ttl),
            }),
            config,
            pending: Mutex::new(HashMap::new()),
            outbound,
            updates,
            status,
            cancel: CancellationToken::new(),
            next_ack: AtomicU64::new(1),
            next_temp: AtomicU64::new(1),
        });

        tokio::spawn(connection::run(shared.clone(), outbound_rx));
        (Self { shared }, updates_rx)
    }

    pub fn user_id(&self) -> UserId {
        self.shared.config.user_id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Resolve once the transport is up (or fail if the client was closed).
    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        self.shared.wait_connected().await
    }

    /// Tear down the transport. Pending acknowledgments resolve to [`ClientError::Closed`].
    pub fn disconnect(&self) {
        self.shared.cancel.cancel();
    }

    /// Join a conversation and keep it active across reconnects. A denied join is not
    /// kept.
    pub async fn join(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.shared.state.lock().await.active.insert(conversation_id);
        let data = json!({ "conversationId": conversation_id, "userId": self.user_id() });
        match self.shared.request("join-conversation", data).await {
            Ok(reply) if reply.success => Ok(()),
            Ok(reply) => {
                self.shared.state.lock().await.active.remove(&conversation_id);
                Err(ClientError::Rejected(reply.error.unwrap_or_default()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn leave(&self, conversation_id: ConversationId) {
        let announce_stop = {
            let mut state = self.shared.state.lock().await;
            state.active.remove(&conversation_id);
            if state.open == Some(conversation_id) {
                state.open = None;
            }
            state.display.clear_conversation(conversation_id);
            state.debouncer.stop(conversation_id)
        };
        if announce_stop {
            self.shared.push_typing(conversation_id, false);
        }
        self.shared.push(
            "leave-conversation",
            json!({ "conversationId": conversation_id, "userId": self.user_id() }),
        );
    }

    /// Mark a conversation as the one on screen. Its unread messages are receipted now
    /// and on every later list update.
    pub async fn open_conversation(&self, conversation_id: Option<ConversationId>) {
        self.shared.state.lock().await.open = conversation_id;
        if let Some(conversation_id) = conversation_id {
            self.shared.auto_mark_read(conversation_id).await;
        }
    }

    /// Send with an optimistic placeholder. Retries unacknowledged attempts with the
    /// same ack number; the placeholder is replaced by the persisted message or removed.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<Message, ClientError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::InvalidInput("content must not be empty".to_string()));
        }

        let temp_id = self.shared.next_temp.fetch_add(1, Ordering::Relaxed);
        let announce_stop = {
            let mut state = self.shared.state.lock().await;
            state
                .conversations
                .entry(conversation_id)
                .or_default()
                .add_optimistic(temp_id, conversation_id, self.user_id(), content);
            state.debouncer.stop(conversation_id)
        };
        self.shared.notify(ChatUpdate::MessagesChanged(conversation_id));
        if announce_stop {
            self.shared.push_typing(conversation_id, false);
        }

        let data = json!({
            "conversationId": conversation_id,
            "senderId": self.user_id(),
            "content": content,
        });
        let outcome = match self.shared.request("send-message", data).await {
            Ok(AckPayload {
                success: true,
                message: Some(message),
                ..
            }) => Ok(message),
            Ok(reply) => Err(ClientError::Rejected(
                reply.error.unwrap_or_else(|| "ack carried no message".to_string()),
            )),
            Err(e) => Err(e),
        };

        {
            let mut state = self.shared.state.lock().await;
            let view = state.conversations.entry(conversation_id).or_default();
            match &outcome {
                Ok(message) => view.reconcile(temp_id, message.clone()),
                Err(_) => {
                    view.remove_pending(temp_id);
                }
            }
        }
        self.shared.notify(ChatUpdate::MessagesChanged(conversation_id));
        outcome
    }

    /// Call on every change of the input box.
    pub async fn input_changed(&self, conversation_id: ConversationId) {
        let announce = self
            .shared
            .state
            .lock()
            .await
            .debouncer
            .on_input(conversation_id, Instant::now());
        if announce {
            self.shared.push_typing(conversation_id, true);
        }
    }

    pub async fn stop_typing(&self, conversation_id: ConversationId) {
        let announce = self.shared.state.lock().await.debouncer.stop(conversation_id);
        if announce {
            self.shared.push_typing(conversation_id, false);
        }
    }

    pub async fn messages(&self, conversation_id: ConversationId) -> Vec<LocalMessage> {
        self.shared
            .state
            .lock()
            .await
            .conversations
            .get(&conversation_id)
            .map(|view| view.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn typing_users(&self, conversation_id: ConversationId) -> Vec<UserId> {
        self.shared
            .state
            .lock()
            .await
            .display
            .typing_in(conversation_id, Instant::now())
    }

    pub async fn online_users(&self) -> Vec<String> {
        self.shared.state.lock().await.online.clone()
    }

    pub async fn active_conversations(&self) -> Vec<ConversationId> {
        self.shared.state.lock().await.active.iter().copied().collect()
    }
}

impl Shared {
    fn notify(&self, update: ChatUpdate) {
        let _ = self.updates.send(update);
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            debug!(?status, "client status");
            self.notify(ChatUpdate::Status(status));
        }
    }

    async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut status = self.status.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return Err(ClientError::Closed);
            }
            if *status.borrow_and_update() == ConnectionStatus::Connected {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ClientError::Closed),
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(ClientError::Closed);
                    }
                }
            }
        }
    }

    /// Queue a fire-and-forget frame. Frames queued while disconnected are dropped on
    /// the next connect.
    fn push(&self, event: &str, data: Value) {
        let _ = self.outbound.send(frame(event, data, None));
    }

    fn push_typing(&self, conversation_id: ConversationId, is_typing: bool) {
        self.push(
            "typing",
            json!({
                "conversationId": conversation_id,
                "userId": self.config.user_id,
                "isTyping": is_typing,
            }),
        );
    }

    /// Send a frame that expects an `ack`, retrying on timeout or transport loss.
    async fn request(&self, event: &str, data: Value) -> Result<AckPayload, ClientError> {
        let ack = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let text = frame(event, data, Some(ack));
        let attempts = self.config.send_retries + 1;

        for attempt in 1..=attempts {
            // Time spent offline counts against the attempt.
            match timeout(self.config.ack_timeout, self.wait_connected()).await {
                Ok(connected) => connected?,
                Err(_) => {
                    warn!(event, ack, attempt, "still offline, attempt spent");
                    continue;
                }
            }
            let (tx, rx) = oneshot::channel();
            self.pending.lock().await.insert(ack, tx);
            self.outbound
                .send(text.clone())
                .map_err(|_| ClientError::Closed)?;

            match timeout(self.config.ack_timeout, rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) if self.cancel.is_cancelled() => return Err(ClientError::Closed),
                Ok(Err(_)) => debug!(event, ack, attempt, "transport dropped before ack"),
                Err(_) => {
                    self.pending.lock().await.remove(&ack);
                    warn!(event, ack, attempt, "ack timed out");
                }
            }
        }
        Err(ClientError::AckTimeout { attempts })
    }

    /// Abandon every outstanding ack wait.
    pub(crate) async fn drop_pending(&self) {
        self.pending.lock().await.clear();
    }

    /// Frames sent right after a connect: presence, then a join per active conversation.
    pub(crate) async fn handshake_frames(&self) -> Vec<String> {
        let user_id = self.config.user_id;
        let state = self.state.lock().await;
        let mut frames = vec![frame("user-online", json!(user_id), None)];
        frames.extend(state.active.iter().map(|conversation_id| {
            frame(
                "join-conversation",
                json!({ "conversationId": conversation_id, "userId": user_id }),
                None,
            )
        }));
        frames
    }

    pub(crate) fn heartbeat_frame(&self) -> String {
        frame("user-active-update", json!(self.config.user_id), None)
    }

    /// Apply one server frame to local state and forward it.
    pub(crate) async fn handle_incoming(&self, text: &str) {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "unparseable server frame");
                return;
            }
        };

        match &event {
            ServerEvent::Ack(reply) => {
                if let Some(tx) = self.pending.lock().await.remove(&reply.ack) {
                    let _ = tx.send(reply.clone());
                }
                return;
            }
            ServerEvent::NewMessage(message) => {
                let conversation_id = message.conversation_id;
                let changed = self
                    .state
                    .lock()
                    .await
                    .conversations
                    .entry(conversation_id)
                    .or_default()
                    .apply_incoming(message.clone());
                if changed {
                    self.notify(ChatUpdate::MessagesChanged(conversation_id));
                    self.auto_mark_read(conversation_id).await;
                }
            }
            ServerEvent::MessageRead(receipt) => {
                let changed = self
                    .state
                    .lock()
                    .await
                    .conversations
                    .entry(receipt.conversation_id)
                    .or_default()
                    .apply_read(&receipt.message_ids, receipt.user_id);
                if changed {
                    self.notify(ChatUpdate::MessagesChanged(receipt.conversation_id));
                }
            }
            ServerEvent::UserTyping(typing) if typing.user_id != self.config.user_id => {
                self.state.lock().await.display.apply(
                    typing.conversation_id,
                    typing.user_id,
                    typing.is_typing,
                    Instant::now(),
                );
            }
            ServerEvent::OnlineUsers(users) => {
                self.state.lock().await.online = users.clone();
            }
            ServerEvent::Error(err) => {
                warn!(message = %err.message, event = ?err.event, "server reported an error");
            }
            _ => {}
        }
        self.notify(ChatUpdate::Server(event));
    }

    /// Periodic housekeeping: stop stale typing announcements, expire others' indicators.
    pub(crate) async fn on_tick(&self) {
        let now = Instant::now();
        let (stopped, expired) = {
            let mut state = self.state.lock().await;
            (state.debouncer.expired(now), state.display.prune(now))
        };
        for conversation_id in stopped {
            self.push_typing(conversation_id, false);
        }
        for (conversation_id, user_id) in expired {
            self.notify(ChatUpdate::TypingExpired {
                conversation_id,
                user_id,
            });
        }
    }

    /// Receipt the open conversation again once a new connection is up, since receipts
    /// queued while offline were dropped.
    pub(crate) async fn resume_open(&self) {
        let open = self.state.lock().await.open;
        if let Some(conversation_id) = open {
            self.auto_mark_read(conversation_id).await;
        }
    }

    async fn auto_mark_read(&self, conversation_id: ConversationId) {
        let unread = {
            let state = self.state.lock().await;
            if state.open != Some(conversation_id) {
                return;
            }
            state
                .conversations
                .get(&conversation_id)
                .map(|view| view.unread_from_others(self.config.user_id))
                .unwrap_or_default()
        };
        if unread.is_empty() {
            return;
        }
        self.push(
            "mark-messages-read",
            json!({
                "conversationId": conversation_id,
                "messageIds": unread,
                "userId": self.config.user_id,
            }),
        );
    }
}
