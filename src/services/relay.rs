//! Message relay: validate, persist, then broadcast to the conversation's room.
//!
//! Sends for one conversation go through a single-consumer queue, so the order in which
//! the server accepted them is the order they are persisted and broadcast. Different
//! conversations proceed independently. A queue worker exits after sitting idle.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use validator::{Validate, ValidationError};

use super::{bounded, resolve_user, Broadcaster, PresenceService};
use crate::db::ChatStore;
use crate::error::{AppError, AppResult};
use crate::models::{ConversationId, Message, SendMessagePayload, ServerEvent, UserId};

const QUEUE_IDLE: Duration = Duration::from_secs(30);

/// A send request that passed shape checks. `content` is already trimmed.
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct SendIntent {
    #[validate(range(min = 1))]
    pub conversation_id: ConversationId,
    #[validate(range(min = 1))]
    pub sender_id: UserId,
    #[validate(custom(function = "not_blank"))]
    pub content: String,
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank")
            .with_message(Cow::Borrowed("content must not be empty")));
    }
    Ok(())
}

impl SendIntent {
    /// Check a raw payload from the socket bound to `session_user`.
    pub fn from_payload(
        payload: &SendMessagePayload,
        session_user: UserId,
        max_len: usize,
    ) -> AppResult<Self> {
        let conversation_id = payload
            .conversation_id
            .as_ref()
            .and_then(|raw| raw.parse())
            .ok_or_else(|| {
                AppError::Validation("conversationId must be a positive integer".to_string())
            })?;
        let sender_id = resolve_user(payload.sender_id.as_ref(), session_user)?;
        let content = payload.content.as_deref().unwrap_or_default().trim().to_string();
        if content.chars().count() > max_len {
            return Err(AppError::Validation(format!(
                "content exceeds {} characters",
                max_len
            )));
        }

        let intent = Self {
            conversation_id,
            sender_id,
            content,
        };
        intent
            .validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;
        Ok(intent)
    }
}

struct SendJob {
    intent: SendIntent,
    reply: oneshot::Sender<AppResult<Message>>,
}

struct RelayInner {
    store: Arc<dyn ChatStore>,
    broadcaster: Broadcaster,
    presence: PresenceService,
    queues: Mutex<HashMap<ConversationId, mpsc::UnboundedSender<SendJob>>>,
    persist_timeout: Duration,
    queue_idle: Duration,
}

#[derive(Clone)]
pub struct MessageRelay {
    inner: Arc<RelayInner>,
}

impl MessageRelay {
    pub fn new(
        store: Arc<dyn ChatStore>,
        broadcaster: Broadcaster,
        presence: PresenceService,
        persist_timeout: Duration,
    ) -> Self {
        Self::with_queue_idle(store, broadcaster, presence, persist_timeout, QUEUE_IDLE)
    }

    pub fn with_queue_idle(
        store: Arc<dyn ChatStore>,
        broadcaster: Broadcaster,
        presence: PresenceService,
        persist_timeout: Duration,
        queue_idle: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                store,
                broadcaster,
                presence,
                queues: Mutex::new(HashMap::new()),
                persist_timeout,
                queue_idle,
            }),
        }
    }

    /// Persist and broadcast one message. Resolves once the message is stored and
    /// queued to every room member, or with the error that stopped it. Nothing is
    /// broadcast when persistence fails.
    #[instrument(skip(self, intent), fields(conversation_id = intent.conversation_id, sender_id = intent.sender_id))]
    pub async fn send(&self, intent: SendIntent) -> AppResult<Message> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(SendJob { intent, reply }).await;
        rx.await
            .map_err(|_| AppError::Internal(anyhow::anyhow!("relay queue dropped the send")))?
    }

    /// Number of conversations with a live queue worker.
    pub async fn active_queues(&self) -> usize {
        self.inner.queues.lock().await.len()
    }

    async fn enqueue(&self, job: SendJob) {
        let conversation_id = job.intent.conversation_id;
        let mut queues = self.inner.queues.lock().await;

        let job = match queues.get(&conversation_id) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive until the worker below exits.
        let _ = tx.send(job);
        queues.insert(conversation_id, tx);
        debug!(conversation_id, "relay queue started");
        tokio::spawn(run_queue(self.inner.clone(), conversation_id, rx));
    }
}

async fn run_queue(
    inner: Arc<RelayInner>,
    conversation_id: ConversationId,
    mut rx: mpsc::UnboundedReceiver<SendJob>,
) {
    loop {
        let job = match timeout(inner.queue_idle, rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => {
                // Re-check under the map lock so a job enqueued meanwhile is not lost.
                let mut queues = inner.queues.lock().await;
                match rx.try_recv() {
                    Ok(job) => job,
                    Err(_) => {
                        queues.remove(&conversation_id);
                        break;
                    }
                }
            }
        };
        let result = inner.deliver(&job.intent).await;
        let _ = job.reply.send(result);
    }
    debug!(conversation_id, "relay queue idle, stopped");
}

impl RelayInner {
    async fn deliver(&self, intent: &SendIntent) -> AppResult<Message> {
        let message = bounded(
            self.persist_timeout,
            self.store
                .insert_message(intent.conversation_id, intent.sender_id, &intent.content),
        )
        .await
        .map_err(|e| {
            error!(conversation_id = intent.conversation_id, error = %e, "message persist failed");
            e
        })?;

        if let Err(e) = bounded(
            self.persist_timeout,
            self.store.touch_conversation(intent.conversation_id),
        )
        .await
        {
            warn!(conversation_id = intent.conversation_id, error = %e, "conversation touch failed");
        }

        self.presence.heartbeat(intent.sender_id).await;

        let event = ServerEvent::NewMessage(message.clone());
        match self
            .broadcaster
            .to_room(intent.conversation_id, &event, None)
            .await
        {
            Ok(delivered) => info!(
                message_id = message.id,
                conversation_id = message.conversation_id,
                delivered,
                "message relayed"
            ),
            Err(e) => error!(message_id = message.id, error = %e, "message broadcast failed"),
        }
        Ok(message)
    }
}
