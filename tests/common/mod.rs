//! Shared helpers: a server on an ephemeral port, raw socket clients, a killable proxy.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use unitask_chat::auth::JwtSecret;
use unitask_chat::db::{ChatStore, MemoryStore};
use unitask_chat::error::AppResult;
use unitask_chat::models::Message as ChatMessage;
use unitask_chat::{create_app, AppState, Config};

pub const SECRET: &str = "test-jwt-secret-min-32-chars!!";
pub const WAIT: Duration = Duration::from_secs(3);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: MemoryStore,
    pub state: AppState,
    secret: JwtSecret,
}

/// Conversation 7 has users 1, 2 and 3; conversation 8 has users 1 and 2.
pub async fn start_server() -> TestServer {
    start_server_with(|_| {}).await
}

pub async fn start_server_with(tweak: impl FnOnce(&mut Config)) -> TestServer {
    launch(tweak, |store| Arc::new(store) as Arc<dyn ChatStore>).await
}

/// Like [`start_server`], with the store seen by the server wrapped by `wrap`.
pub async fn start_server_over(
    wrap: impl FnOnce(MemoryStore) -> Arc<dyn ChatStore>,
) -> TestServer {
    launch(|_| {}, wrap).await
}

async fn launch(
    tweak: impl FnOnce(&mut Config),
    wrap: impl FnOnce(MemoryStore) -> Arc<dyn ChatStore>,
) -> TestServer {
    let mut config = Config::default();
    config.jwt_secret = SECRET.to_string();
    config.persist_timeout = Duration::from_secs(2);
    tweak(&mut config);

    let store = MemoryStore::new();
    store.create_conversation(7, &[1, 2, 3]).await;
    store.create_conversation(8, &[1, 2]).await;

    let state = AppState::new(&config, wrap(store.clone()));
    let app = create_app(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        store,
        state,
        secret: JwtSecret::new(SECRET.to_string()),
    }
}

/// Store whose inserts take `delay` before reaching the inner store.
pub struct SlowInserts {
    pub inner: MemoryStore,
    pub delay: Duration,
}

#[async_trait]
impl ChatStore for SlowInserts {
    async fn insert_message(
        &self,
        conversation_id: i64,
        sender_id: i64,
        content: &str,
    ) -> AppResult<ChatMessage> {
        tokio::time::sleep(self.delay).await;
        self.inner.insert_message(conversation_id, sender_id, content).await
    }

    async fn touch_conversation(&self, conversation_id: i64) -> AppResult<()> {
        self.inner.touch_conversation(conversation_id).await
    }

    async fn mark_messages_read(
        &self,
        message_ids: &[i64],
        conversation_id: i64,
        reader: i64,
    ) -> AppResult<Vec<i64>> {
        self.inner.mark_messages_read(message_ids, conversation_id, reader).await
    }

    async fn participants(&self, conversation_id: i64) -> AppResult<Vec<i64>> {
        self.inner.participants(conversation_id).await
    }
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn token(&self, user_id: i64) -> String {
        self.secret.issue(user_id).unwrap()
    }

    pub async fn connect(&self, user_id: i64) -> TestSocket {
        let url = format!("{}?token={}", self.ws_url(), self.token(user_id));
        let (ws, _) = connect_async(url).await.unwrap();
        let (write, read) = ws.split();
        let mut socket = TestSocket {
            write,
            read,
            backlog: VecDeque::new(),
            next_ack: 1,
            socket_id: String::new(),
        };
        let established = socket.next_event("connection-established").await;
        assert_eq!(established["user_id"], user_id);
        socket.socket_id = established["socket_id"].as_str().unwrap().to_string();
        socket
    }
}

/// A raw protocol client. Frames read while waiting for something else are kept.
pub struct TestSocket {
    write: SplitSink<Ws, Message>,
    read: SplitStream<Ws>,
    backlog: VecDeque<Value>,
    next_ack: u64,
    pub socket_id: String,
}

impl TestSocket {
    pub async fn emit(&mut self, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data });
        self.write.send(Message::Text(frame.to_string())).await.unwrap();
    }

    /// Send with an ack number and wait for the matching `ack` payload.
    pub async fn request(&mut self, event: &str, data: Value) -> Value {
        let ack = self.next_ack;
        self.next_ack += 1;
        let frame = json!({ "event": event, "data": data, "ack": ack });
        self.write.send(Message::Text(frame.to_string())).await.unwrap();
        self.wait_for("ack", |data| data["ack"] == ack).await
    }

    pub async fn join(&mut self, conversation_id: i64) {
        let reply = self
            .request("join-conversation", json!({ "conversationId": conversation_id }))
            .await;
        assert_eq!(reply["success"], true, "join failed: {reply}");
    }

    pub async fn online(&mut self, user_id: i64) {
        let reply = self.request("user-online", json!(user_id)).await;
        assert_eq!(reply["success"], true);
    }

    pub async fn next_event(&mut self, name: &str) -> Value {
        self.wait_for(name, |_| true).await
    }

    /// Data of the first `name` frame matching `pred`; earlier non-matching frames of
    /// other names stay queued.
    pub async fn wait_for(&mut self, name: &str, pred: impl Fn(&Value) -> bool) -> Value {
        if let Some(idx) = self
            .backlog
            .iter()
            .position(|f| f["event"] == name && pred(&f["data"]))
        {
            let frame = self.backlog.remove(idx).unwrap();
            return frame["data"].clone();
        }
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.read_frame())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
                .unwrap_or_else(|| panic!("socket closed while waiting for {name}"));
            if frame["event"] == name && pred(&frame["data"]) {
                return frame["data"].clone();
            }
            self.backlog.push_back(frame);
        }
    }

    /// Forget already-received `name` frames.
    pub fn discard(&mut self, name: &str) {
        self.backlog.retain(|f| f["event"] != name);
    }

    /// Assert that no `name` frame shows up within `window`.
    pub async fn expect_silence(&mut self, name: &str, window: Duration) {
        assert!(
            !self.backlog.iter().any(|f| f["event"] == name),
            "unexpected {name} already received"
        );
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, self.read_frame()).await {
            assert_ne!(frame["event"], name, "unexpected frame: {frame}");
            self.backlog.push_back(frame);
        }
    }

    /// Next JSON frame, or None once the server closed the socket.
    pub async fn read_frame(&mut self) -> Option<Value> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.write.send(Message::Close(None)).await;
    }
}

/// TCP proxy in front of the server; `cut` severs every live connection.
pub struct Proxy {
    pub addr: SocketAddr,
    links: Arc<Mutex<Vec<AbortHandle>>>,
}

impl Proxy {
    pub async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let links = Arc::new(Mutex::new(Vec::new()));
        let registry = links.clone();
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let Ok(mut outbound) = TcpStream::connect(upstream).await else {
                    continue;
                };
                let task = tokio::spawn(async move {
                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                });
                registry.lock().unwrap().push(task.abort_handle());
            }
        });
        Self { addr, links }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn cut(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }
}
