//! End-to-end socket scenarios against a server on an ephemeral port.

mod common;

use common::{start_server, start_server_over, start_server_with, Proxy, SlowInserts, WAIT};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::connect_async;
use unitask_chat::client::{ChatClient, ChatUpdate, ClientConfig, ClientError, ConnectionStatus};
use unitask_chat::db::{ChatStore, MemoryStore};
use unitask_chat::models::ServerEvent;

const QUIET: Duration = Duration::from_millis(300);

#[tokio::test]
async fn message_reaches_room_and_sender_gets_ack() {
    let server = start_server().await;
    let mut a = server.connect(1).await;
    let mut b = server.connect(2).await;
    a.join(7).await;
    b.join(7).await;

    let ack = a
        .request("send-message", json!({ "conversationId": 7, "senderId": 1, "content": "hi" }))
        .await;
    assert_eq!(ack["success"], true);
    let id = ack["message"]["id"].as_i64().unwrap();

    let received = b.next_event("new-message").await;
    assert_eq!(received["id"], id);
    assert_eq!(received["conversation_id"], 7);
    assert_eq!(received["sender_id"], 1);
    assert_eq!(received["content"], "hi");
    assert_eq!(received["read"], false);

    let echo = a.next_event("new-message").await;
    assert_eq!(echo["id"], id);
}

#[tokio::test]
async fn whitespace_message_is_rejected_and_not_broadcast() {
    let server = start_server().await;
    let mut a = server.connect(1).await;
    let mut b = server.connect(2).await;
    a.join(7).await;
    b.join(7).await;

    let ack = a
        .request("send-message", json!({ "conversationId": 7, "senderId": 1, "content": "   " }))
        .await;
    assert_eq!(ack["success"], false);
    assert!(ack["error"].as_str().unwrap().contains("content must not be empty"));

    b.expect_silence("new-message", QUIET).await;
    assert!(server.store.messages(7).await.is_empty());
}

#[tokio::test]
async fn send_without_ack_reports_error_event() {
    let server = start_server().await;
    let mut a = server.connect(1).await;
    a.join(7).await;

    a.emit("send-message", json!({ "conversationId": "nope", "content": "hi" })).await;
    let err = a.next_event("error").await;
    assert_eq!(err["event"], "send-message");
}

#[tokio::test]
async fn sender_id_must_match_the_session() {
    let server = start_server().await;
    let mut a = server.connect(1).await;
    a.join(7).await;

    let ack = a
        .request("send-message", json!({ "conversationId": 7, "senderId": 2, "content": "spoof" }))
        .await;
    assert_eq!(ack["success"], false);
    assert!(server.store.messages(7).await.is_empty());
}

#[tokio::test]
async fn upgrade_without_token_is_refused() {
    let server = start_server().await;
    assert!(connect_async(server.ws_url()).await.is_err());
    let bad = format!("{}?token=not-a-jwt", server.ws_url());
    assert!(connect_async(bad).await.is_err());
}

#[tokio::test]
async fn user_stays_online_until_last_connection_closes() {
    let server = start_server().await;
    let mut observer = server.connect(2).await;
    observer.online(2).await;

    let mut tab1 = server.connect(1).await;
    let mut tab2 = server.connect(1).await;
    tab1.online(1).await;
    tab2.online(1).await;
    observer
        .wait_for("online-users", |users| users == &json!(["1", "2"]))
        .await;
    // Drain the broadcast caused by the second tab.
    observer
        .wait_for("online-users", |users| users == &json!(["1", "2"]))
        .await;

    observer.discard("online-users");

    tab1.close().await;
    observer.expect_silence("online-users", QUIET).await;

    tab2.close().await;
    let users = observer.next_event("online-users").await;
    assert_eq!(users, json!(["2"]));
}

#[tokio::test]
async fn typing_goes_to_others_only() {
    let server = start_server().await;
    let mut a = server.connect(1).await;
    let mut b = server.connect(2).await;
    a.join(7).await;
    b.join(7).await;

    a.emit("typing", json!({ "conversationId": 7, "userId": 1, "isTyping": true })).await;
    let typing = b.next_event("user-typing").await;
    assert_eq!(typing, json!({ "conversationId": 7, "userId": 1, "isTyping": true }));
    a.expect_silence("user-typing", QUIET).await;
}

#[tokio::test]
async fn read_receipts_are_idempotent() {
    let server = start_server().await;
    let mut a = server.connect(1).await;
    let mut b = server.connect(2).await;
    a.join(7).await;
    b.join(7).await;

    let ack = a
        .request("send-message", json!({ "conversationId": 7, "content": "read me" }))
        .await;
    let id = ack["message"]["id"].as_i64().unwrap();

    for _ in 0..2 {
        let reply = b
            .request("mark-messages-read", json!({ "conversationId": 7, "messageIds": [id], "userId": 2 }))
            .await;
        assert_eq!(reply["success"], true);
        let receipt = a.next_event("message-read").await;
        assert_eq!(receipt, json!({ "messageIds": [id], "conversationId": 7, "userId": 2 }));
    }
    assert!(server.store.messages(7).await[0].read);
}

#[tokio::test]
async fn own_messages_are_not_receipted() {
    let server = start_server().await;
    let mut a = server.connect(1).await;
    a.join(7).await;
    let ack = a
        .request("send-message", json!({ "conversationId": 7, "content": "mine" }))
        .await;
    let id = ack["message"]["id"].as_i64().unwrap();

    a.request("mark-messages-read", json!({ "conversationId": 7, "messageIds": [id] }))
        .await;
    assert!(!server.store.messages(7).await[0].read);
}

#[tokio::test]
async fn non_participant_cannot_join() {
    let server = start_server().await;
    let mut outsider = server.connect(3).await;

    let reply = outsider
        .request("join-conversation", json!({ "conversationId": 8 }))
        .await;
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().contains("not a participant"));

    let ack = outsider
        .request("send-message", json!({ "conversationId": 8, "content": "let me in" }))
        .await;
    assert_eq!(ack["success"], false);
}

#[tokio::test]
async fn open_rooms_when_enforcement_is_off() {
    let server = start_server_with(|config| config.enforce_participants = false).await;
    let mut outsider = server.connect(3).await;
    outsider.join(8).await;
}

#[tokio::test]
async fn left_room_stops_receiving() {
    let server = start_server().await;
    let mut a = server.connect(1).await;
    let mut b = server.connect(2).await;
    a.join(7).await;
    b.join(7).await;

    b.emit("leave-conversation", json!({ "conversationId": 7 })).await;
    // Round-trip so the leave is processed before the send.
    b.request("user-active-update", json!(2)).await;

    a.request("send-message", json!({ "conversationId": 7, "content": "gone?" }))
        .await;
    b.expect_silence("new-message", QUIET).await;
}

#[tokio::test]
async fn storage_outage_fails_send_without_broadcast() {
    let server = start_server().await;
    let mut a = server.connect(1).await;
    let mut b = server.connect(2).await;
    a.join(7).await;
    b.join(7).await;

    server.store.set_unavailable(true);
    let ack = a
        .request("send-message", json!({ "conversationId": 7, "content": "lost" }))
        .await;
    assert_eq!(ack["success"], false);
    b.expect_silence("new-message", QUIET).await;

    server.store.set_unavailable(false);
    let ack = a
        .request("send-message", json!({ "conversationId": 7, "content": "back" }))
        .await;
    assert_eq!(ack["success"], true);
}

#[tokio::test]
async fn room_sees_messages_in_persistence_order() {
    let server = start_server().await;
    let mut a = server.connect(1).await;
    let mut c = server.connect(3).await;
    let mut b = server.connect(2).await;
    a.join(7).await;
    c.join(7).await;
    b.join(7).await;

    for i in 0..5 {
        a.emit("send-message", json!({ "conversationId": 7, "content": format!("a{i}") }))
            .await;
        c.emit("send-message", json!({ "conversationId": 7, "content": format!("c{i}") }))
            .await;
    }

    let mut last_id = 0;
    let mut from_a = Vec::new();
    for _ in 0..10 {
        let message = b.next_event("new-message").await;
        let id = message["id"].as_i64().unwrap();
        assert!(id > last_id, "ids must increase: {id} after {last_id}");
        last_id = id;
        if message["sender_id"] == 1 {
            from_a.push(message["content"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(from_a, vec!["a0", "a1", "a2", "a3", "a4"]);
}

#[tokio::test]
async fn silent_connection_is_closed() {
    let server = start_server_with(|config| config.idle_timeout = Duration::from_millis(300)).await;
    let mut idle = server.connect(1).await;
    let closed = tokio::time::timeout(WAIT, async {
        while idle.read_frame().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());
}

/// Consume updates until the client went through `Reconnecting` back to `Connected`.
async fn wait_reconnected(updates: &mut UnboundedReceiver<ChatUpdate>) {
    let mut reconnecting = false;
    let reconnected = tokio::time::timeout(WAIT, async {
        while let Some(update) = updates.recv().await {
            match update {
                ChatUpdate::Status(ConnectionStatus::Reconnecting) => reconnecting = true,
                ChatUpdate::Status(ConnectionStatus::Connected) if reconnecting => return true,
                _ => {}
            }
        }
        false
    })
    .await;
    assert_eq!(reconnected, Ok(true), "client did not reconnect");
}

#[tokio::test]
async fn client_rejoins_rooms_after_reconnect() {
    let server = start_server().await;
    let proxy = Proxy::start(server.addr).await;

    let mut config = ClientConfig::new(proxy.ws_url(), server.token(2), 2);
    config.backoff_min = Duration::from_millis(50);
    config.backoff_max = Duration::from_millis(200);
    let (client, mut updates) = ChatClient::connect(config);
    tokio_test::assert_ok!(client.wait_connected().await);
    client.join(7).await.unwrap();

    proxy.cut();
    wait_reconnected(&mut updates).await;
    assert_eq!(client.status(), ConnectionStatus::Connected);
    // The handshake frames are written before Connected; give the server a moment.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut a = server.connect(1).await;
    a.join(7).await;
    a.request("send-message", json!({ "conversationId": 7, "content": "after reconnect" }))
        .await;

    let delivered = tokio::time::timeout(WAIT, async {
        while let Some(update) = updates.recv().await {
            if let ChatUpdate::Server(ServerEvent::NewMessage(message)) = update {
                return message;
            }
        }
        panic!("update stream ended");
    })
    .await
    .unwrap();
    assert_eq!(delivered.content, "after reconnect");
    assert_eq!(client.active_conversations().await, vec![7]);
    client.disconnect();
}

#[tokio::test]
async fn client_send_leaves_exactly_one_copy() {
    let server = start_server().await;
    let (client, _updates) = ChatClient::connect(ClientConfig::new(server.ws_url(), server.token(1), 1));
    tokio_test::assert_ok!(client.wait_connected().await);
    client.join(7).await.unwrap();

    let message = client.send_message(7, "  hello  ").await.unwrap();
    assert_eq!(message.content, "hello");
    // Let the broadcast echo arrive as well.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let messages = client.messages(7).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].persisted_id(), Some(message.id));
    client.disconnect();
}

#[tokio::test]
async fn client_join_denied_is_not_kept_active() {
    let server = start_server().await;
    let (client, _updates) = ChatClient::connect(ClientConfig::new(server.ws_url(), server.token(3), 3));
    tokio_test::assert_ok!(client.wait_connected().await);

    assert!(client.join(8).await.is_err());
    assert!(client.active_conversations().await.is_empty());
    client.disconnect();
}

#[tokio::test]
async fn open_conversation_receipts_incoming_messages() {
    let server = start_server().await;
    let (client, _updates) = ChatClient::connect(ClientConfig::new(server.ws_url(), server.token(2), 2));
    tokio_test::assert_ok!(client.wait_connected().await);
    client.join(7).await.unwrap();
    client.open_conversation(Some(7)).await;

    let mut a = server.connect(1).await;
    a.join(7).await;
    a.request("send-message", json!({ "conversationId": 7, "content": "seen?" }))
        .await;

    let receipt = a.next_event("message-read").await;
    assert_eq!(receipt["userId"], 2);
    assert!(server.store.messages(7).await[0].read);
    client.disconnect();
}

fn slow_inserts(delay: Duration) -> impl FnOnce(MemoryStore) -> Arc<dyn ChatStore> {
    move |inner| Arc::new(SlowInserts { inner, delay }) as Arc<dyn ChatStore>
}

#[tokio::test]
async fn resent_frame_is_stored_once() {
    let server = start_server_over(slow_inserts(Duration::from_millis(400))).await;
    let mut config = ClientConfig::new(server.ws_url(), server.token(1), 1);
    config.ack_timeout = Duration::from_millis(250);
    let (client, _updates) = ChatClient::connect(config);
    tokio_test::assert_ok!(client.wait_connected().await);
    client.join(7).await.unwrap();

    let message = client.send_message(7, "slow but once").await.unwrap();
    // Let the repeated frame and the broadcast echo land.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stored = server.store.messages(7).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, message.id);
    let local = client.messages(7).await;
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].persisted_id(), Some(message.id));
    client.disconnect();
}

#[tokio::test]
async fn send_times_out_after_every_attempt() {
    let server = start_server_over(slow_inserts(Duration::from_millis(1200))).await;
    let mut config = ClientConfig::new(server.ws_url(), server.token(1), 1);
    config.ack_timeout = Duration::from_millis(150);
    let (client, _updates) = ChatClient::connect(config);
    tokio_test::assert_ok!(client.wait_connected().await);
    client.join(7).await.unwrap();

    let err = client.send_message(7, "too slow").await.unwrap_err();
    assert!(matches!(err, ClientError::AckTimeout { attempts: 3 }));
    assert!(client.messages(7).await.is_empty());

    // The first attempt still lands; the repeats are answered from the first reply.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(server.store.messages(7).await.len(), 1);
    client.disconnect();
}

#[tokio::test]
async fn send_bumps_conversation_updated_at() {
    let server = start_server().await;
    let before = server.store.updated_at(7).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut a = server.connect(1).await;
    a.join(7).await;
    let ack = a
        .request("send-message", json!({ "conversationId": 7, "content": "bump" }))
        .await;
    assert_eq!(ack["success"], true);

    let after = server.store.updated_at(7).await.unwrap();
    assert!(after > before, "updated_at stayed at {before}");
}

#[tokio::test]
async fn client_heartbeat_refreshes_last_active() {
    let server = start_server().await;
    let mut config = ClientConfig::new(server.ws_url(), server.token(1), 1);
    config.heartbeat_interval = Duration::from_millis(100);
    let (client, _updates) = ChatClient::connect(config);
    tokio_test::assert_ok!(client.wait_connected().await);

    let first = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(seen) = server.state.presence.presence_of(1).await.last_active {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    let presence = server.state.presence.presence_of(1).await;
    assert!(presence.online);
    assert!(presence.last_active.unwrap() > first);
    client.disconnect();
}

#[tokio::test]
async fn client_typing_announces_once_then_stops_when_idle() {
    let server = start_server().await;
    let mut config = ClientConfig::new(server.ws_url(), server.token(1), 1);
    config.typing_idle = Duration::from_millis(200);
    let (client, _updates) = ChatClient::connect(config);
    tokio_test::assert_ok!(client.wait_connected().await);
    client.join(7).await.unwrap();

    let mut b = server.connect(2).await;
    b.join(7).await;

    for _ in 0..3 {
        client.input_changed(7).await;
    }
    let started = b.next_event("user-typing").await;
    assert_eq!(started, json!({ "conversationId": 7, "userId": 1, "isTyping": true }));

    let stopped = b.wait_for("user-typing", |data| data["isTyping"] == false).await;
    assert_eq!(stopped["userId"], 1);
    b.expect_silence("user-typing", QUIET).await;
    client.disconnect();
}

#[tokio::test]
async fn client_typing_indicator_expires() {
    let server = start_server().await;
    let mut config = ClientConfig::new(server.ws_url(), server.token(1), 1);
    config.typing_ttl = Duration::from_millis(300);
    let (client, mut updates) = ChatClient::connect(config);
    tokio_test::assert_ok!(client.wait_connected().await);
    client.join(7).await.unwrap();

    let mut b = server.connect(2).await;
    b.join(7).await;
    b.emit("typing", json!({ "conversationId": 7, "isTyping": true })).await;

    let expired = tokio::time::timeout(WAIT, async {
        let mut shown = false;
        while let Some(update) = updates.recv().await {
            match update {
                ChatUpdate::Server(ServerEvent::UserTyping(_)) => {
                    shown = client.typing_users(7).await == vec![2];
                }
                ChatUpdate::TypingExpired {
                    conversation_id: 7,
                    user_id: 2,
                } => return shown,
                _ => {}
            }
        }
        false
    })
    .await;
    assert_eq!(expired, Ok(true), "indicator was not shown and then expired");
    assert!(client.typing_users(7).await.is_empty());
    client.disconnect();
}

#[tokio::test]
async fn conversation_opened_offline_is_receipted_after_reconnect() {
    let server = start_server().await;
    let proxy = Proxy::start(server.addr).await;

    let mut config = ClientConfig::new(proxy.ws_url(), server.token(2), 2);
    config.backoff_min = Duration::from_millis(300);
    config.backoff_max = Duration::from_millis(300);
    let (client, mut updates) = ChatClient::connect(config);
    tokio_test::assert_ok!(client.wait_connected().await);
    client.join(7).await.unwrap();

    let mut a = server.connect(1).await;
    a.join(7).await;
    a.request("send-message", json!({ "conversationId": 7, "content": "read me later" }))
        .await;
    tokio::time::timeout(WAIT, async {
        while let Some(update) = updates.recv().await {
            if let ChatUpdate::MessagesChanged(7) = update {
                return;
            }
        }
    })
    .await
    .unwrap();
    a.expect_silence("message-read", QUIET).await;

    proxy.cut();
    let reconnecting = tokio::time::timeout(WAIT, async {
        while let Some(update) = updates.recv().await {
            if let ChatUpdate::Status(ConnectionStatus::Reconnecting) = update {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(reconnecting, Ok(true));
    client.open_conversation(Some(7)).await;

    let receipt = a.next_event("message-read").await;
    assert_eq!(receipt["userId"], 2);
    assert_eq!(client.status(), ConnectionStatus::Connected);
    assert!(server.store.messages(7).await[0].read);
    client.disconnect();
}
