//! Supervisor task: connect, handshake, pump frames, reconnect with backoff.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{Backoff, ConnectionStatus, Shared};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const HOUSEKEEPING_TICK: Duration = Duration::from_millis(250);

pub(super) async fn run(shared: Arc<Shared>, mut outbound: mpsc::UnboundedReceiver<String>) {
    let config = shared.config.clone();
    let mut backoff = Backoff::new(config.backoff_min, config.backoff_max);
    let mut ever_connected = false;

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        shared.set_status(if ever_connected {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Connecting
        });

        let url = build_ws_url(&config.url, &config.token);
        let attempt = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            attempt = timeout(config.connect_timeout, connect_async(url)) => attempt,
        };

        match attempt {
            Ok(Ok((stream, _))) => {
                backoff.reset();
                ever_connected = true;
                let reason = session(&shared, stream, &mut outbound).await;
                info!(reason, "chat transport closed");
                if !shared.cancel.is_cancelled() {
                    shared.set_status(ConnectionStatus::Reconnecting);
                }
                shared.drop_pending().await;
            }
            Ok(Err(e)) => debug!(error = %e, "chat connect failed"),
            Err(_) => warn!(timeout = ?config.connect_timeout, "chat connect timed out"),
        }

        if shared.cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff.next_delay()) => {}
        }
    }

    shared.drop_pending().await;
    shared.set_status(ConnectionStatus::Disconnected);
}

/// Drive one live connection until it ends. Returns why it ended.
async fn session(
    shared: &Shared,
    stream: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<String>,
) -> &'static str {
    let (mut write, mut read) = stream.split();

    // Frames queued while offline refer to a room state the server no longer has.
    while outbound.try_recv().is_ok() {}

    for text in shared.handshake_frames().await {
        if write.send(WsMessage::Text(text)).await.is_err() {
            return "handshake write failed";
        }
    }
    shared.set_status(ConnectionStatus::Connected);
    shared.resume_open().await;

    let every = shared.config.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + every, every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut housekeeping = interval(HOUSEKEEPING_TICK);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return "closed by client";
            }
            Some(text) = outbound.recv() => {
                if write.send(WsMessage::Text(text)).await.is_err() {
                    return "write failed";
                }
            }
            msg = read.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => shared.handle_incoming(&text).await,
                Some(Ok(WsMessage::Close(_))) | None => return "closed by server",
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "chat read failed");
                    return "read failed";
                }
            },
            _ = heartbeat.tick() => {
                if write.send(WsMessage::Text(shared.heartbeat_frame())).await.is_err() {
                    return "write failed";
                }
            }
            _ = housekeeping.tick() => shared.on_tick().await,
        }
    }
}

/// Append the session token to the socket URL. `http(s)` bases are mapped to `ws(s)`.
fn build_ws_url(base_url: &str, token: &str) -> String {
    let ws_base = if base_url.starts_with("https://") {
        base_url.replacen("https://", "wss://", 1)
    } else {
        base_url.replacen("http://", "ws://", 1)
    };
    let sep = if ws_base.contains('?') { '&' } else { '?' };
    format!("{ws_base}{sep}token={token}")
}
