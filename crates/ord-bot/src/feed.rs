//! Live marketplace feed over WebSocket.
//!
//! On connect the client subscribes once per watched collection and sends a
//! periodic heartbeat. Every received message is handed to the event queue;
//! validation and dedup happen there, never here.
//!
//! Reconnection: exponential backoff of 1s/2s/4s/8s/16s across five
//! consecutive disconnects, then a single five-minute cooldown that resets
//! the attempt counter. The loop retries indefinitely; exhausting the
//! bounded attempts never terminates the process.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use crate::config::FeedSettings;
use crate::queue::EventQueue;

/// Backoff attempts before the long cooldown.
const MAX_BACKOFF_ATTEMPTS: u32 = 5;

/// Cooldown after the bounded attempts are exhausted.
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(300);

/// Feed connection errors.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("stream ended")]
    StreamEnded,

    #[error("connect timeout")]
    Timeout,
}

/// Wait before the next reconnect attempt, and advance the counter.
///
/// Consecutive failures 1..=5 wait 1s, 2s, 4s, 8s and 16s; the next failure
/// waits the long cooldown and resets the counter, so the sequence starts
/// over afterwards.
fn next_reconnect_delay(attempt: &mut u32) -> Duration {
    *attempt += 1;
    if *attempt > MAX_BACKOFF_ATTEMPTS {
        *attempt = 0;
        RECONNECT_COOLDOWN
    } else {
        Duration::from_millis(1000u64 << (*attempt - 1))
    }
}

/// Run the feed until shutdown. Reconnects forever per the policy above.
pub async fn run_feed(
    url: String,
    settings: FeedSettings,
    collections: HashSet<String>,
    queue: Arc<EventQueue>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut attempt: u32 = 0;

    loop {
        if shutdown.try_recv().is_ok() {
            info!("feed: shutdown signal received");
            return;
        }

        match run_feed_session(&url, &settings, &collections, &queue, &mut shutdown).await {
            Ok(()) => {
                info!("feed: clean shutdown");
                return;
            }
            Err(e) => {
                let delay = next_reconnect_delay(&mut attempt);
                if attempt == 0 {
                    warn!(
                        error = %e,
                        cooldown_secs = delay.as_secs(),
                        "feed: reconnect attempts exhausted, entering cooldown"
                    );
                } else {
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "feed: reconnecting");
                }

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => {
                        info!("feed: shutdown during reconnect wait");
                        return;
                    }
                }
            }
        }
    }
}

/// Run a single feed session: connect, subscribe, pump messages.
async fn run_feed_session(
    url: &str,
    settings: &FeedSettings,
    collections: &HashSet<String>,
    queue: &EventQueue,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), FeedError> {
    info!(url, "connecting to marketplace feed");

    let connect_timeout = Duration::from_secs(settings.connect_timeout_secs);
    let connect_result = tokio::time::timeout(connect_timeout, connect_async(url)).await;

    let (ws_stream, _) = match connect_result {
        Ok(Ok((stream, response))) => (stream, response),
        Ok(Err(e)) => return Err(FeedError::Connection(e.to_string())),
        Err(_) => return Err(FeedError::Timeout),
    };

    info!("connected to marketplace feed");

    let (mut write, mut read) = ws_stream.split();

    // One subscription per watched collection.
    for symbol in collections {
        let subscribe_msg = serde_json::json!({
            "type": "subscribe",
            "collectionSymbol": symbol,
        });
        write
            .send(Message::Text(subscribe_msg.to_string()))
            .await
            .map_err(|e| FeedError::WebSocket(e.to_string()))?;
    }
    info!(count = collections.len(), "subscribed to collections");

    let mut heartbeat = interval(Duration::from_secs(settings.heartbeat_secs));
    heartbeat.tick().await; // skip immediate first tick

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(raw) => queue.receive_event(&raw),
                            Err(e) => debug!(error = %e, "ignoring non-JSON feed frame"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await
                            .map_err(|e| FeedError::WebSocket(e.to_string()))?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Err(FeedError::StreamEnded);
                    }
                    Some(Err(e)) => {
                        return Err(FeedError::WebSocket(e.to_string()));
                    }
                    None => {
                        return Err(FeedError::StreamEnded);
                    }
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                let heartbeat_msg = serde_json::json!({ "type": "heartbeat" });
                write.send(Message::Text(heartbeat_msg.to_string())).await
                    .map_err(|e| FeedError::WebSocket(e.to_string()))?;
            }
            _ = shutdown.recv() => {
                info!("feed session: shutdown signal received");
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}
