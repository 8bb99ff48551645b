//! WebSocket subscription with automatic reconnect.
//!
//! The connection lifecycle is an explicit state machine
//! (DISCONNECTED -> CONNECTING -> OPEN -> DISCONNECTED) driven by one
//! consumer task. Reconnects back off exponentially up to a cap; a stop
//! signal is honored at every await point, including mid-backoff.

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::exchange::{to_exchange_symbol, to_stream_symbol, wire, StreamKind};
use crate::models::StreamEvent;
use crate::resilience::{ErrorTracker, RetryPolicy};

/// Buffered events between the consumer task and the streaming collector.
const EVENT_CHANNEL_CAPACITY: usize = 1024;
/// Reconnect backoff cap.
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

/// Handle over a live subscription. The event receiver is returned
/// alongside by [`subscribe_streams`] so the consumer and the controller can
/// live on different tasks.
pub struct StreamHandle {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// Signals the consumer to shut down and waits for it to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch endpoint for health checks.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

/// Opens a multiplexed subscription for `symbols` x `kinds`. Returns the
/// control handle and the channel of typed events.
pub fn subscribe_streams(
    ws_url: &str,
    symbols: &[String],
    kinds: &[StreamKind],
    tracker: Arc<ErrorTracker>,
) -> (StreamHandle, mpsc::Receiver<StreamEvent>) {
    let mut names = Vec::with_capacity(symbols.len() * kinds.len());
    let mut canonical_by_exchange = HashMap::new();
    for symbol in symbols {
        canonical_by_exchange.insert(to_exchange_symbol(symbol), symbol.clone());
        for kind in kinds {
            names.push(format!("{}@{}", to_stream_symbol(symbol), kind.suffix()));
        }
    }
    let url = format!("{}/stream?streams={}", ws_url, names.join("/"));

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (stop_tx, stop_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

    let task = tokio::spawn(run_consumer(
        url,
        canonical_by_exchange,
        event_tx,
        stop_rx,
        state_tx,
        tracker,
    ));

    (
        StreamHandle {
            stop_tx,
            state_rx,
            task,
        },
        event_rx,
    )
}

async fn run_consumer(
    url: String,
    canonical_by_exchange: HashMap<String, String>,
    event_tx: mpsc::Sender<StreamEvent>,
    mut stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<ConnectionState>,
    tracker: Arc<ErrorTracker>,
) {
    let backoff = RetryPolicy {
        max_retries: u32::MAX,
        initial_delay: Duration::from_secs(1),
        max_delay: RECONNECT_MAX_DELAY,
        base: 2.0,
        jitter: true,
    };
    let mut reconnect_attempt: u32 = 0;

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let _ = state_tx.send(ConnectionState::Connecting);
        info!(%url, attempt = reconnect_attempt, "connecting stream socket");

        match connect_async(url.as_str()).await {
            Ok((socket, _response)) => {
                let _ = state_tx.send(ConnectionState::Open);
                reconnect_attempt = 0;
                let (mut write, mut read) = socket.split();

                loop {
                    tokio::select! {
                        changed = stop_rx.changed() => {
                            if changed.is_err() || *stop_rx.borrow() {
                                let _ = write.send(Message::Close(None)).await;
                                let _ = state_tx.send(ConnectionState::Disconnected);
                                return;
                            }
                        }
                        message = read.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                match wire::parse_stream_envelope(&text, &canonical_by_exchange) {
                                    Ok(Some(event)) => {
                                        if event_tx.send(event).await.is_err() {
                                            // Receiver gone: the collector stopped.
                                            let _ = state_tx.send(ConnectionState::Disconnected);
                                            return;
                                        }
                                    }
                                    Ok(None) => {}
                                    Err(err) => tracker.record_error(&err, "ws_message"),
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(frame))) => {
                                debug!(?frame, "stream closed by peer");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                tracker.record_error(
                                    &IngestError::Network(err.to_string()),
                                    "ws_read",
                                );
                                break;
                            }
                            None => break,
                        }
                    }
                }
                let _ = state_tx.send(ConnectionState::Disconnected);
            }
            Err(err) => {
                tracker.record_error(&IngestError::Network(err.to_string()), "ws_connect");
                let _ = state_tx.send(ConnectionState::Disconnected);
            }
        }

        // Bounded exponential backoff before the next attempt, interruptible
        // by the stop signal.
        let delay = backoff.delay_for(reconnect_attempt.min(6));
        reconnect_attempt = reconnect_attempt.saturating_add(1);
        warn!(delay_ms = delay.as_millis() as u64, "stream disconnected, backing off");
        tokio::select! {
            _ = sleep(delay) => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
    let _ = state_tx.send(ConnectionState::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_terminates_consumer_mid_backoff() {
        // Nothing listens on this port; the consumer stays in its
        // connect/backoff loop until stopped.
        let (handle, _events) = subscribe_streams(
            "ws://127.0.0.1:9",
            &["SOL/USDT".to_string()],
            &[StreamKind::MarkPrice],
            Arc::new(ErrorTracker::new()),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("stop should resolve promptly");
    }

    #[tokio::test]
    async fn test_initial_state_is_not_open() {
        let (handle, _events) = subscribe_streams(
            "ws://127.0.0.1:9",
            &["SOL/USDT".to_string()],
            &[StreamKind::ForceOrder],
            Arc::new(ErrorTracker::new()),
        );
        assert_ne!(handle.state(), ConnectionState::Open);
        handle.stop().await;
    }
}
