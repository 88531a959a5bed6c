//! Authenticated websocket session against the user-data stream.
//!
//! Owns the listen key and the socket task. `teardown` followed by `connect`
//! is the reconnect path; both are safe to call repeatedly.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::Config;
use crate::error::ConnectError;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::order::RawFrame;
use crate::queue::FrameProducer;
use crate::rest::RestClient;
use crate::supervisor::Transport;

/// One live socket: its listen key, a close signal, and the reader task.
struct LiveSession {
    listen_key: String,
    close_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct TransportSession {
    rest: RestClient,
    ws_base: String,
    producer: FrameProducer,
    live: Mutex<Option<LiveSession>>,
}

impl TransportSession {
    pub fn new(cfg: &Config, rest: RestClient, producer: FrameProducer) -> Self {
        Self {
            rest,
            ws_base: cfg.ws_base.clone(),
            producer,
            live: Mutex::new(None),
        }
    }

    /// Obtain a listen key and open the socket. Replaces any previous session.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let listen_key = self.rest.create_listen_key().await?;
        let url = format!("{}/ws/{}", self.ws_base, listen_key);

        let (stream, _resp) = connect_async(url)
            .await
            .map_err(|e| ConnectError::Transient(format!("websocket connect: {e}")))?;
        let (mut write, mut read) = stream.split();

        let (close_tx, mut close_rx) = watch::channel(false);
        let producer = self.producer.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close_rx.changed() => {
                        if *close_rx.borrow() {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<Map<String, Value>>(&text) {
                                Ok(payload) => producer.push(RawFrame::new(payload)),
                                Err(e) => log(
                                    Level::Warn,
                                    Domain::Stream,
                                    "frame_parse_failed",
                                    obj(&[("error", v_str(&e.to_string()))]),
                                ),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            producer.push(error_frame("socket closed by peer"));
                            break;
                        }
                        Some(Err(e)) => {
                            producer.push(error_frame(&format!("socket read: {e}")));
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        });

        let mut live = self.live.lock().await;
        if let Some(old) = live.replace(LiveSession { listen_key: listen_key.clone(), close_tx, task }) {
            // A connect over a live session should not leak the old reader.
            let _ = old.close_tx.send(true);
            old.task.abort();
        }
        drop(live);

        log(
            Level::Info,
            Domain::Session,
            "connected",
            obj(&[("key_len", v_num(listen_key.len() as f64))]),
        );
        Ok(())
    }

    async fn close_current(&self) {
        let taken = self.live.lock().await.take();
        let Some(session) = taken else { return };
        let _ = session.close_tx.send(true);
        let mut task = session.task;
        if tokio::time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
            // Reader did not drain in time; the socket is dead anyway.
            task.abort();
        }
        if let Err(e) = self.rest.close_listen_key(&session.listen_key).await {
            log(
                Level::Debug,
                Domain::Session,
                "close_listen_key_failed",
                obj(&[("error", v_str(&e.to_string()))]),
            );
        }
        log(Level::Info, Domain::Session, "disconnected", obj(&[]));
    }
}

fn error_frame(message: &str) -> RawFrame {
    let mut payload = Map::new();
    payload.insert("error".to_string(), Value::String(message.to_string()));
    RawFrame::new(payload)
}

#[async_trait]
impl Transport for TransportSession {
    async fn reconnect(&self) -> Result<(), ConnectError> {
        self.connect().await
    }

    async fn teardown(&self) {
        self.close_current().await;
    }

    /// Renew the listen key server side. No-op when disconnected.
    async fn keepalive(&self) -> Result<()> {
        let key = {
            let live = self.live.lock().await;
            match live.as_ref() {
                Some(s) => s.listen_key.clone(),
                None => return Ok(()),
            }
        };
        self.rest.keepalive_listen_key(&key).await?;
        log(Level::Debug, Domain::Session, "keepalive_sent", obj(&[]));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StreamMetrics;
    use crate::queue::frame_queue;
    use std::sync::Arc;

    #[test]
    fn test_error_frame_carries_message() {
        let frame = error_frame("socket read: reset");
        assert_eq!(
            frame.payload.get("error").and_then(|v| v.as_str()),
            Some("socket read: reset")
        );
    }

    #[tokio::test]
    async fn test_teardown_and_keepalive_without_connect_are_noops() {
        let cfg = Config::from_env();
        let rest = RestClient::new("http://127.0.0.1:1".into(), "k".into(), "s".into());
        let (producer, _consumer) = frame_queue(
            4,
            Duration::from_millis(20),
            Arc::new(StreamMetrics::new()),
        );
        let session = TransportSession::new(&cfg, rest, producer);

        // No live session: both are no-ops, repeatedly.
        session.teardown().await;
        session.teardown().await;
        assert!(session.keepalive().await.is_ok());
    }
}
