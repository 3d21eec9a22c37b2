//! Shared fixtures: a scriptable live-channel server and event helpers.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use live_transcribe::{ClientConfig, EventReceiver, SessionEvent};

/// What the channel server observed from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Connected,
    Text(String),
    Binary(Vec<u8>),
    Closed,
}

/// Live-channel server on 127.0.0.1 that records client traffic and sends
/// whatever the test pushes.
pub struct ChannelServer {
    pub url: String,
    pub seen: mpsc::UnboundedReceiver<Seen>,
    push: mpsc::UnboundedSender<String>,
}

impl ChannelServer {
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    /// Like `start`, but the server closes the first connection once it has
    /// received `frames` binary frames. Later connections stay open.
    pub async fn closing_after(frames: usize) -> Self {
        Self::start_with(Some(frames)).await
    }

    async fn start_with(mut close_after: Option<usize>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/join", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let _ = seen_tx.send(Seen::Connected);
                let (mut sink, mut source) = ws.split();
                let limit = close_after.take();
                let mut frames = 0;

                loop {
                    tokio::select! {
                        frame = source.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                let _ = seen_tx.send(Seen::Text(text));
                            }
                            Some(Ok(Message::Binary(data))) => {
                                let _ = seen_tx.send(Seen::Binary(data));
                                frames += 1;
                                if limit == Some(frames) {
                                    let _ = sink.close().await;
                                    let _ = seen_tx.send(Seen::Closed);
                                    break;
                                }
                            }
                            Some(Ok(_)) => {}
                            _ => {
                                let _ = seen_tx.send(Seen::Closed);
                                break;
                            }
                        },
                        outgoing = push_rx.recv() => match outgoing {
                            Some(text) => {
                                let _ = sink.send(Message::Text(text)).await;
                            }
                            None => return,
                        },
                    }
                }
            }
        });

        Self {
            url,
            seen: seen_rx,
            push: push_tx,
        }
    }

    /// Send a server envelope to the connected client.
    pub fn push(&self, name: &str, payload: serde_json::Value) {
        let envelope = serde_json::json!({
            "header": { "name": name, "namespace": "SpeechTranscriber", "status": 20000000 },
            "payload": payload,
        });
        self.push.send(envelope.to_string()).unwrap();
    }

    pub fn push_raw(&self, text: &str) {
        self.push.send(text.to_string()).unwrap();
    }

    pub async fn next_seen(&mut self) -> Seen {
        tokio::time::timeout(Duration::from_secs(5), self.seen.recv())
            .await
            .expect("timed out waiting for channel traffic")
            .expect("channel server stopped")
    }

    /// Collect binary frames until `total` bytes have arrived.
    pub async fn binary_until(&mut self, total: usize) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut received = 0;
        while received < total {
            if let Seen::Binary(data) = self.next_seen().await {
                received += data.len();
                frames.push(data);
            }
        }
        frames
    }
}

/// A TCP listener that accepts connections and drops them before the
/// handshake completes. Counts attempts.
pub async fn refusing_channel() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/join", listener.local_addr().unwrap());
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    (url, attempts)
}

/// A live-channel server that completes the handshake, waits for the start
/// command and then closes. Counts opened channels.
pub async fn flaky_channel() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/join", listener.local_addr().unwrap());
    let opened = Arc::new(AtomicUsize::new(0));

    let counter = opened.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_text() {
                    break;
                }
            }
            let _ = ws.close(None).await;
        }
    });

    (url, opened)
}

pub fn fast_config(base_url: String) -> ClientConfig {
    ClientConfig {
        base_url,
        reconnect_base_delay_ms: 20,
        stop_grace_ms: 100,
        poll_interval_ms: 50,
        health_timeout_ms: 500,
        connect_timeout_ms: 3000,
        request_timeout_ms: 3000,
        ..Default::default()
    }
}

/// Wait for the first event matching `pred`, skipping the rest.
pub async fn wait_for_event<F>(events: &mut EventReceiver, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Drain everything currently buffered.
pub fn drain(events: &mut EventReceiver) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
