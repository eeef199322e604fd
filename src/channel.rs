//! Signaling channel
//!
//! Owns the one persistent WebSocket connection to the signaling server.
//! Decoded messages and lifecycle events are delivered, in wire order, on a
//! single event stream; sends fail fast when the connection is not open.
//! There is no automatic reconnect: a dropped connection surfaces `Closed`
//! and the controller decides what happens next.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::codec::{SignalingCodec, SignalingMessage};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// Connected; sends are accepted
    Open,
    /// Local disconnect in progress
    Closing,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "Disconnected"),
            ChannelState::Connecting => write!(f, "Connecting"),
            ChannelState::Open => write!(f, "Open"),
            ChannelState::Closing => write!(f, "Closing"),
        }
    }
}

/// Events produced by the channel, in the order they happened on the wire
#[derive(Debug)]
pub enum ChannelEvent {
    /// Connection established
    Opened,
    /// One decoded signaling message
    Message(SignalingMessage),
    /// Connect attempt failed or was aborted before the connection opened
    Failed { reason: String },
    /// Connection closed; fired exactly once per connection lifetime
    Closed { reason: String },
}

/// Errors from `connect`
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("signaling server unreachable: {0}")]
    Unreachable(String),

    #[error("timed out connecting to signaling server after {0:?}")]
    Timeout(Duration),

    #[error("connect attempt aborted by disconnect")]
    Aborted,
}

/// Errors from `send`
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SendError {
    #[error("signaling channel is not open")]
    NotOpen,

    #[error("signaling send queue is full")]
    QueueFull,
}

/// Per-connection handles shared with the reader/writer tasks
struct Conn {
    writer_tx: mpsc::Sender<String>,
    token: CancellationToken,
    closed_emitted: Arc<AtomicBool>,
}

/// What the channel currently holds: nothing, a connect attempt that
/// `disconnect` can abort, or a live connection.
enum Link {
    Idle,
    Attempt(CancellationToken),
    Up(Conn),
}

/// One persistent duplex connection to the signaling server.
///
/// `send` is synchronous and non-blocking so the capture loop can call it
/// from a blocking thread; outbound messages go through a bounded writer
/// queue that decouples microphone reads from network latency.
///
/// Lock order is `link` before `state` everywhere; the reader task only
/// touches `state`, and only if it wins its connection's closed flag, so a
/// stale reader can never clobber a newer connection.
pub struct SignalingChannel {
    send_queue: usize,
    state: Arc<Mutex<ChannelState>>,
    link: Arc<Mutex<Link>>,
    event_tx: mpsc::Sender<ChannelEvent>,
}

impl SignalingChannel {
    /// Create a channel and the receiver for its event stream.
    ///
    /// `send_queue` bounds the writer queue between callers of `send` and
    /// the socket.
    pub fn new(send_queue: usize) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        (
            Self {
                send_queue,
                state: Arc::new(Mutex::new(ChannelState::Disconnected)),
                link: Arc::new(Mutex::new(Link::Idle)),
                event_tx,
            },
            event_rx,
        )
    }

    /// Current connection state
    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// Open the connection to `ws://host:port`.
    ///
    /// Only one attempt may be in flight; calling while `Connecting` or
    /// `Open` is a no-op that returns the current state. Emits `Opened` on
    /// success and `Failed` on failure. A `disconnect` racing this call
    /// aborts the attempt: the handshake result is discarded and the
    /// channel stays down.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<ChannelState, ConnectError> {
        let attempt = CancellationToken::new();
        {
            let mut link = self.link.lock();
            let mut state = self.state.lock();
            match *state {
                ChannelState::Connecting | ChannelState::Open => return Ok(*state),
                _ => {}
            }
            *state = ChannelState::Connecting;
            *link = Link::Attempt(attempt.clone());
        }

        let url = format!("ws://{}:{}", host, port);
        tracing::info!("connecting to signaling server {}", url);

        let handshake = tokio::time::timeout(timeout, connect_async(&url));
        let ws = tokio::select! {
            _ = attempt.cancelled() => {
                // disconnect() already reset link and state
                let _ = self
                    .event_tx
                    .send(ChannelEvent::Failed {
                        reason: "aborted by disconnect".to_string(),
                    })
                    .await;
                return Err(ConnectError::Aborted);
            }
            result = handshake => match result {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => {
                    self.abandon_attempt(&attempt);
                    let reason = e.to_string();
                    tracing::warn!("signaling connect failed: {}", reason);
                    let _ = self
                        .event_tx
                        .send(ChannelEvent::Failed {
                            reason: reason.clone(),
                        })
                        .await;
                    return Err(ConnectError::Unreachable(reason));
                }
                Err(_) => {
                    self.abandon_attempt(&attempt);
                    let _ = self
                        .event_tx
                        .send(ChannelEvent::Failed {
                            reason: format!("connect timed out after {:?}", timeout),
                        })
                        .await;
                    return Err(ConnectError::Timeout(timeout));
                }
            }
        };

        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(self.send_queue);
        let token = CancellationToken::new();
        let closed_emitted = Arc::new(AtomicBool::new(false));

        // Register the connection, unless a racing disconnect cancelled the
        // attempt after the handshake already completed.
        let registered = {
            let mut link = self.link.lock();
            let still_ours = matches!(&*link, Link::Attempt(t) if !t.is_cancelled());
            if still_ours {
                *link = Link::Up(Conn {
                    writer_tx,
                    token: token.clone(),
                    closed_emitted: Arc::clone(&closed_emitted),
                });
                *self.state.lock() = ChannelState::Open;
            }
            still_ours
        };
        if !registered {
            let mut ws = ws;
            let _ = ws.close(None).await;
            let _ = self
                .event_tx
                .send(ChannelEvent::Failed {
                    reason: "aborted by disconnect".to_string(),
                })
                .await;
            return Err(ConnectError::Aborted);
        }

        let (mut sink, mut stream) = ws.split();

        // Writer task: drains the bounded send queue onto the socket and
        // performs the closing handshake on every exit path.
        let writer_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_token.cancelled() => break,
                    msg = writer_rx.recv() => match msg {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                tracing::error!("signaling send failed: {}", e);
                                writer_token.cancel();
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            // Clean close so the peer sees a WebSocket shutdown, not a
            // dead TCP stream
            let _ = sink.close().await;
        });

        // Reader task: decodes inbound frames in order; malformed frames are
        // logged and dropped, never surfaced as stream errors.
        let reader_token = token.clone();
        let reader_state = Arc::clone(&self.state);
        let reader_link = Arc::clone(&self.link);
        let reader_closed = Arc::clone(&closed_emitted);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = reader_token.cancelled() => break "closed locally".to_string(),
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => match SignalingCodec::decode(&text) {
                            Ok(message) => {
                                if event_tx.send(ChannelEvent::Message(message)).await.is_err() {
                                    break "event receiver dropped".to_string();
                                }
                            }
                            Err(e) => {
                                tracing::warn!("dropping malformed signaling frame: {}", e);
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            break frame
                                .map(|f| f.reason.to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "closed by peer".to_string());
                        }
                        // Control frames carry no signaling payload
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break format!("transport error: {}", e),
                        None => break "connection lost".to_string(),
                    }
                }
            };

            reader_token.cancel();
            // Only the end that wins the closed flag reports the closure, and
            // the state write happens under the link lock so a reader outlived
            // by a disconnect can never clobber a successor connection.
            let won = {
                let mut link = reader_link.lock();
                if matches!(&*link, Link::Up(c) if Arc::ptr_eq(&c.closed_emitted, &reader_closed))
                {
                    *link = Link::Idle;
                }
                if !reader_closed.swap(true, Ordering::SeqCst) {
                    *reader_state.lock() = ChannelState::Disconnected;
                    true
                } else {
                    false
                }
            };
            if won {
                tracing::info!("signaling connection closed: {}", reason);
                let _ = event_tx.send(ChannelEvent::Closed { reason }).await;
            }
        });

        let _ = self.event_tx.send(ChannelEvent::Opened).await;

        Ok(ChannelState::Open)
    }

    /// Reset after a failed handshake, unless a racing disconnect already
    /// cleaned up (in which case the link may belong to a newer attempt).
    fn abandon_attempt(&self, attempt: &CancellationToken) {
        let mut link = self.link.lock();
        if !attempt.is_cancelled() {
            *link = Link::Idle;
            *self.state.lock() = ChannelState::Disconnected;
        }
    }

    /// Queue a message for sending. Fails fast when the connection is not
    /// open or the writer queue is full; never blocks or retries.
    pub fn send(&self, message: &SignalingMessage) -> Result<(), SendError> {
        let link = self.link.lock();
        if *self.state.lock() != ChannelState::Open {
            return Err(SendError::NotOpen);
        }
        let Link::Up(conn) = &*link else {
            return Err(SendError::NotOpen);
        };

        conn.writer_tx
            .try_send(SignalingCodec::encode(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SendError::NotOpen,
            })
    }

    /// Close the connection. Idempotent and safe in any state, including
    /// while a connect attempt is in flight (the attempt is aborted).
    /// `Closed` is emitted (once per connection) before this returns.
    pub async fn disconnect(&self) {
        let emit_closed = {
            let mut link = self.link.lock();
            let prior = std::mem::replace(&mut *link, Link::Idle);
            let mut state = self.state.lock();
            match prior {
                Link::Idle => {
                    *state = ChannelState::Disconnected;
                    false
                }
                Link::Attempt(attempt) => {
                    attempt.cancel();
                    *state = ChannelState::Disconnected;
                    false
                }
                Link::Up(conn) => {
                    *state = ChannelState::Closing;
                    conn.token.cancel();
                    let won = !conn.closed_emitted.swap(true, Ordering::SeqCst);
                    *state = ChannelState::Disconnected;
                    won
                }
            }
        };

        if emit_closed {
            let _ = self
                .event_tx
                .send(ChannelEvent::Closed {
                    reason: "closed locally".to_string(),
                })
                .await;
        }
    }
}
