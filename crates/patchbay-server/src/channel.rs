//! Structured-message channel over an upgraded connection.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use patchbay_core::{Message, ReceiveError, TransportError};
use tokio::sync::Mutex;

/// Bidirectional stream of `Message`s.
///
/// `send` may be called from several tasks; each message is written whole.
/// `receive` is meant for a single reader.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), TransportError>;

    /// Wait for the next message. Orderly closure by the peer is
    /// `ReceiveError::EndOfStream`, never a transport error.
    async fn receive(&self) -> Result<Message, ReceiveError>;

    /// Close the channel. Idempotent; later sends fail with `TransportError::Closed`.
    async fn close(&self);
}

/// `MessageChannel` over an axum WebSocket, one JSON object per frame.
pub struct WsChannel {
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
    stream: Mutex<SplitStream<WebSocket>>,
    closed: AtomicBool,
}

impl WsChannel {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MessageChannel for WsChannel {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let json = message.to_json()?;
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(json.into()))
            .await
            .map_err(|e| classify_ws_error(&e))
    }

    async fn receive(&self) -> Result<Message, ReceiveError> {
        let mut stream = self.stream.lock().await;
        loop {
            let frame = match stream.next().await {
                None => return Err(ReceiveError::EndOfStream),
                Some(Err(e)) => {
                    return Err(match classify_ws_error(&e) {
                        TransportError::Closed => ReceiveError::EndOfStream,
                        other => ReceiveError::Transport(other),
                    })
                }
                Some(Ok(frame)) => frame,
            };
            match frame {
                WsMessage::Text(text) => return Ok(Message::from_json(text.as_str())?),
                WsMessage::Binary(data) => {
                    let text = std::str::from_utf8(&data).map_err(|e| {
                        TransportError::Malformed(format!("binary frame is not UTF-8: {e}"))
                    })?;
                    return Ok(Message::from_json(text)?);
                }
                WsMessage::Close(_) => return Err(ReceiveError::EndOfStream),
                // axum answers pings itself
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut sink = self.sink.lock().await;
        let _ = sink.send(WsMessage::Close(None)).await;
        let _ = sink.close().await;
    }
}

/// Map a WebSocket error to the transport taxonomy. A connection the peer
/// already closed cleanly is `Closed`; everything else is an I/O fault.
///
/// axum boxes the tungstenite error without re-exporting its type, so the
/// variant is recognised by its display text:
/// - `tungstenite::Error::ConnectionClosed` → "Connection closed normally"
/// - `tungstenite::Error::AlreadyClosed` → "Trying to work with closed connection"
///
/// The tests below pin both strings.
fn classify_ws_error(err: &axum::Error) -> TransportError {
    let text = error_chain(err);
    let lower = text.to_ascii_lowercase();
    if lower.contains("closed normally") || lower.contains("closed connection") {
        TransportError::Closed
    } else {
        TransportError::Io(text)
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}
