//! In-process `MessageChannel` for driving a relay without a socket.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use patchbay_core::{Message, ReceiveError, TransportError};
use tokio::sync::{mpsc, Mutex};

use crate::channel::MessageChannel;

/// What the fake peer puts on the wire.
#[derive(Debug)]
enum Frame {
    Message(Message),
    Raw(String),
    Fault(String),
}

#[derive(Default)]
struct Shared {
    closed: AtomicBool,
    fail_sends: AtomicBool,
    close_calls: AtomicUsize,
}

/// Relay-side end of an in-memory channel.
pub struct MemoryChannel {
    inbound: Mutex<mpsc::UnboundedReceiver<Frame>>,
    outbound: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
}

/// Test-side end: plays the browser.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Frame>>,
    outbound: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
}

/// Create a connected channel/peer pair.
pub fn pair() -> (MemoryChannel, MemoryPeer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());
    (
        MemoryChannel {
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
            shared: Arc::clone(&shared),
        },
        MemoryPeer {
            inbound: Some(in_tx),
            outbound: out_rx,
            shared,
        },
    )
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.shared.fail_sends.load(Ordering::Acquire) {
            return Err(TransportError::Io("broken pipe".into()));
        }
        let json = message.to_json()?;
        let copy = Message::from_json(&json)?;
        self.outbound
            .send(copy)
            .map_err(|_| TransportError::Io("peer went away".into()))
    }

    async fn receive(&self) -> Result<Message, ReceiveError> {
        let frame = self.inbound.lock().await.recv().await;
        match frame {
            None => Err(ReceiveError::EndOfStream),
            Some(Frame::Message(message)) => Ok(message),
            Some(Frame::Raw(text)) => Ok(Message::from_json(&text)?),
            Some(Frame::Fault(reason)) => Err(TransportError::Io(reason).into()),
        }
    }

    async fn close(&self) {
        let _ = self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.closed.store(true, Ordering::Release);
    }
}

impl MemoryPeer {
    /// Send a command to the relay.
    pub fn send(&self, message: Message) {
        self.push(Frame::Message(message));
    }

    /// Send raw text, which the channel parses like a wire frame.
    pub fn send_raw(&self, text: &str) {
        self.push(Frame::Raw(text.to_string()));
    }

    /// Make the relay's next `receive` fail with a transport fault.
    pub fn fault(&self, reason: &str) {
        self.push(Frame::Fault(reason.to_string()));
    }

    /// Orderly close from the peer side.
    pub fn close(&mut self) {
        self.inbound.take();
    }

    /// Make every later relay `send` fail.
    pub fn fail_sends(&self) {
        self.shared.fail_sends.store(true, Ordering::Release);
    }

    /// Next message the relay sent, waiting for it.
    pub async fn recv(&mut self) -> Option<Message> {
        self.outbound.recv().await
    }

    /// Next message the relay sent, if one is already there.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.outbound.try_recv().ok()
    }

    /// Whether the relay side has closed the channel.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn close_calls(&self) -> usize {
        self.shared.close_calls.load(Ordering::SeqCst)
    }

    fn push(&self, frame: Frame) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_flow_both_ways() {
        let (channel, mut peer) = pair();
        peer.send(Message::typed("hello"));
        let got = channel.receive().await.unwrap();
        assert_eq!(got.message_type(), Some("hello"));

        channel.send(&Message::typed("world")).await.unwrap();
        assert_eq!(peer.recv().await.unwrap().message_type(), Some("world"));
    }

    #[tokio::test]
    async fn peer_close_is_end_of_stream() {
        let (channel, mut peer) = pair();
        peer.close();
        assert!(matches!(channel.receive().await, Err(ReceiveError::EndOfStream)));
    }

    #[tokio::test]
    async fn raw_garbage_is_malformed() {
        let (channel, peer) = pair();
        peer.send_raw("{oops");
        assert!(matches!(
            channel.receive().await,
            Err(ReceiveError::Transport(TransportError::Malformed(_)))
        ));
    }

    #[tokio::test]
    async fn fault_is_transport_error() {
        let (channel, peer) = pair();
        peer.fault("connection reset");
        assert!(matches!(
            channel.receive().await,
            Err(ReceiveError::Transport(TransportError::Io(_)))
        ));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (channel, peer) = pair();
        channel.close().await;
        channel.close().await;
        assert!(peer.is_closed());
        assert_eq!(peer.close_calls(), 2);
        assert!(matches!(
            channel.send(&Message::typed("late")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn failing_sends() {
        let (channel, peer) = pair();
        peer.fail_sends();
        assert!(matches!(
            channel.send(&Message::typed("x")).await,
            Err(TransportError::Io(_))
        ));
    }
}
