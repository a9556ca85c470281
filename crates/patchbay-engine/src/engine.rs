use async_trait::async_trait;
use patchbay_core::{CommandError, EmitError, EngineInitError, Message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::devices::DeviceServices;

/// One engine instance, driven by a single session.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Apply one inbound command. Events it causes go out through the
    /// `EventSender` the engine was built with.
    async fn handle(&self, command: Message) -> Result<(), CommandError>;

    /// Release everything the engine holds. Called exactly once by the
    /// owning session.
    fn shutdown(&self);
}

/// Builds engines for new sessions.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        services: &DeviceServices,
        events: EventSender,
    ) -> Result<Box<dyn Engine>, EngineInitError>;
}

/// Engine-side handle on a session's outbound event queue.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl EventSender {
    pub(crate) fn new(tx: mpsc::Sender<Message>, closed: CancellationToken) -> Self {
        Self { tx, closed }
    }

    /// Queue one event. Waits while the queue is full; fails once the
    /// session has closed, including while waiting.
    pub async fn emit(&self, event: Message) -> Result<(), EmitError> {
        if self.closed.is_cancelled() {
            return Err(EmitError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(EmitError::Closed),
            sent = self.tx.send(event) => sent.map_err(|_| EmitError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}
