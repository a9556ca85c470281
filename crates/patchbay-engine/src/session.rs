use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use patchbay_core::{EngineInitError, Message, SessionError, SessionId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::devices::DeviceServices;
use crate::engine::{Engine, EngineFactory, EventSender};

/// Per-session settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Capacity of the outbound event queue. A full queue makes the engine
    /// wait until the client catches up.
    pub event_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { event_queue: 256 }
    }
}

/// Outbound events of one session, in the order the engine produced them.
#[derive(Debug)]
pub struct Events {
    rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
}

impl Events {
    /// Next event, or `None` once the session is closed or the engine has
    /// dropped its sender.
    pub async fn next(&mut self) -> Option<Message> {
        if self.closed.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    /// Next event if one is already queued.
    pub fn try_next(&mut self) -> Option<Message> {
        if self.closed.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

/// The engine state and resources dedicated to one client connection.
pub struct Session {
    id: SessionId,
    engine: Box<dyn Engine>,
    events: Mutex<Option<Events>>,
    closed: CancellationToken,
    released: AtomicBool,
}

impl Session {
    /// Build the event queue and an engine bound to it.
    pub fn create(
        factory: &dyn EngineFactory,
        services: &DeviceServices,
        config: &SessionConfig,
    ) -> Result<Self, EngineInitError> {
        let id = SessionId::new();
        let closed = CancellationToken::new();
        let (tx, rx) = mpsc::channel(config.event_queue.max(1));

        let engine = factory.create(services, EventSender::new(tx, closed.clone()))?;
        tracing::debug!(session_id = %id, "session created");

        Ok(Self {
            id,
            engine,
            events: Mutex::new(Some(Events {
                rx,
                closed: closed.clone(),
            })),
            closed,
            released: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Take the outbound event sequence. Only the first caller gets it.
    pub fn events(&self) -> Option<Events> {
        self.events.lock().take()
    }

    /// Submit one inbound command to the engine.
    pub async fn handle(&self, command: Message) -> Result<(), SessionError> {
        if self.closed.is_cancelled() {
            return Err(SessionError::Closed);
        }
        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(SessionError::Closed),
            result = self.engine.handle(command) => result,
        };
        match result {
            Ok(()) => Ok(()),
            // An engine that failed because it could not emit has lost its session.
            Err(_) if self.closed.is_cancelled() => Err(SessionError::Closed),
            Err(e) => Err(SessionError::Command(e)),
        }
    }

    /// Release the engine. Idempotent; returns whether this call did the release.
    pub fn close(&self) -> bool {
        self.closed.cancel();
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.engine.shutdown();
        tracing::debug!(session_id = %self.id, "session closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
