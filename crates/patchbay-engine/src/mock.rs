use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use patchbay_core::{CommandError, EmitError, EngineInitError, Message};

use crate::devices::DeviceServices;
use crate::engine::{Engine, EngineFactory, EventSender};

type SenderSlot = Arc<Mutex<Option<EventSender>>>;

/// Shared view into every engine a `MockEngineFactory` has built.
#[derive(Clone, Default)]
pub struct MockProbe {
    inner: Arc<ProbeState>,
}

#[derive(Default)]
struct ProbeState {
    handled: Mutex<Vec<Message>>,
    shutdowns: AtomicUsize,
    created: AtomicUsize,
    senders: Mutex<Vec<SenderSlot>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands handled so far, across all engines, in call order.
    pub fn handled(&self) -> Vec<Message> {
        self.inner.handled.lock().clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.inner.shutdowns.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Push an unsolicited event from the most recently created engine.
    pub async fn emit(&self, event: Message) -> Result<(), EmitError> {
        let sender = self
            .inner
            .senders
            .lock()
            .last()
            .and_then(|slot| slot.lock().clone());
        match sender {
            Some(sender) => sender.emit(event).await,
            None => Err(EmitError::Closed),
        }
    }

    /// Make every engine drop its event sender, as if it had stopped itself.
    pub fn hang_up(&self) {
        for slot in self.inner.senders.lock().iter() {
            slot.lock().take();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Behavior {
    /// Emit every accepted command back as an event.
    Echo,
    /// Accept commands without emitting anything.
    Silent,
}

/// Deterministic engine factory for tests.
pub struct MockEngineFactory {
    probe: MockProbe,
    behavior: Behavior,
    reject: Option<String>,
    fail: Option<String>,
}

impl MockEngineFactory {
    pub fn echo(probe: MockProbe) -> Self {
        Self {
            probe,
            behavior: Behavior::Echo,
            reject: None,
            fail: None,
        }
    }

    pub fn silent(probe: MockProbe) -> Self {
        Self {
            behavior: Behavior::Silent,
            ..Self::echo(probe)
        }
    }

    /// Factory whose `create` always fails with `reason`.
    pub fn failing(reason: &str) -> Self {
        Self {
            fail: Some(reason.to_string()),
            ..Self::echo(MockProbe::new())
        }
    }

    /// Reject commands whose `"type"` is `kind`.
    pub fn rejecting(mut self, kind: &str) -> Self {
        self.reject = Some(kind.to_string());
        self
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(
        &self,
        _services: &DeviceServices,
        events: EventSender,
    ) -> Result<Box<dyn Engine>, EngineInitError> {
        if let Some(reason) = &self.fail {
            return Err(EngineInitError::new(reason.clone()));
        }
        let slot: SenderSlot = Arc::new(Mutex::new(Some(events)));
        self.probe.inner.senders.lock().push(Arc::clone(&slot));
        let _ = self.probe.inner.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEngine {
            probe: self.probe.clone(),
            sender: slot,
            behavior: self.behavior,
            reject: self.reject.clone(),
        }))
    }
}

struct MockEngine {
    probe: MockProbe,
    sender: SenderSlot,
    behavior: Behavior,
    reject: Option<String>,
}

#[async_trait]
impl Engine for MockEngine {
    async fn handle(&self, command: Message) -> Result<(), CommandError> {
        self.probe.inner.handled.lock().push(command.clone());

        let kind = command.message_type().ok_or(CommandError::MissingType)?;
        if self.reject.as_deref() == Some(kind) {
            return Err(CommandError::Rejected(kind.to_string()));
        }
        if self.behavior == Behavior::Silent {
            return Ok(());
        }

        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => sender
                .emit(command)
                .await
                .map_err(|e| CommandError::Rejected(e.to_string())),
            None => Err(CommandError::Rejected("engine stopped".into())),
        }
    }

    fn shutdown(&self) {
        self.sender.lock().take();
        let _ = self.probe.inner.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
