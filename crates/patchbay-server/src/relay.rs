//! Relay between one engine session and one message channel.
//!
//! Two pumps run as separate tasks:
//! - outbound: session events → `MessageChannel::send`
//! - inbound: `MessageChannel::receive` → `Session::handle`
//!
//! The first pump to stop ends the relay. The other pump is aborted and
//! joined, then the session is closed (exactly once) and the channel after it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use parking_lot::Mutex;
use patchbay_core::{
    ConnectionId, ReceiveError, RelayError, SessionError, SessionId, TransportError,
};
use patchbay_engine::{Events, Session};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::MessageChannel;

/// Lifecycle of one relay. Only moves forward, one step at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    Created,
    Active,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid relay transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: RelayState,
    pub to: RelayState,
}

impl RelayState {
    pub fn advance(self, to: RelayState) -> Result<RelayState, InvalidTransition> {
        match (self, to) {
            (Self::Created, Self::Active)
            | (Self::Active, Self::Closing)
            | (Self::Closing, Self::Closed) => Ok(to),
            _ => Err(InvalidTransition { from: self, to }),
        }
    }
}

/// Why a relay stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The peer closed the channel in an orderly way.
    PeerClosed,
    /// `receive` hit a transport fault.
    ReceiveFailed,
    /// `send` hit a transport fault.
    SendFailed,
    /// The session's event sequence ended.
    EventsEnded,
    /// The session refused further commands.
    SessionClosed,
    /// The server is shutting down.
    Shutdown,
    /// A pump task panicked.
    PumpFailed,
}

impl Termination {
    pub fn is_clean(self) -> bool {
        matches!(
            self,
            Self::PeerClosed | Self::EventsEnded | Self::SessionClosed | Self::Shutdown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::ReceiveFailed => "receive_failed",
            Self::SendFailed => "send_failed",
            Self::EventsEnded => "events_ended",
            Self::SessionClosed => "session_closed",
            Self::Shutdown => "shutdown",
            Self::PumpFailed => "pump_failed",
        }
    }
}

/// Result of a finished relay.
#[derive(Debug)]
pub struct RelayOutcome {
    pub termination: Termination,
    /// Every error reported while the relay ran, in report order.
    pub errors: Vec<RelayError>,
}

impl RelayOutcome {
    pub fn transport_errors(&self) -> usize {
        self.errors.iter().filter(|e| e.is_transport()).count()
    }

    pub fn command_errors(&self) -> usize {
        self.errors.iter().filter(|e| e.is_command()).count()
    }
}

/// Logs errors and keeps them for the outcome.
#[derive(Clone)]
struct Reporter {
    connection_id: ConnectionId,
    session_id: SessionId,
    errors: Arc<Mutex<Vec<RelayError>>>,
    /// Set by the first pump that stops on a transport fault.
    faulted: Arc<AtomicBool>,
}

impl Reporter {
    /// Report the transport fault that stops a pump. Only the first such
    /// fault per relay is reported; a later one from the other pump is
    /// the same failure seen from the other side.
    fn report_fault(&self, err: TransportError, pump: &'static str) {
        if self.faulted.swap(true, Ordering::AcqRel) {
            debug!(
                connection_id = %self.connection_id,
                pump,
                error = %err,
                "transport fault already reported"
            );
            return;
        }
        self.report(err.into());
    }

    fn report(&self, err: RelayError) {
        match &err {
            RelayError::Transport(e) => {
                warn!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    error = %e,
                    "transport fault"
                );
                counter!("patchbay_relay_errors_total", "kind" => "transport").increment(1);
            }
            RelayError::Command(e) => {
                warn!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    error = %e,
                    kind = e.error_kind(),
                    "command rejected"
                );
                counter!("patchbay_relay_errors_total", "kind" => "command").increment(1);
            }
        }
        self.errors.lock().push(err);
    }

    fn take(&self) -> Vec<RelayError> {
        std::mem::take(&mut *self.errors.lock())
    }
}

/// Bridges one `Session` and one `MessageChannel` until either side ends.
pub struct Relay {
    connection_id: ConnectionId,
    session: Arc<Session>,
    channel: Arc<dyn MessageChannel>,
    state: watch::Sender<RelayState>,
    stop: CancellationToken,
}

impl Relay {
    pub fn new(
        connection_id: ConnectionId,
        session: Session,
        channel: Arc<dyn MessageChannel>,
    ) -> Self {
        let (state, _) = watch::channel(RelayState::Created);
        Self {
            connection_id,
            session: Arc::new(session),
            channel,
            state,
            stop: CancellationToken::new(),
        }
    }

    /// End the relay with `Termination::Shutdown` once `stop` is cancelled.
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Watch the relay's state. The last value stays readable after `run` returns.
    pub fn state(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    /// Run both pumps to completion and tear everything down.
    #[instrument(skip_all, fields(connection_id = %self.connection_id, session_id = %self.session.id()))]
    pub async fn run(self) -> RelayOutcome {
        let started = Instant::now();
        let reporter = Reporter {
            connection_id: self.connection_id.clone(),
            session_id: self.session.id().clone(),
            errors: Arc::new(Mutex::new(Vec::new())),
            faulted: Arc::new(AtomicBool::new(false)),
        };

        self.transition(RelayState::Active);
        let outbound: JoinHandle<Termination> = tokio::spawn(outbound_pump(
            self.session.events(),
            Arc::clone(&self.channel),
            reporter.clone(),
        ));
        let inbound: JoinHandle<Termination> = tokio::spawn(inbound_pump(
            Arc::clone(&self.channel),
            Arc::clone(&self.session),
            reporter.clone(),
        ));

        let (first, pending, which) = wait_first(outbound, inbound, &self.stop).await;
        self.transition(RelayState::Closing);

        let termination = match first {
            Ok(termination) => termination,
            Err(e) => {
                error!(pump = which, error = %e, "relay pump failed");
                Termination::PumpFailed
            }
        };
        debug!(pump = which, termination = termination.as_str(), "pump finished first");

        for handle in pending {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "relay pump failed during shutdown");
                }
            }
        }

        self.session.close();
        self.channel.close().await;
        self.transition(RelayState::Closed);

        let errors = reporter.take();
        histogram!("patchbay_relay_duration_seconds").record(started.elapsed().as_secs_f64());
        counter!("patchbay_relays_finished_total", "termination" => termination.as_str())
            .increment(1);
        info!(
            termination = termination.as_str(),
            errors = errors.len(),
            "relay finished"
        );

        RelayOutcome {
            termination,
            errors,
        }
    }

    fn transition(&self, to: RelayState) {
        self.state.send_modify(|state| match state.advance(to) {
            Ok(next) => *state = next,
            Err(e) => error!(error = %e, "relay state machine violated"),
        });
    }
}

/// Wait for whichever pump finishes first (or for `stop`); hand back the
/// pumps still running.
async fn wait_first(
    mut outbound: JoinHandle<Termination>,
    mut inbound: JoinHandle<Termination>,
    stop: &CancellationToken,
) -> (
    Result<Termination, JoinError>,
    Vec<JoinHandle<Termination>>,
    &'static str,
) {
    tokio::select! {
        result = &mut outbound => (result, vec![inbound], "outbound"),
        result = &mut inbound => (result, vec![outbound], "inbound"),
        () = stop.cancelled() => (Ok(Termination::Shutdown), vec![outbound, inbound], "stop"),
    }
}

async fn outbound_pump(
    events: Option<Events>,
    channel: Arc<dyn MessageChannel>,
    reporter: Reporter,
) -> Termination {
    let Some(mut events) = events else {
        warn!("session event stream already taken");
        return Termination::EventsEnded;
    };

    while let Some(event) = events.next().await {
        match channel.send(&event).await {
            Ok(()) => counter!("patchbay_events_sent_total").increment(1),
            // The peer hung up cleanly while we were writing.
            Err(TransportError::Closed) => return Termination::PeerClosed,
            Err(e) => {
                reporter.report_fault(e, "outbound");
                return Termination::SendFailed;
            }
        }
    }
    Termination::EventsEnded
}

async fn inbound_pump(
    channel: Arc<dyn MessageChannel>,
    session: Arc<Session>,
    reporter: Reporter,
) -> Termination {
    loop {
        let command = match channel.receive().await {
            Ok(command) => command,
            Err(ReceiveError::EndOfStream) => return Termination::PeerClosed,
            Err(ReceiveError::Transport(e)) => {
                reporter.report_fault(e, "inbound");
                return Termination::ReceiveFailed;
            }
        };

        match session.handle(command).await {
            Ok(()) => counter!("patchbay_commands_handled_total").increment(1),
            Err(SessionError::Command(e)) => reporter.report(e.into()),
            Err(SessionError::Closed) => return Termination::SessionClosed,
        }
    }
}
