/// The engine subsystem could not be constructed for a new session.
#[derive(Clone, Debug, thiserror::Error)]
#[error("engine init failed: {0}")]
pub struct EngineInitError(pub String);

impl EngineInitError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Channel read/write fault. Terminal for the connection it happened on.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Outcome of a failed `receive`. Orderly closure is not a fault.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("end of stream")]
    EndOfStream,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A received message that the engine could not apply. Recoverable.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("command has no \"type\" field")]
    MissingType,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("missing field {field:?} for {command}")]
    MissingField { command: String, field: String },
    #[error("invalid field {field:?}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl CommandError {
    pub fn missing_field(command: &str, field: &str) -> Self {
        Self::MissingField {
            command: command.to_string(),
            field: field.to_string(),
        }
    }

    pub fn invalid_field(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingType => "missing_type",
            Self::UnknownCommand(_) => "unknown_command",
            Self::MissingField { .. } => "missing_field",
            Self::InvalidField { .. } => "invalid_field",
            Self::UnknownNode(_) => "unknown_node",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Failure of `Session::handle`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// Whether the session can keep accepting commands after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// The engine tried to emit an event after its session closed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    #[error("session closed")]
    Closed,
}

/// Everything a relay reports while it runs.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RelayError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("command: {0}")]
    Command(#[from] CommandError),
}

impl RelayError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Self::Command(_))
    }
}
