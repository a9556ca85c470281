pub mod errors;
pub mod ids;
pub mod message;

pub use errors::{
    CommandError, EmitError, EngineInitError, ReceiveError, RelayError, SessionError, TransportError,
};
pub use ids::{ConnectionId, SessionId};
pub use message::Message;
