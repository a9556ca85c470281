//! # patchbay-server
//!
//! Axum HTTP + `WebSocket` front end for patchbay sessions.
//!
//! - `/socket`: one WebSocket per editor, bridged to its own engine session by a [`relay::Relay`]
//! - `/health`: liveness and connection count
//! - everything else: static editor assets

pub mod channel;
pub mod config;
pub mod health;
#[cfg(test)]
mod memory;
pub mod relay;
pub mod server;
pub mod shutdown;

pub use channel::{MessageChannel, WsChannel};
pub use config::ServerConfig;
pub use relay::{Relay, RelayOutcome, RelayState, Termination};
pub use server::{build_router, start, AppState, ServerError, ServerHandle};
