//! Server configuration.

use std::path::PathBuf;

use patchbay_engine::SessionConfig;
use serde::{Deserialize, Serialize};

/// Configuration for the patchbay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind, `host:port` (default `"localhost:8080"`).
    pub listen: String,
    /// Directory the editor's static assets are served from.
    pub static_dir: PathBuf,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Settings applied to every new session.
    pub session: SessionConfig,
    /// How long to wait for open connections when shutting down.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "localhost:8080".into(),
            static_dir: PathBuf::from("static"),
            max_connections: 50,
            max_message_size: 1024 * 1024, // 1 MB
            session: SessionConfig::default(),
            shutdown_timeout_secs: 5,
        }
    }
}

impl ServerConfig {
    /// URL of the editor page once bound to `addr`.
    pub fn editor_url(addr: std::net::SocketAddr) -> String {
        format!("http://{addr}/")
    }
}
