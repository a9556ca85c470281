//! Graceful shutdown coordination via `CancellationToken`.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Default timeout for graceful shutdown before giving up on open connections.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinates graceful shutdown of the listener and every open connection.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    connections: TaskTracker,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run a connection future so that `graceful_shutdown` waits for it.
    pub async fn track<F: Future>(&self, connection: F) -> F::Output {
        self.connections.track_future(connection).await
    }

    /// Connections currently being tracked.
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// 1. Cancel the token (listener stops accepting, relays stop)
    /// 2. Wait up to `timeout` for tracked connections to finish
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        self.connections.close();
        info!(
            connections = self.connections.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for connections to close"
        );

        if tokio::time::timeout(timeout, self.connections.wait())
            .await
            .is_err()
        {
            warn!("shutdown timed out after {timeout:?}, some connections may still be open");
        }
    }
}
