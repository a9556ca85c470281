//! Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics::{counter, gauge};
use patchbay_core::ConnectionId;
use patchbay_engine::{DeviceServices, EngineFactory, Session};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::channel::{MessageChannel, WsChannel};
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::relay::Relay;
use crate::shutdown::ShutdownCoordinator;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Builds one engine per connection.
    pub engine: Arc<dyn EngineFactory>,
    /// Process-wide audio/MIDI services.
    pub services: Arc<DeviceServices>,
    pub config: Arc<ServerConfig>,
    /// One permit per open connection.
    pub connections: Arc<Semaphore>,
    pub shutdown: ShutdownCoordinator,
    /// When the server started.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        engine: Arc<dyn EngineFactory>,
        services: Arc<DeviceServices>,
    ) -> Self {
        Self {
            engine,
            services,
            connections: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            shutdown: ShutdownCoordinator::new(),
            start_time: Instant::now(),
        }
    }

    /// Number of WebSocket connections currently open.
    pub fn open_connections(&self) -> usize {
        self.config
            .max_connections
            .saturating_sub(self.connections.available_permits())
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let assets = ServeDir::new(&state.config.static_dir);
    Router::new()
        .route("/socket", get(ws_handler))
        .route("/health", get(health_handler))
        .fallback_service(assets)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and start serving. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    engine: Arc<dyn EngineFactory>,
    services: Arc<DeviceServices>,
) -> Result<ServerHandle, ServerError> {
    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.listen.clone(),
            source,
        })?;
    let addr = listener.local_addr()?;
    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);

    let state = AppState::new(config, engine, services);
    let shutdown = state.shutdown.clone();
    let router = build_router(state);

    let token = shutdown.token();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "server stopped with error");
        }
    });

    info!(%addr, "patchbay server listening");
    Ok(ServerHandle {
        addr,
        shutdown,
        shutdown_timeout,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: ShutdownCoordinator,
    shutdown_timeout: Duration,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address of the editor page.
    pub fn url(&self) -> String {
        ServerConfig::editor_url(self.addr)
    }

    /// Stop accepting, end every relay and wait for the listener to finish.
    pub async fn shutdown(self) {
        info!("shutting down server");
        self.shutdown
            .graceful_shutdown(Some(self.shutdown_timeout))
            .await;
        if tokio::time::timeout(self.shutdown_timeout, self.server)
            .await
            .is_err()
        {
            warn!("listener did not stop in time");
        }
        info!("server stopped");
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, state.open_connections()))
}

/// GET /socket
///
/// The session is built before the upgrade is accepted so that an engine
/// that cannot start is answered with 503 instead of an open socket.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return unavailable("server is shutting down");
    }
    let Ok(permit) = Arc::clone(&state.connections).try_acquire_owned() else {
        warn!(
            max_connections = state.config.max_connections,
            "connection limit reached"
        );
        counter!("patchbay_connections_rejected_total", "reason" => "limit").increment(1);
        return unavailable("too many connections");
    };

    let session = match Session::create(
        state.engine.as_ref(),
        &state.services,
        &state.config.session,
    ) {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "could not create session");
            counter!("patchbay_connections_rejected_total", "reason" => "engine_init")
                .increment(1);
            return unavailable("engine unavailable");
        }
    };

    let connection_id = ConnectionId::new();
    let failed_id = connection_id.clone();
    ws.max_message_size(state.config.max_message_size)
        .on_failed_upgrade(move |e| {
            warn!(connection_id = %failed_id, error = %e, "websocket upgrade failed");
        })
        .on_upgrade(move |socket| run_connection(socket, connection_id, session, permit, state))
}

fn unavailable(reason: &'static str) -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, reason).into_response()
}

async fn run_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    session: Session,
    _permit: OwnedSemaphorePermit,
    state: AppState,
) {
    info!(connection_id = %connection_id, session_id = %session.id(), "editor connected");
    counter!("patchbay_connections_total").increment(1);
    gauge!("patchbay_connections_active").increment(1.0);

    let channel: Arc<dyn MessageChannel> = Arc::new(WsChannel::new(socket));
    let relay = Relay::new(connection_id.clone(), session, channel)
        .with_stop(state.shutdown.token());
    let outcome = state.shutdown.track(relay.run()).await;

    gauge!("patchbay_connections_active").decrement(1.0);
    info!(
        connection_id = %connection_id,
        termination = outcome.termination.as_str(),
        errors = outcome.errors.len(),
        "editor disconnected"
    );
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use axum::body::Body;
    use axum::http::Request;
    use patchbay_engine::{DeviceConfig, GraphEngineFactory};
    use tower::ServiceExt;

    use super::*;

    fn state_with(config: ServerConfig) -> AppState {
        let services = DeviceServices::initialize(DeviceConfig::default()).unwrap();
        AppState::new(config, Arc::new(GraphEngineFactory), Arc::new(services))
    }

    fn state() -> AppState {
        state_with(ServerConfig {
            static_dir: PathBuf::from("/nonexistent/patchbay-static"),
            ..ServerConfig::default()
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = build_router(state());
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert!(parsed["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_counts_held_permits() {
        let state = state();
        let _held = Arc::clone(&state.connections).try_acquire_owned().unwrap();
        assert_eq!(state.open_connections(), 1);

        let app = build_router(state);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let parsed = body_json(app.oneshot(req).await.unwrap()).await;
        assert_eq!(parsed["connections"], 1);
    }

    #[tokio::test]
    async fn socket_requires_upgrade() {
        let app = build_router(state());
        let req = Request::builder().uri("/socket").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_asset_returns_404() {
        let app = build_router(state());
        let req = Request::builder()
            .uri("/nonexistent.js")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_static_assets() {
        let dir = std::env::temp_dir().join(format!("patchbay-static-{}", ConnectionId::new()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), "<h1>patchbay</h1>").unwrap();

        let app = build_router(state_with(ServerConfig {
            static_dir: dir.clone(),
            ..ServerConfig::default()
        }));
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        assert_eq!(&body[..], b"<h1>patchbay</h1>");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port_and_shuts_down() {
        let services = DeviceServices::initialize(DeviceConfig::default()).unwrap();
        let config = ServerConfig {
            listen: "127.0.0.1:0".into(),
            shutdown_timeout_secs: 1,
            ..ServerConfig::default()
        };
        let handle = start(config, Arc::new(GraphEngineFactory), Arc::new(services))
            .await
            .unwrap();
        assert!(handle.addr().port() > 0);
        assert!(handle.url().starts_with("http://127.0.0.1:"));

        let resp = reqwest::get(format!("{}health", handle.url())).await.unwrap();
        assert_eq!(resp.status(), 200);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn bind_failure_names_address() {
        let services = DeviceServices::initialize(DeviceConfig::default()).unwrap();
        let config = ServerConfig {
            listen: "not-an-address".into(),
            ..ServerConfig::default()
        };
        let err = start(config, Arc::new(GraphEngineFactory), Arc::new(services))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("not-an-address"));
    }
}
