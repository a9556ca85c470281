//! # patchbay
//!
//! Serves the patch editor: static assets over HTTP and one engine session
//! per WebSocket connection. `--demo` plays a scripted patch offline instead.

#![deny(unsafe_code)]

mod browser;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use patchbay_engine::{demo, DeviceConfig, DeviceServices, GraphEngineFactory, SessionConfig};
use patchbay_server::ServerConfig;
use patchbay_telemetry::{LogFormat, TelemetryConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Level;

/// Pause between demo steps so the log reads like a performance.
const DEMO_STEP_DELAY: Duration = Duration::from_millis(250);

/// Patch editor server.
#[derive(Parser, Debug)]
#[command(name = "patchbay", version, about = "Patch editor server")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "PATCHBAY_LISTEN", default_value = "localhost:8080")]
    listen: String,

    /// Run the offline demonstration instead of serving.
    #[arg(long, env = "PATCHBAY_DEMO")]
    demo: bool,

    /// Open the editor in a web browser.
    #[arg(
        long,
        env = "PATCHBAY_BROWSER",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    browser: bool,

    /// Directory the editor's static assets are served from.
    #[arg(long, env = "PATCHBAY_STATIC_DIR", default_value = "static")]
    static_dir: PathBuf,

    /// Maximum concurrent editor connections.
    #[arg(long, env = "PATCHBAY_MAX_CONNECTIONS", default_value_t = 50)]
    max_connections: usize,

    /// Outbound event queue capacity per session.
    #[arg(long, env = "PATCHBAY_EVENT_QUEUE", default_value_t = 256)]
    event_queue: usize,

    /// Log output format (`pretty` or `json`).
    #[arg(long, env = "PATCHBAY_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen: self.listen.clone(),
            static_dir: self.static_dir.clone(),
            max_connections: self.max_connections,
            session: SessionConfig {
                event_queue: self.event_queue,
            },
            ..ServerConfig::default()
        }
    }

    fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: self.log_format,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _telemetry = patchbay_telemetry::init_telemetry(cli.telemetry_config())
        .context("Failed to initialize logging")?;

    let services = DeviceServices::initialize(DeviceConfig::default())
        .context("Failed to initialize audio/MIDI services")?;
    let services = Arc::new(services);

    if cli.demo {
        let events = demo::run(&GraphEngineFactory, &services, DEMO_STEP_DELAY)
            .await
            .context("Demo failed")?;
        tracing::info!(events = events.len(), "demo complete");
        return Ok(());
    }

    let handle = patchbay_server::start(
        cli.server_config(),
        Arc::new(GraphEngineFactory),
        Arc::clone(&services),
    )
    .await
    .context("Failed to start server")?;

    let url = handle.url();
    if !cli.browser || !browser::open(&url) {
        println!("Open your web browser to {url}\n");
    }
    println!("Press enter to quit...");

    tokio::select! {
        () = wait_for_enter() => tracing::info!("enter pressed"),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for ctrl+c")?;
            tracing::info!("interrupted");
        }
    }

    handle.shutdown().await;
    Ok(())
}

/// Resolves when a line is read from stdin. A closed stdin never resolves,
/// leaving Ctrl-C as the only way out.
async fn wait_for_enter() {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    match lines.next_line().await {
        Ok(Some(_)) => {}
        Ok(None) | Err(_) => std::future::pending().await,
    }
}
