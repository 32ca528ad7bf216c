//! # pulse-agent
//!
//! Pulse relay binary: loads settings, starts the HTTP/`WebSocket` server
//! and runs until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pulse_core::logging::init_subscriber;
use pulse_server::config::ServerConfig;
use pulse_server::metrics::install_recorder;
use pulse_server::server::PulseServer;
use pulse_server::shutdown::wait_for_signal;
use pulse_server::websocket::handlers::{BroadcastHandler, EchoHandler};
use pulse_server::websocket::manager::ClientManager;
use pulse_server::websocket::router::EventRouter;
use pulse_settings::{PulseSettings, load_settings_from_path, settings_path};
use tracing::{info, warn};

/// How long shutdown waits for the listener and then for clients.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pulse `WebSocket` relay.
#[derive(Parser, Debug)]
#[command(name = "pulse-agent", about = "Pulse WebSocket relay")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.pulse/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `pulse_server=trace`.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Command-line flags win over file and environment.
    fn apply(&self, settings: &mut PulseSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }

    fn settings_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(settings_path)
    }
}

/// `chat` is relayed to everyone, `echo` goes back to its sender.
fn build_router(manager: &Arc<ClientManager>) -> EventRouter {
    let mut router = EventRouter::new();
    router.register("chat", BroadcastHandler::new(manager.clone()));
    router.register("echo", EchoHandler);
    router
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.settings_path();
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);

    init_subscriber(&settings.logging.level, settings.logging.json);

    let config = ServerConfig::from_settings(&settings).context("Invalid settings")?;
    let manager = Arc::new(ClientManager::new().with_send_timeout(config.client.write_wait));
    let router = build_router(&manager);
    let kinds = router.kinds();

    let mut server = PulseServer::new(config, Arc::new(router), manager);
    match install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(error) => warn!(%error, "metrics disabled"),
    }

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    info!(?kinds, "Pulse relay listening on ws://{addr}/ws");

    wait_for_signal().await;

    info!("Shutting down...");
    if !server
        .shutdown()
        .graceful_shutdown(vec![handle], Some(SHUTDOWN_TIMEOUT))
        .await
    {
        warn!("listener did not stop in time");
    }
    if !server.drain(SHUTDOWN_TIMEOUT).await {
        warn!(
            remaining = server.manager().len(),
            "clients still connected after shutdown timeout"
        );
    }

    info!("Shutdown complete");
    Ok(())
}
