//! # tally
//!
//! Tally server binary: loads settings, starts the HTTP server, and shuts
//! every stream down cleanly on ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tally_core::logging::init_subscriber;
use tally_server::config::ServerConfig;
use tally_server::server::TallyServer;
use tally_settings::TallySettings;

/// Tally live hit-counter server.
#[derive(Parser, Debug)]
#[command(name = "tally", about = "Live hit counters over Server-Sent Events")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.tally/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn settings_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(tally_settings::settings_path)
    }

    /// Apply flag overrides on top of loaded settings.
    fn apply(&self, settings: &mut TallySettings) {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.settings_path();
    let mut settings = tally_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);

    init_subscriber(&settings.logging.level, settings.logging.format);

    let metrics = tally_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let server = TallyServer::new(ServerConfig::from(&settings)).with_metrics(metrics);

    let handle = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        max_connections = settings.stream.max_connections,
        "Tally listening on http://{}",
        handle.addr
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let report = server.shutdown_gracefully(handle).await;
    tracing::info!(
        closed = report.closed,
        drained = report.drained,
        remaining_tasks = report.remaining_tasks,
        "Shutdown complete"
    );
    Ok(())
}
