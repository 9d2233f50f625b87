//! Fleet Sync CLI
//!
//! Command-line entry point for the dashboard resilience and offline-sync service.

use std::path::PathBuf;

use clap::Parser;
use fleet_sync::{load_config, Config};
use tracing::Level;

#[derive(Parser)]
#[command(name = "fleet-sync")]
#[command(about = "Resilience and offline-sync layer for a device-fleet dashboard")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend base URL (overrides config file)
    #[arg(long)]
    backend_url: Option<String>,

    /// Status API port (overrides config file)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Directory for queued actions (overrides config file)
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    tracing::debug!(
        "Parsed command line arguments: config={:?}, backend_url={:?}, dashboard_port={:?}, store_dir={:?}, log_level={:?}",
        args.config,
        args.backend_url,
        args.dashboard_port,
        args.store_dir,
        args.log_level
    );

    let mut config = if let Some(config_path) = &args.config {
        tracing::debug!("Loading configuration from {:?}", config_path);
        load_config(config_path)?
    } else {
        tracing::debug!("Using default configuration");
        Config::default()
    };

    if let Some(backend_url) = args.backend_url {
        config.backend.base_url = backend_url;
    }
    if let Some(dashboard_port) = args.dashboard_port {
        config.dashboard.port = dashboard_port;
    }
    if let Some(store_dir) = args.store_dir {
        config.queue.store_dir = Some(store_dir);
    }
    config.validate()?;

    tracing::info!("Starting fleet sync against {}", config.backend.base_url);
    tracing::debug!(
        "Sections: {}, Stream: {}, Store: {:?}",
        config.sections.len(),
        config.stream.is_some(),
        config.queue.store_dir
    );

    fleet_sync::run(config).await?;

    Ok(())
}
