//! sideband-server binary: CLI parsing, logging, config, and the run loop.

use clap::Parser;
use sideband_server::config::Config;
use sideband_server::server;
use std::path::PathBuf;
use tracing::{error, info};

/// sideband-server — WebRTC signaling broker
#[derive(Parser, Debug)]
#[command(name = "sideband-server", version, about = "WebRTC signaling broker")]
struct Cli {
    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// WebSocket endpoint path
    #[arg(long)]
    endpoint_path: Option<String>,

    /// Config file path
    #[arg(long, default_value = "sideband.toml")]
    config: String,

    /// Session time-to-live in milliseconds
    #[arg(long)]
    session_ttl_ms: Option<u64>,

    /// Maximum concurrent connections
    #[arg(long)]
    connection_cap: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting sideband-server"
    );

    let config_path = PathBuf::from(&cli.config);
    let config = match Config::load(
        Some(&config_path),
        cli.listen.as_deref(),
        cli.endpoint_path.as_deref(),
        cli.session_ttl_ms,
        cli.connection_cap,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if let Err(e) = server::run(config).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("sideband-server stopped");
}
