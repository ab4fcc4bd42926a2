//! Headless host binary for stdin/stdout JSON communication.
//!
//! Loads `config.toml` (or the path given as the first argument), builds
//! the router, and serves `CommandEnvelope` lines from stdin.
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uir::AppConfig;
use uir::host::handler::HostHandler;
use uir::host::stdio::run_stdio_bridge;
use uir::startup::{build_router, spawn_health_monitor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise tracing to stderr only (stdout is reserved for the JSON
    // protocol).
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(AppConfig::default_config_path);
    tracing::info!(config = %path.display(), "uir-host starting");

    let config = AppConfig::load_or_default(&path)?;
    let router = Arc::new(build_router(&config).await?);

    let cancel = CancellationToken::new();
    let monitor = spawn_health_monitor(&router, &config, cancel.clone());

    let result = run_stdio_bridge(HostHandler::new(router)).await;

    cancel.cancel();
    if let Some(monitor) = monitor {
        let _ = monitor.await;
    }

    result.map_err(|e| {
        tracing::error!(error = %e, "uir-host exited with error");
        anyhow::anyhow!("uir-host failed: {e}")
    })?;

    tracing::info!("uir-host shut down cleanly");
    Ok(())
}
