//! linkwatch server - runs the monitor and serves its HTTP API

mod handlers;

use anyhow::{Context, Result};
use clap::Parser;
use handlers::AppState;
use linkwatch::{Config, Monitor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "linkwatch server - network reachability and throughput monitoring", long_about = None)]
struct Args {
    /// Configuration file path (optional, env overrides apply either way)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    info!("Starting linkwatch server v{}", env!("CARGO_PKG_VERSION"));

    let monitor = Arc::new(Monitor::build(&config)?);
    monitor.start();

    let result = serve(&config, monitor.clone()).await;
    if let Err(e) = &result {
        error!("Server stopped with error: {:#}", e);
    }

    // Runs on every exit path of serve.
    monitor.shutdown().await;
    info!("linkwatch server stopped");
    result
}

async fn serve(config: &Config, monitor: Arc<Monitor>) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    info!("Server listening on {}", bind_addr);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let app = handlers::router(AppState { monitor });
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("HTTP server failed")
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("Failed to register SIGTERM handler: {}", e);
                    let _ = ctrl_c.await;
                    info!("Received SIGINT, shutting down");
                    cancel.cancel();
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received SIGINT, shutting down");
    }

    cancel.cancel();
}
