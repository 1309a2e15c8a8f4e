//! linkwatch - network reachability and throughput monitor
//!
//! Runs the monitor headless, or one-shot export/report/speed-test modes
//! against the configured store.

use anyhow::{Context, Result};
use clap::Parser;
use linkwatch::analysis::{Granularity, resolve_range, summarize};
use linkwatch::config::Config;
use linkwatch::service::connector_for;
use linkwatch::storage::{ConnectionManager, ConnectionSettings, MetricsRepository};
use linkwatch::testing::{HttpSpeedTest, ThroughputTester};
use linkwatch::trigger::ThroughputTrigger;
use linkwatch::{Monitor, output};
use linkwatch_model::TimeRange;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "linkwatch")]
#[command(version)]
#[command(about = "Network reachability and throughput monitor", long_about = None)]
struct Args {
    /// Configuration file path (optional, env overrides apply either way)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,

    /// Export probe history for the time range as CSV
    #[arg(long)]
    export: bool,

    /// Print a connectivity report for the time range
    #[arg(long)]
    connectivity: bool,

    /// Run one throughput test and print it as JSON
    #[arg(long)]
    speedtest: bool,

    /// Output file for export
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Time range: --last 24h, 7d, etc.
    #[arg(long)]
    last: Option<String>,

    /// Start time for range: YYYY-MM-DD HH:MM
    #[arg(long)]
    start: Option<String>,

    /// End time for range: YYYY-MM-DD HH:MM
    #[arg(long)]
    end: Option<String>,

    /// Bucket width for --connectivity: minute, hour, day or e.g. 15m
    #[arg(long, default_value = "hour")]
    granularity: String,
}

impl Args {
    fn range(&self) -> Result<TimeRange> {
        resolve_range(self.last.as_deref(), self.start.as_deref(), self.end.as_deref())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    info!("linkwatch v{}", env!("CARGO_PKG_VERSION"));

    if args.export {
        run_export(&config, &args).await
    } else if args.connectivity {
        run_connectivity(&config, &args).await
    } else if args.speedtest {
        run_speedtest(&config).await
    } else {
        run_monitoring(&config).await
    }
}

/// One connection attempt, no background loop.
async fn open_repository(config: &Config) -> (MetricsRepository, Result<()>) {
    let connection = ConnectionManager::new(
        connector_for(config),
        ConnectionSettings::from_config(&config.store),
    );
    let connected = connection
        .connect_once()
        .await
        .map_err(|reason| anyhow::anyhow!("Store unavailable: {}", reason));
    (
        MetricsRepository::new(connection, config.store.table.clone()),
        connected,
    )
}

async fn run_monitoring(config: &Config) -> Result<()> {
    let monitor = Monitor::build(config)?;
    monitor.start();
    info!("Monitoring (Press Ctrl+C to stop)");

    let result = tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C");
    monitor.shutdown().await;
    result
}

async fn run_export(config: &Config, args: &Args) -> Result<()> {
    let range = args.range()?;
    let (repository, connected) = open_repository(config).await;
    connected?;

    let metrics = repository.query_probe_history(range, None).await;
    repository.close().await;
    let metrics = metrics?;
    info!("Found {} probe rows", metrics.len());

    let output_path = args.output.clone().unwrap_or_else(|| {
        PathBuf::from(format!(
            "linkwatch_export_{}.csv",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        ))
    });
    output::export_csv(&metrics, &output_path)?;
    info!("Exported to {:?}", output_path);
    Ok(())
}

async fn run_connectivity(config: &Config, args: &Args) -> Result<()> {
    let range = args.range()?;
    let granularity: Granularity = args.granularity.parse()?;
    let (repository, connected) = open_repository(config).await;
    connected?;

    let buckets = repository.query_connectivity_status(range, granularity).await;
    repository.close().await;
    let buckets = buckets?;

    print!("{}", output::connectivity_report(&buckets, &summarize(&buckets)));
    Ok(())
}

async fn run_speedtest(config: &Config) -> Result<()> {
    let (repository, connected) = open_repository(config).await;
    if let Err(e) = connected {
        warn!("{:#}; the result will not be stored", e);
    }
    let repository = Arc::new(repository);

    let backend = Arc::new(HttpSpeedTest::from_config(&config.throughput)?);
    let tester = ThroughputTester::new(backend, config.throughput_timeout());
    let trigger = ThroughputTrigger::new(tester, repository.clone());

    let result = trigger.trigger().await;
    repository.close().await;

    let result = result.map_err(|e| anyhow::anyhow!("{} ({})", e, e.code()))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
