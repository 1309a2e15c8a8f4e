//! Defaults shared by the agent and the server

/// Default table holding both probe and throughput rows
pub const DEFAULT_METRICS_TABLE: &str = "network_metrics";

/// Hosts probed when none are configured
pub const DEFAULT_PROBE_HOSTS: [&str; 2] = ["8.8.8.8", "1.1.1.1"];

pub const DEFAULT_PROBE_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_PROBE_TIMEOUT_SECONDS: u64 = 5;
pub const DEFAULT_PROBE_SAMPLE_COUNT: u32 = 3;

pub const DEFAULT_THROUGHPUT_INTERVAL_SECONDS: u64 = 3600;
pub const DEFAULT_THROUGHPUT_TIMEOUT_SECONDS: u64 = 120;

/// Ingestion auto-flush thresholds
pub const DEFAULT_AUTO_FLUSH_ROWS: usize = 100;
pub const DEFAULT_AUTO_FLUSH_INTERVAL_MS: u64 = 1000;

/// Query channel timeouts
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RETRY_TIMEOUT_MS: u64 = 1000;

/// Connection manager cadence
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;

/// Bits per second in one megabit per second
pub const BPS_PER_MBPS: f64 = 1_000_000.0;
