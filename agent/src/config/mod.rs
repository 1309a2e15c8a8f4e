//! Configuration management
//!
//! Values come from an optional TOML file and are then overridden by
//! environment variables, so a container can run with env only.

use ::config as config_crate;
use anyhow::{Context, Result};
use config_crate::Environment;
use linkwatch_model::constants::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub throughput: ThroughputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Questdb,
    Sqlite,
}

/// Transport used for ILP ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestProtocol {
    Http,
    Tcp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_store_host")]
    pub host: String,
    /// HTTP port serving queries (and ILP when protocol is http)
    #[serde(default = "default_store_port")]
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: IngestProtocol,
    #[serde(default = "default_ilp_port")]
    pub ilp_port: u16,
    /// Database file for the sqlite backend, `:memory:` allowed
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_auto_flush_rows")]
    pub auto_flush_rows: usize,
    #[serde(default = "default_auto_flush_interval_ms")]
    pub auto_flush_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_hosts")]
    pub hosts: Vec<String>,
    #[serde(default = "default_probe_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_probe_sample_count")]
    pub sample_count: u32,
    #[serde(default = "default_probe_interval_seconds")]
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThroughputConfig {
    #[serde(default = "default_throughput_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_throughput_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_throughput_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_download_bytes")]
    pub download_bytes: u64,
    #[serde(default = "default_upload_bytes")]
    pub upload_bytes: u64,
    #[serde(default = "default_latency_samples")]
    pub latency_samples: u32,
    #[serde(default = "default_public_ip_service")]
    pub public_ip_service: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    3000
}

fn default_backend() -> StoreBackend {
    StoreBackend::Questdb
}

fn default_store_host() -> String {
    "localhost".to_string()
}

fn default_store_port() -> u16 {
    9000
}

fn default_protocol() -> IngestProtocol {
    IngestProtocol::Http
}

fn default_ilp_port() -> u16 {
    9009
}

fn default_store_path() -> String {
    "linkwatch.db".to_string()
}

fn default_table() -> String {
    DEFAULT_METRICS_TABLE.to_string()
}

fn default_auto_flush_rows() -> usize {
    DEFAULT_AUTO_FLUSH_ROWS
}

fn default_auto_flush_interval_ms() -> u64 {
    DEFAULT_AUTO_FLUSH_INTERVAL_MS
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_retry_timeout_ms() -> u64 {
    DEFAULT_RETRY_TIMEOUT_MS
}

fn default_reconnect_interval_ms() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_MS
}

fn default_health_check_interval_ms() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL_MS
}

fn default_probe_hosts() -> Vec<String> {
    DEFAULT_PROBE_HOSTS.iter().map(|h| h.to_string()).collect()
}

fn default_probe_timeout_seconds() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECONDS
}

fn default_probe_sample_count() -> u32 {
    DEFAULT_PROBE_SAMPLE_COUNT
}

fn default_probe_interval_seconds() -> u64 {
    DEFAULT_PROBE_INTERVAL_SECONDS
}

fn default_throughput_interval_seconds() -> u64 {
    DEFAULT_THROUGHPUT_INTERVAL_SECONDS
}

fn default_throughput_timeout_seconds() -> u64 {
    DEFAULT_THROUGHPUT_TIMEOUT_SECONDS
}

fn default_throughput_endpoint() -> String {
    "https://speed.cloudflare.com".to_string()
}

fn default_download_bytes() -> u64 {
    25_000_000
}

fn default_upload_bytes() -> u64 {
    10_000_000
}

fn default_latency_samples() -> u32 {
    5
}

fn default_public_ip_service() -> String {
    "https://api.ipify.org".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            host: default_store_host(),
            port: default_store_port(),
            protocol: default_protocol(),
            ilp_port: default_ilp_port(),
            path: default_store_path(),
            table: default_table(),
            auto_flush_rows: default_auto_flush_rows(),
            auto_flush_interval_ms: default_auto_flush_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            retry_timeout_ms: default_retry_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            hosts: default_probe_hosts(),
            timeout_seconds: default_probe_timeout_seconds(),
            sample_count: default_probe_sample_count(),
            interval_seconds: default_probe_interval_seconds(),
        }
    }
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_throughput_interval_seconds(),
            timeout_seconds: default_throughput_timeout_seconds(),
            endpoint: default_throughput_endpoint(),
            download_bytes: default_download_bytes(),
            upload_bytes: default_upload_bytes(),
            latency_samples: default_latency_samples(),
            public_ip_service: default_public_ip_service(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "questdb" => Ok(StoreBackend::Questdb),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => Err(format!("unknown store backend: {}", other)),
        }
    }
}

impl FromStr for IngestProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(IngestProtocol::Http),
            "tcp" => Ok(IngestProtocol::Tcp),
            other => Err(format!("unknown ingestion protocol: {}", other)),
        }
    }
}

/// Flat environment overrides, keyed by the lowercased variable name
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    server_host: Option<String>,
    server_port: Option<u16>,
    db_backend: Option<String>,
    db_host: Option<String>,
    db_port: Option<u16>,
    db_protocol: Option<String>,
    db_ilp_port: Option<u16>,
    db_path: Option<String>,
    db_table: Option<String>,
    db_auto_flush_rows: Option<usize>,
    db_auto_flush_interval_ms: Option<u64>,
    db_request_timeout_ms: Option<u64>,
    db_retry_timeout_ms: Option<u64>,
    db_reconnect_interval_ms: Option<u64>,
    db_health_check_interval_ms: Option<u64>,
    ping_hosts: Option<String>,
    ping_timeout: Option<u64>,
    ping_sample_count: Option<u32>,
    ping_interval_seconds: Option<u64>,
    throughput_interval_seconds: Option<u64>,
    throughput_timeout_seconds: Option<u64>,
    throughput_endpoint: Option<String>,
    throughput_download_bytes: Option<u64>,
    throughput_upload_bytes: Option<u64>,
    public_ip_service: Option<String>,
    log_level: Option<String>,
}

fn replace<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

/// Longest accepted interval or timeout
const MAX_SECONDS: u64 = 7 * 24 * 3600;
const MAX_MILLIS: u64 = MAX_SECONDS * 1000;

fn check_range(name: &str, value: u64, max: u64) -> Result<()> {
    if value == 0 {
        anyhow::bail!("{} must be greater than zero", name);
    }
    if value > max {
        anyhow::bail!("{} must be at most {}", name, max);
    }
    Ok(())
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {:?}", path))?;
                toml::from_str(&contents).with_context(|| "Failed to parse config file")?
            }
            None => Config::default(),
        };

        config.apply_env(Environment::default())?;
        config.validate()?;

        Ok(config)
    }

    /// Overlay values from an environment source (the process environment in production).
    pub fn apply_env(&mut self, env: Environment) -> Result<()> {
        let env: EnvOverrides = config_crate::Config::builder()
            .add_source(env.try_parsing(true).ignore_empty(true))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .context("Invalid environment override")?;

        replace(&mut self.server.host, env.server_host);
        replace(&mut self.server.port, env.server_port);

        if let Some(backend) = env.db_backend {
            self.store.backend = backend.parse().map_err(anyhow::Error::msg)?;
        }
        replace(&mut self.store.host, env.db_host);
        replace(&mut self.store.port, env.db_port);
        if let Some(protocol) = env.db_protocol {
            self.store.protocol = protocol.parse().map_err(anyhow::Error::msg)?;
        }
        replace(&mut self.store.ilp_port, env.db_ilp_port);
        replace(&mut self.store.path, env.db_path);
        replace(&mut self.store.table, env.db_table);
        replace(&mut self.store.auto_flush_rows, env.db_auto_flush_rows);
        replace(&mut self.store.auto_flush_interval_ms, env.db_auto_flush_interval_ms);
        replace(&mut self.store.request_timeout_ms, env.db_request_timeout_ms);
        replace(&mut self.store.retry_timeout_ms, env.db_retry_timeout_ms);
        replace(&mut self.store.reconnect_interval_ms, env.db_reconnect_interval_ms);
        replace(&mut self.store.health_check_interval_ms, env.db_health_check_interval_ms);

        replace(&mut self.probe.hosts, env.ping_hosts.as_deref().map(parse_host_list));
        replace(&mut self.probe.timeout_seconds, env.ping_timeout);
        replace(&mut self.probe.sample_count, env.ping_sample_count);
        replace(&mut self.probe.interval_seconds, env.ping_interval_seconds);

        replace(&mut self.throughput.interval_seconds, env.throughput_interval_seconds);
        replace(&mut self.throughput.timeout_seconds, env.throughput_timeout_seconds);
        replace(&mut self.throughput.endpoint, env.throughput_endpoint);
        replace(&mut self.throughput.download_bytes, env.throughput_download_bytes);
        replace(&mut self.throughput.upload_bytes, env.throughput_upload_bytes);
        replace(&mut self.throughput.public_ip_service, env.public_ip_service);

        replace(&mut self.logging.level, env.log_level);

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.probe.hosts.is_empty() {
            anyhow::bail!("at least one probe host must be configured");
        }
        check_range("probe.interval_seconds", self.probe.interval_seconds, MAX_SECONDS)?;
        check_range("probe.timeout_seconds", self.probe.timeout_seconds, MAX_SECONDS)?;
        if self.probe.sample_count == 0 {
            anyhow::bail!("probe.sample_count must be greater than zero");
        }
        check_range("throughput.interval_seconds", self.throughput.interval_seconds, MAX_SECONDS)?;
        check_range("throughput.timeout_seconds", self.throughput.timeout_seconds, MAX_SECONDS)?;
        if self.store.auto_flush_rows == 0 {
            anyhow::bail!("store.auto_flush_rows must be greater than zero");
        }
        check_range("store.auto_flush_interval_ms", self.store.auto_flush_interval_ms, MAX_MILLIS)?;
        check_range("store.request_timeout_ms", self.store.request_timeout_ms, MAX_MILLIS)?;
        check_range("store.retry_timeout_ms", self.store.retry_timeout_ms, MAX_MILLIS)?;
        check_range("store.reconnect_interval_ms", self.store.reconnect_interval_ms, MAX_MILLIS)?;
        check_range(
            "store.health_check_interval_ms",
            self.store.health_check_interval_ms,
            MAX_MILLIS,
        )?;
        if self.store.table.trim().is_empty() {
            anyhow::bail!("store.table must not be empty");
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe.interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe.timeout_seconds)
    }

    pub fn throughput_interval(&self) -> Duration {
        Duration::from_secs(self.throughput.interval_seconds)
    }

    pub fn throughput_timeout(&self) -> Duration {
        Duration::from_secs(self.throughput.timeout_seconds)
    }
}

/// Split a comma separated host list, dropping blanks.
pub fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .map(|h| h.to_string())
        .collect()
}
