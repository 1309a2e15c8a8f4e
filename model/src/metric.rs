//! Metric data structures

use crate::constants::BPS_PER_MBPS;
use crate::error::ProbeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which measurement produced a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricSource {
    Probe,
    Throughput,
}

impl MetricSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricSource::Probe => "probe",
            MetricSource::Throughput => "throughput",
        }
    }
}

impl fmt::Display for MetricSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for MetricSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "probe" => Ok(MetricSource::Probe),
            "throughput" => Ok(MetricSource::Throughput),
            other => Err(format!("unknown metric source: {}", other)),
        }
    }
}

/// Reachability of a host as recorded in a probe row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Up,
    Degraded,
    Down,
}

impl ConnectivityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectivityStatus::Up => "up",
            ConnectivityStatus::Degraded => "degraded",
            ConnectivityStatus::Down => "down",
        }
    }
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ConnectivityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(ConnectivityStatus::Up),
            "degraded" => Ok(ConnectivityStatus::Degraded),
            "down" => Ok(ConnectivityStatus::Down),
            other => Err(format!("unknown connectivity status: {}", other)),
        }
    }
}

/// Outcome of one successful reachability probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub host: String,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    pub packet_loss_pct: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub stddev_ms: Option<f64>,
}

impl ProbeResult {
    /// Status derived from packet loss: any loss on a reachable host is degraded.
    pub fn connectivity_status(&self) -> ConnectivityStatus {
        if !self.reachable {
            return ConnectivityStatus::Down;
        }
        match self.packet_loss_pct {
            Some(loss) if loss >= 100.0 => ConnectivityStatus::Down,
            Some(loss) if loss > 0.0 => ConnectivityStatus::Degraded,
            _ => ConnectivityStatus::Up,
        }
    }
}

/// Outcome of one successful throughput test. Bandwidth is in Mbps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputResult {
    pub timestamp: DateTime<Utc>,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    pub jitter_ms: Option<f64>,
    pub server_location: Option<String>,
    pub isp: Option<String>,
    pub external_ip: Option<String>,
    pub internal_ip: Option<String>,
}

/// One row of the metrics table.
///
/// Probe rows never carry bandwidth fields and throughput rows never carry
/// packet loss or connectivity status; the constructors below are the only
/// producers used by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub timestamp: DateTime<Utc>,
    pub source: MetricSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_loss_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectivity_status: Option<ConnectivityStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_bandwidth_bps: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_bandwidth_bps: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
}

impl Metric {
    /// Bare row with every optional field absent
    pub fn new(timestamp: DateTime<Utc>, source: MetricSource) -> Self {
        Self {
            timestamp,
            source,
            host: None,
            latency_ms: None,
            jitter_ms: None,
            packet_loss_pct: None,
            connectivity_status: None,
            download_bandwidth_bps: None,
            upload_bandwidth_bps: None,
            server_location: None,
            isp: None,
            external_ip: None,
            internal_ip: None,
        }
    }

    pub fn from_probe(result: &ProbeResult, timestamp: DateTime<Utc>) -> Self {
        let mut metric = Self::new(timestamp, MetricSource::Probe);
        metric.host = Some(result.host.clone());
        metric.latency_ms = result.latency_ms;
        metric.jitter_ms = result.jitter_ms;
        metric.packet_loss_pct = result.packet_loss_pct;
        metric.connectivity_status = Some(result.connectivity_status());
        metric
    }

    /// A failed probe still produces a row so outages show up as data, not gaps.
    pub fn probe_down(error: &ProbeError, timestamp: DateTime<Utc>) -> Self {
        let mut metric = Self::new(timestamp, MetricSource::Probe);
        metric.host = Some(error.host().to_string());
        metric.packet_loss_pct = Some(100.0);
        metric.connectivity_status = Some(ConnectivityStatus::Down);
        metric
    }

    pub fn from_throughput(result: &ThroughputResult) -> Self {
        let mut metric = Self::new(result.timestamp, MetricSource::Throughput);
        metric.latency_ms = Some(result.latency_ms);
        metric.jitter_ms = result.jitter_ms;
        metric.download_bandwidth_bps = Some(mbps_to_bps(result.download_mbps));
        metric.upload_bandwidth_bps = Some(mbps_to_bps(result.upload_mbps));
        metric.server_location = result.server_location.clone();
        metric.isp = result.isp.clone();
        metric.external_ip = result.external_ip.clone();
        metric.internal_ip = result.internal_ip.clone();
        metric
    }
}

pub fn mbps_to_bps(mbps: f64) -> i64 {
    (mbps * BPS_PER_MBPS).round() as i64
}
