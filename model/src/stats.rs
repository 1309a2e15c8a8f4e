//! Monitor statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cumulative counters of the monitoring scheduler, as seen by readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStats {
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_ms: u64,
    pub last_probe_time: Option<DateTime<Utc>>,
    pub last_throughput_time: Option<DateTime<Utc>>,
    pub successful_probes: u64,
    pub failed_probes: u64,
    pub successful_throughput_tests: u64,
    pub failed_throughput_tests: u64,
}

impl MonitorStats {
    pub fn total_probes(&self) -> u64 {
        self.successful_probes + self.failed_probes
    }
}
