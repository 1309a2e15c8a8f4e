//! Linkwatch data model
//!
//! Shared definitions for the monitoring agent and the API server: the metric
//! rows written to the time-series store, probe and throughput results, the
//! monitor statistics and the error taxonomy used at every boundary.

pub mod constants;
pub mod error;
pub mod metric;
pub mod range;
pub mod stats;

pub use constants::*;
pub use error::{DbError, ProbeError, ThroughputError, TriggerError};
pub use metric::{ConnectivityStatus, Metric, MetricSource, ProbeResult, ThroughputResult};
pub use range::TimeRange;
pub use stats::MonitorStats;
