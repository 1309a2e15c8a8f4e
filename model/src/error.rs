//! Error taxonomy
//!
//! Each boundary gets its own closed set of variants so callers match
//! exhaustively instead of sniffing messages.

use thiserror::Error;

/// Failures surfaced by the metrics repository.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// Connectivity to the store is lost; retry later, reconnect is under way.
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("Database write failed: {0}")]
    Write(String),

    #[error("Database query failed: {0}")]
    Query(String),

    /// The store answered but rejected the verification round-trip.
    #[error("Database connection check failed: {0}")]
    Connection(String),
}

impl DbError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, DbError::Unavailable(_))
    }
}

/// Failures of a single reachability probe. None of them are retried by the prober.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// DNS or socket level failure.
    #[error("Network error probing {host}: {message}")]
    Network { host: String, message: String },

    #[error("Probe of {host} timed out after {timeout_ms}ms")]
    Timeout { host: String, timeout_ms: u64 },

    /// The probe ran but the host never answered.
    #[error("Host {host} is unreachable")]
    HostUnreachable { host: String },
}

impl ProbeError {
    pub fn host(&self) -> &str {
        match self {
            ProbeError::Network { host, .. }
            | ProbeError::Timeout { host, .. }
            | ProbeError::HostUnreachable { host } => host,
        }
    }
}

/// Failures of one throughput measurement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThroughputError {
    #[error("Throughput test failed: {0}")]
    Execution(String),

    #[error("Throughput test timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Outcome of a rejected or failed guarded trigger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    /// Another test holds the single-flight guard. Not a fault.
    #[error("A throughput test is already running")]
    AlreadyRunning,

    #[error("Throughput test timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Throughput test failed: {0}")]
    ExecutionFailed(String),
}

impl TriggerError {
    /// Stable code exposed to API callers
    pub fn code(&self) -> &'static str {
        match self {
            TriggerError::AlreadyRunning => "ALREADY_RUNNING",
            TriggerError::Timeout { .. } => "TIMEOUT",
            TriggerError::ExecutionFailed(_) => "EXECUTION_FAILED",
        }
    }
}

impl From<ThroughputError> for TriggerError {
    fn from(err: ThroughputError) -> Self {
        match err {
            ThroughputError::Execution(message) => TriggerError::ExecutionFailed(message),
            ThroughputError::Timeout { timeout_ms } => TriggerError::Timeout { timeout_ms },
        }
    }
}
