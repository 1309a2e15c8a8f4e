//! Time-series store access
//!
//! The store is reached through two logical channels: an append-only
//! ingestion channel and a request/response query channel. Backends
//! implement [`StoreConnector`]; everything above it only sees the traits.

mod classify;
mod connection;
#[cfg(test)]
pub(crate) mod fake;
pub mod questdb;
mod repository;
pub mod sqlite;

pub use classify::is_connection_error;
pub use connection::{ConnectionManager, ConnectionSettings, ConnectionState, LastError};
pub use repository::{MetricFilter, MetricSink, MetricsRepository, StoreHealth};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Raw failure reported by a backend, before classification.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The backend answered and refused the request.
    #[error("{0}")]
    Rejected(String),

    #[error("no active connection")]
    Closed,
}

/// A typed column value on the ingestion path
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Symbol(String),
    Str(String),
    Float(f64),
    Int(i64),
}

/// One row for the ingestion channel
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRow {
    pub table: String,
    pub columns: Vec<(String, Column)>,
    pub timestamp_ns: i64,
}

impl IngestRow {
    pub fn new(table: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            timestamp_ns: timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX),
        }
    }

    pub fn symbol(mut self, name: &str, value: Option<&str>) -> Self {
        if let Some(v) = value {
            self.columns.push((name.to_string(), Column::Symbol(v.to_string())));
        }
        self
    }

    pub fn string(mut self, name: &str, value: Option<&str>) -> Self {
        if let Some(v) = value {
            self.columns.push((name.to_string(), Column::Str(v.to_string())));
        }
        self
    }

    pub fn float(mut self, name: &str, value: Option<f64>) -> Self {
        if let Some(v) = value {
            self.columns.push((name.to_string(), Column::Float(v)));
        }
        self
    }

    pub fn int(mut self, name: &str, value: Option<i64>) -> Self {
        if let Some(v) = value {
            self.columns.push((name.to_string(), Column::Int(v)));
        }
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.timestamp_ns)
    }
}

/// A value on the query path
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(v.round() as i64),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One result row, keyed by column name
pub type Row = BTreeMap<String, Value>;

#[async_trait]
pub trait IngestChannel: Send + Sync {
    /// Buffer a row; the channel flushes on its own thresholds.
    async fn append(&self, row: IngestRow) -> Result<(), StoreError>;

    async fn flush(&self) -> Result<(), StoreError>;

    /// Flush what is pending and release the transport.
    async fn close(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait QueryChannel: Send + Sync {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

/// Both channels of one live connection
pub struct StoreHandle {
    pub ingest: Box<dyn IngestChannel>,
    pub query: Box<dyn QueryChannel>,
}

impl StoreHandle {
    /// Trivial round-trip used for connect verification and health polling
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.query.query(LIVENESS_QUERY).await.map(|_| ())
    }

    /// Flush then close ingestion, then close the query channel.
    /// Every step runs even when an earlier one failed; the first error is returned.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let flushed = self.ingest.flush().await;
        let ingest_closed = self.ingest.close().await;
        let query_closed = self.query.close().await;
        flushed.and(ingest_closed).and(query_closed)
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle").finish_non_exhaustive()
    }
}

pub const LIVENESS_QUERY: &str = "SELECT 1";

/// Lets a channel report a transport failure it noticed on its own.
///
/// Reports carry the connection generation so a late report from a torn
/// down connection cannot disconnect its replacement.
#[derive(Debug, Clone)]
pub struct DisconnectReporter {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, String)>,
}

impl DisconnectReporter {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, String)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn report(&self, reason: impl Into<String>) {
        // The manager may already be gone during shutdown.
        let _ = self.tx.send((self.generation, reason.into()));
    }

    /// A reporter wired to nothing, for one-off connections outside a manager
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { generation: 0, tx }
    }
}

#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Open both channels. Verification is done by the caller.
    async fn connect(&self, reporter: DisconnectReporter) -> Result<StoreHandle, StoreError>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Fixed-width UTC text form used for timestamps in SQL literals and the
/// sqlite schema; lexical order matches time order.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Quote a string literal for SQL
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ingest_row_skips_absent_columns() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let row = IngestRow::new("network_metrics", ts)
            .symbol("source", Some("probe"))
            .symbol("host", None)
            .float("latency_ms", Some(15.5))
            .int("download_bandwidth", None);

        assert_eq!(row.columns.len(), 2);
        assert_eq!(row.timestamp(), ts);
    }

    #[test]
    fn test_timestamp_text_is_fixed_width_and_ordered() {
        let a = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        let (fa, fb) = (format_timestamp(a), format_timestamp(b));
        assert_eq!(fa, "2024-05-01T09:00:00.000000Z");
        assert_eq!(fa.len(), fb.len());
        assert!(fa < fb);
        assert_eq!(parse_timestamp(&fb), Some(b));
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("8.8.8.8"), "'8.8.8.8'");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::Int(3).as_f64(), Some(3.0));
        assert_eq!(Value::Float(2.6).as_i64(), Some(3));
        assert_eq!(Value::Text("42".into()).as_i64(), Some(42));
        assert_eq!(Value::Null.as_str(), None);
    }
}
