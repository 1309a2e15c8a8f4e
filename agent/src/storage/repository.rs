//! Typed read/write access to the metrics table
//!
//! Every backend failure is classified exactly once here: a lost connection
//! marks the manager disconnected and surfaces as `Unavailable`, anything
//! else surfaces as the typed write/query error and leaves the connection alone.

use super::{
    ConnectionManager, IngestRow, Row, StoreError, Value, format_timestamp, is_connection_error,
    parse_timestamp, quote_literal,
};
use crate::analysis::{ConnectivityBucket, Granularity, aggregate_connectivity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use linkwatch_model::{ConnectivityStatus, DbError, Metric, MetricSource, TimeRange};
use serde::Serialize;
use tracing::{debug, warn};

const METRIC_COLUMNS: &str = "timestamp, source, host, latency_ms, jitter_ms, packet_loss, \
     connectivity_status, download_bandwidth, upload_bandwidth, server_location, isp, \
     external_ip, internal_ip";

/// Anything that accepts metric rows
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn write_metric(&self, metric: &Metric) -> Result<(), DbError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricFilter {
    pub source: Option<MetricSource>,
    pub host: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    pub connected: bool,
    pub uptime_seconds: i64,
}

pub struct MetricsRepository {
    connection: ConnectionManager,
    table: String,
}

impl MetricsRepository {
    pub fn new(connection: ConnectionManager, table: impl Into<String>) -> Self {
        Self {
            connection,
            table: table.into(),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub async fn query_metrics(
        &self,
        range: TimeRange,
        filter: &MetricFilter,
    ) -> Result<Vec<Metric>, DbError> {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {}",
            METRIC_COLUMNS,
            self.table,
            range_predicate(range)
        );
        if let Some(source) = filter.source {
            sql.push_str(&format!(" AND source = {}", quote_literal(source.as_str())));
        }
        if let Some(host) = &filter.host {
            sql.push_str(&format!(" AND host = {}", quote_literal(host)));
        }
        sql.push_str(" ORDER BY timestamp");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let rows = self.query(&sql).await?;
        let mut metrics = Vec::with_capacity(rows.len());
        for row in &rows {
            match row_to_metric(row) {
                Ok(metric) => metrics.push(metric),
                Err(e) => warn!("Skipping malformed metric row: {}", e),
            }
        }
        Ok(metrics)
    }

    pub async fn query_probe_history(
        &self,
        range: TimeRange,
        host: Option<String>,
    ) -> Result<Vec<Metric>, DbError> {
        let filter = MetricFilter {
            source: Some(MetricSource::Probe),
            host,
            limit: None,
        };
        self.query_metrics(range, &filter).await
    }

    pub async fn query_throughput_history(&self, range: TimeRange) -> Result<Vec<Metric>, DbError> {
        let filter = MetricFilter {
            source: Some(MetricSource::Throughput),
            ..MetricFilter::default()
        };
        self.query_metrics(range, &filter).await
    }

    pub async fn query_connectivity_status(
        &self,
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<ConnectivityBucket>, DbError> {
        let sql = format!(
            "SELECT timestamp, connectivity_status FROM {} WHERE {} AND source = {} ORDER BY timestamp",
            self.table,
            range_predicate(range),
            quote_literal(MetricSource::Probe.as_str())
        );

        let rows = self.query(&sql).await?;
        let samples: Vec<(DateTime<Utc>, ConnectivityStatus)> = rows
            .iter()
            .filter_map(|row| {
                let t = row.get("timestamp").and_then(value_timestamp)?;
                let status = row
                    .get("connectivity_status")
                    .and_then(Value::as_str)?
                    .parse()
                    .ok()?;
                Some((t, status))
            })
            .collect();

        debug!(
            "Aggregating {} connectivity samples into {} buckets",
            samples.len(),
            granularity
        );
        Ok(aggregate_connectivity(&samples, granularity))
    }

    /// Healthy only if connected and a verification round-trip succeeds.
    pub async fn health(&self) -> Result<StoreHealth, DbError> {
        let state = self.connection.get_state();
        let handle = state.connection.clone().ok_or_else(|| {
            DbError::Unavailable(
                state
                    .last_error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "no active connection".to_string()),
            )
        })?;

        match handle.ping().await {
            Ok(()) => Ok(StoreHealth {
                connected: true,
                uptime_seconds: state.uptime_seconds().unwrap_or(0),
            }),
            Err(e) => Err(self.classify(e, DbError::Connection).await),
        }
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>, DbError> {
        let handle = self.connection.get_connection()?;
        match handle.query.query(sql).await {
            Ok(rows) => Ok(rows),
            Err(e) => Err(self.classify(e, DbError::Query).await),
        }
    }

    async fn classify(&self, err: StoreError, data_error: fn(String) -> DbError) -> DbError {
        let message = err.to_string();
        if is_connection_error(&message) {
            self.connection.mark_disconnected(&message).await;
            DbError::Unavailable(message)
        } else {
            data_error(message)
        }
    }

    fn to_row(&self, metric: &Metric) -> IngestRow {
        IngestRow::new(self.table.as_str(), metric.timestamp)
            .symbol("source", Some(metric.source.as_str()))
            .symbol("host", metric.host.as_deref())
            .symbol(
                "connectivity_status",
                metric.connectivity_status.map(|s| s.as_str()),
            )
            .symbol("server_location", metric.server_location.as_deref())
            .symbol("isp", metric.isp.as_deref())
            .float("latency_ms", metric.latency_ms)
            .float("jitter_ms", metric.jitter_ms)
            .float("packet_loss", metric.packet_loss_pct)
            .int("download_bandwidth", metric.download_bandwidth_bps)
            .int("upload_bandwidth", metric.upload_bandwidth_bps)
            .string("external_ip", metric.external_ip.as_deref())
            .string("internal_ip", metric.internal_ip.as_deref())
    }
}

#[async_trait]
impl MetricSink for MetricsRepository {
    async fn write_metric(&self, metric: &Metric) -> Result<(), DbError> {
        let handle = self.connection.get_connection()?;
        match handle.ingest.append(self.to_row(metric)).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.classify(e, DbError::Write).await),
        }
    }
}

fn range_predicate(range: TimeRange) -> String {
    format!(
        "timestamp >= {} AND timestamp <= {}",
        quote_literal(&format_timestamp(range.start)),
        quote_literal(&format_timestamp(range.end))
    )
}

fn value_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Text(raw) => parse_timestamp(raw),
        // Epoch microseconds, as some backends return designated timestamps
        Value::Int(micros) => DateTime::from_timestamp_micros(*micros),
        _ => None,
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    row.get(column).and_then(Value::as_str).map(str::to_string)
}

fn float(row: &Row, column: &str) -> Option<f64> {
    row.get(column).and_then(Value::as_f64)
}

fn int(row: &Row, column: &str) -> Option<i64> {
    row.get(column).and_then(Value::as_i64)
}

fn row_to_metric(row: &Row) -> Result<Metric, String> {
    let timestamp = row
        .get("timestamp")
        .and_then(value_timestamp)
        .ok_or("missing or invalid timestamp")?;
    let source: MetricSource = text(row, "source").ok_or("missing source")?.parse()?;

    let mut metric = Metric::new(timestamp, source);
    metric.host = text(row, "host");
    metric.latency_ms = float(row, "latency_ms");
    metric.jitter_ms = float(row, "jitter_ms");
    metric.packet_loss_pct = float(row, "packet_loss");
    metric.connectivity_status = text(row, "connectivity_status").and_then(|s| s.parse().ok());
    metric.download_bandwidth_bps = int(row, "download_bandwidth");
    metric.upload_bandwidth_bps = int(row, "upload_bandwidth");
    metric.server_location = text(row, "server_location");
    metric.isp = text(row, "isp");
    metric.external_ip = text(row, "external_ip");
    metric.internal_ip = text(row, "internal_ip");
    Ok(metric)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fake::{FakeConnector, FakeStore};
    use crate::storage::sqlite::SqliteConnector;
    use crate::storage::{ConnectionSettings, StoreConnector};
    use chrono::{Duration, TimeZone};
    use linkwatch_model::{ProbeError, ProbeResult, ThroughputResult};
    use std::sync::Arc;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: std::time::Duration::from_secs(1),
            reconnect_interval: std::time::Duration::from_secs(5),
            health_check_interval: std::time::Duration::from_secs(30),
            health_check_timeout: std::time::Duration::from_secs(1),
            restart_backoff: std::time::Duration::from_secs(1),
        }
    }

    async fn connected(connector: Arc<dyn StoreConnector>) -> MetricsRepository {
        let manager = ConnectionManager::new(connector, settings());
        manager.connect_once().await.unwrap();
        MetricsRepository::new(manager, "network_metrics")
    }

    fn sqlite() -> Arc<dyn StoreConnector> {
        Arc::new(SqliteConnector::new(":memory:", "network_metrics"))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn around_t0() -> TimeRange {
        TimeRange::new(t0() - Duration::hours(1), t0() + Duration::hours(3))
    }

    #[tokio::test]
    async fn test_round_trip_preserves_absent_fields() {
        let repo = connected(sqlite()).await;
        let bare = Metric::new(t0(), MetricSource::Probe);
        repo.write_metric(&bare).await.unwrap();

        let metrics = repo.query_metrics(around_t0(), &MetricFilter::default()).await.unwrap();
        assert_eq!(metrics, vec![bare]);
    }

    #[tokio::test]
    async fn test_round_trip_probe_and_throughput() {
        let repo = connected(sqlite()).await;

        let up = Metric::from_probe(
            &ProbeResult {
                host: "8.8.8.8".into(),
                reachable: true,
                latency_ms: Some(15.5),
                packet_loss_pct: Some(0.0),
                jitter_ms: Some(1.25),
                stddev_ms: Some(0.5),
            },
            t0(),
        );
        let down = Metric::probe_down(
            &ProbeError::HostUnreachable { host: "1.1.1.1".into() },
            t0() + Duration::seconds(1),
        );
        let speed = Metric::from_throughput(&ThroughputResult {
            timestamp: t0() + Duration::minutes(5),
            download_mbps: 250.5,
            upload_mbps: 40.0,
            latency_ms: 9.0,
            jitter_ms: Some(0.7),
            server_location: Some("Frankfurt".into()),
            isp: Some("Example ISP".into()),
            external_ip: Some("203.0.113.7".into()),
            internal_ip: None,
        });

        for metric in [&up, &down, &speed] {
            repo.write_metric(metric).await.unwrap();
        }

        let probes = repo.query_probe_history(around_t0(), None).await.unwrap();
        assert_eq!(probes, vec![up.clone(), down.clone()]);

        let only_google = repo
            .query_probe_history(around_t0(), Some("8.8.8.8".into()))
            .await
            .unwrap();
        assert_eq!(only_google, vec![up]);

        let history = repo.query_throughput_history(around_t0()).await.unwrap();
        assert_eq!(history, vec![speed]);
    }

    #[tokio::test]
    async fn test_empty_range_is_not_an_error() {
        let repo = connected(sqlite()).await;
        let range = TimeRange::new(t0(), t0() + Duration::minutes(1));
        assert!(repo.query_throughput_history(range).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connectivity_buckets_from_store() {
        let repo = connected(sqlite()).await;
        for i in 0..10 {
            let mut metric = Metric::new(t0() + Duration::minutes(i), MetricSource::Probe);
            metric.connectivity_status = Some(ConnectivityStatus::Up);
            repo.write_metric(&metric).await.unwrap();
        }
        for i in 0..10 {
            let mut metric = Metric::new(t0() + Duration::minutes(60 + i), MetricSource::Probe);
            metric.connectivity_status = Some(if i < 2 {
                ConnectivityStatus::Down
            } else {
                ConnectivityStatus::Up
            });
            repo.write_metric(&metric).await.unwrap();
        }

        let buckets = repo
            .query_connectivity_status(around_t0(), Granularity::default())
            .await
            .unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].status, ConnectivityStatus::Up);
        assert_eq!(buckets[1].status, ConnectivityStatus::Down);
        assert_eq!(buckets[1].down, 2);
    }

    #[tokio::test]
    async fn test_write_data_error_keeps_connection() {
        let store = FakeStore::new();
        let repo = connected(Arc::new(FakeConnector(store.clone()))).await;
        *store.write_error.lock() = Some("cast error: column latency_ms".into());

        let err = repo
            .write_metric(&Metric::new(t0(), MetricSource::Probe))
            .await
            .unwrap_err();
        assert_eq!(err, DbError::Write("cast error: column latency_ms".into()));
        assert!(repo.connection().get_state().is_connected());
    }

    #[tokio::test]
    async fn test_write_connection_error_marks_disconnected() {
        let store = FakeStore::new();
        let repo = connected(Arc::new(FakeConnector(store.clone()))).await;
        *store.write_error.lock() = Some("Connection reset by peer".into());

        let err = repo
            .write_metric(&Metric::new(t0(), MetricSource::Probe))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(!repo.connection().get_state().is_connected());

        let again = repo
            .write_metric(&Metric::new(t0(), MetricSource::Probe))
            .await
            .unwrap_err();
        assert_eq!(again, DbError::Unavailable("Connection reset by peer".into()));
    }

    #[tokio::test]
    async fn test_query_errors_are_classified() {
        let store = FakeStore::new();
        let repo = connected(Arc::new(FakeConnector(store.clone()))).await;

        *store.query_error.lock() = Some("unexpected token: FROM".into());
        let err = repo.query_throughput_history(around_t0()).await.unwrap_err();
        assert_eq!(err, DbError::Query("unexpected token: FROM".into()));
        assert!(repo.connection().get_state().is_connected());

        store.set_unhealthy(true);
        let err = repo.query_throughput_history(around_t0()).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(!repo.connection().get_state().is_connected());
    }

    #[tokio::test]
    async fn test_query_sql_carries_filters() {
        let store = FakeStore::new();
        let repo = connected(Arc::new(FakeConnector(store.clone()))).await;
        let filter = MetricFilter {
            source: Some(MetricSource::Probe),
            host: Some("it's".into()),
            limit: Some(5),
        };
        repo.query_metrics(around_t0(), &filter).await.unwrap();

        let sql = store.queries.lock()[0].clone();
        assert!(sql.contains("source = 'probe'"));
        assert!(sql.contains("host = 'it''s'"));
        assert!(sql.contains("timestamp >= '2024-05-01T09:00:00.000000Z'"));
        assert!(sql.ends_with("ORDER BY timestamp LIMIT 5"));
    }

    #[tokio::test]
    async fn test_health_reports_last_disconnect_reason() {
        let store = FakeStore::new();
        let repo = connected(Arc::new(FakeConnector(store.clone()))).await;

        let health = repo.health().await.unwrap();
        assert!(health.connected);

        repo.connection().mark_disconnected("health check failed: timed out").await;
        assert_eq!(
            repo.health().await.unwrap_err(),
            DbError::Unavailable("health check failed: timed out".into())
        );
    }

    #[tokio::test]
    async fn test_health_verification_failure() {
        let store = FakeStore::new();
        let repo = connected(Arc::new(FakeConnector(store.clone()))).await;
        store.set_unhealthy(true);

        assert!(repo.health().await.unwrap_err().is_unavailable());
        assert!(!repo.connection().get_state().is_connected());
    }
}
