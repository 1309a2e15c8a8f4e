//! SQLite storage backend
//!
//! Single-file store for hosts without a time-series database. Both channels
//! share one connection; rows are inserted as they arrive.

use super::{
    Column, DisconnectReporter, IngestChannel, IngestRow, QueryChannel, Row, StoreConnector,
    StoreError, StoreHandle, Value, format_timestamp,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::types::{Value as SqlValue, ValueRef};
use std::sync::Arc;
use tracing::{debug, info};

type Shared = Arc<Mutex<Option<Connection>>>;

pub struct SqliteConnector {
    path: String,
    table: String,
}

impl SqliteConnector {
    pub fn new(path: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            table: table.into(),
        }
    }
}

#[async_trait]
impl StoreConnector for SqliteConnector {
    async fn connect(&self, _reporter: DisconnectReporter) -> Result<StoreHandle, StoreError> {
        if !is_identifier(&self.table) {
            return Err(StoreError::Rejected(format!(
                "invalid table name: {}",
                self.table
            )));
        }

        let path = self.path.clone();
        let table = self.table.clone();
        let conn = tokio::task::spawn_blocking(move || open(&path, &table))
            .await
            .map_err(|e| StoreError::Rejected(format!("sqlite open task failed: {}", e)))??;

        let shared: Shared = Arc::new(Mutex::new(Some(conn)));
        Ok(StoreHandle {
            ingest: Box::new(SqliteIngest(shared.clone())),
            query: Box::new(SqliteQuery(shared)),
        })
    }

    fn describe(&self) -> String {
        format!("sqlite {}", self.path)
    }
}

fn open(path: &str, table: &str) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;

    if path != ":memory:" {
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    conn.pragma_update(None, "busy_timeout", "5000")?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                timestamp TEXT NOT NULL,
                source TEXT NOT NULL,
                host TEXT,
                latency_ms REAL,
                jitter_ms REAL,
                packet_loss REAL,
                connectivity_status TEXT,
                download_bandwidth INTEGER,
                upload_bandwidth INTEGER,
                server_location TEXT,
                isp TEXT,
                external_ip TEXT,
                internal_ip TEXT
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{table}_timestamp ON {table}(timestamp)"),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{table}_source ON {table}(source, host)"),
        [],
    )?;

    info!("Opened sqlite store at {}", path);
    Ok(conn)
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Run `f` against the shared connection on the blocking pool.
async fn with_conn<T, F>(shared: &Shared, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
{
    let shared = shared.clone();
    tokio::task::spawn_blocking(move || {
        let guard = shared.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        f(conn)
    })
    .await
    .map_err(|e| StoreError::Rejected(format!("sqlite task failed: {}", e)))?
}

struct SqliteIngest(Shared);

#[async_trait]
impl IngestChannel for SqliteIngest {
    async fn append(&self, row: IngestRow) -> Result<(), StoreError> {
        if !is_identifier(&row.table)
            || row.columns.iter().any(|(name, _)| !is_identifier(name))
        {
            return Err(StoreError::Rejected(format!(
                "invalid identifier in row for {}",
                row.table
            )));
        }

        with_conn(&self.0, move |conn| {
            let mut names = vec!["timestamp".to_string()];
            let mut values = vec![SqlValue::Text(format_timestamp(row.timestamp()))];
            for (name, column) in row.columns {
                names.push(name);
                values.push(match column {
                    Column::Symbol(s) | Column::Str(s) => SqlValue::Text(s),
                    Column::Float(v) => SqlValue::Real(v),
                    Column::Int(v) => SqlValue::Integer(v),
                });
            }
            let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                row.table,
                names.join(", "),
                placeholders.join(", ")
            );
            conn.execute(&sql, rusqlite::params_from_iter(values))?;
            Ok(())
        })
        .await
    }

    async fn flush(&self) -> Result<(), StoreError> {
        if self.0.lock().is_none() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if let Some(conn) = self.0.lock().take() {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
            debug!("sqlite connection closed");
        }
        Ok(())
    }
}

struct SqliteQuery(Shared);

#[async_trait]
impl QueryChannel for SqliteQuery {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, StoreError> {
        let sql = sql.to_string();
        with_conn(&self.0, move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut record = Row::new();
                for (i, name) in names.iter().enumerate() {
                    record.insert(name.clone(), to_value(row.get_ref(i)?));
                }
                out.push(record);
            }
            Ok(out)
        })
        .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.0.lock().take();
        Ok(())
    }
}

fn to_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Float(v),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    async fn handle() -> StoreHandle {
        SqliteConnector::new(":memory:", "network_metrics")
            .connect(DisconnectReporter::detached())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_liveness_query() {
        let store = handle().await;
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_select() {
        let store = handle().await;
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let row = IngestRow::new("network_metrics", ts)
            .symbol("source", Some("probe"))
            .symbol("host", Some("8.8.8.8"))
            .float("latency_ms", Some(15.5))
            .int("download_bandwidth", None);
        store.ingest.append(row).await.unwrap();

        let rows = store
            .query
            .query("SELECT timestamp, host, latency_ms, download_bandwidth FROM network_metrics")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["timestamp"], Value::Text("2024-05-01T10:00:00.000000Z".into()));
        assert_eq!(rows[0]["host"], Value::Text("8.8.8.8".into()));
        assert_eq!(rows[0]["latency_ms"], Value::Float(15.5));
        assert_eq!(rows[0]["download_bandwidth"], Value::Null);
    }

    #[tokio::test]
    async fn test_rejects_bad_identifiers() {
        let err = SqliteConnector::new(":memory:", "metrics; DROP")
            .connect(DisconnectReporter::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));

        let store = handle().await;
        let row = IngestRow::new("network_metrics", Utc::now()).float("bad name", Some(1.0));
        assert!(store.ingest.append(row).await.is_err());
    }

    #[tokio::test]
    async fn test_use_after_shutdown_is_closed() {
        let store = handle().await;
        store.shutdown().await.unwrap();
        let err = store.query.query("SELECT 1").await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
        assert!(crate::storage::is_connection_error(&err.to_string()));
    }

    #[tokio::test]
    async fn test_bad_sql_is_a_data_error() {
        let store = handle().await;
        let err = store.query.query("SELEC nonsense").await.unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }
}
