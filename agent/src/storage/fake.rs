//! In-memory connector for tests

use super::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Shared knobs and observations for one fake store
#[derive(Default)]
pub(crate) struct FakeStore {
    pub connect_failures_left: AtomicU32,
    pub hang_on_connect: AtomicBool,
    /// Releases a connect held by `hang_on_connect`
    pub connect_gate: tokio::sync::Notify,
    pub unhealthy: AtomicBool,
    pub connects: AtomicU32,
    pub closed_handles: AtomicU32,
    pub rows: Mutex<Vec<IngestRow>>,
    pub write_error: Mutex<Option<String>>,
    pub query_error: Mutex<Option<String>>,
    pub query_rows: Mutex<Vec<Row>>,
    pub queries: Mutex<Vec<String>>,
    pub reporters: Mutex<Vec<DisconnectReporter>>,
    /// Teardown calls in the order they happened
    pub events: Mutex<Vec<&'static str>>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.connect_failures_left.store(n, Ordering::SeqCst);
    }

    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeConnector(pub Arc<FakeStore>);

#[async_trait]
impl StoreConnector for FakeConnector {
    async fn connect(&self, reporter: DisconnectReporter) -> Result<StoreHandle, StoreError> {
        if self.0.hang_on_connect.load(Ordering::SeqCst) {
            self.0.connect_gate.notified().await;
        }
        let left = self.0.connect_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.0.connect_failures_left.store(left - 1, Ordering::SeqCst);
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        self.0.reporters.lock().push(reporter);
        Ok(StoreHandle {
            ingest: Box::new(FakeIngest(self.0.clone())),
            query: Box::new(FakeQuery(self.0.clone())),
        })
    }

    fn describe(&self) -> String {
        "fake store".to_string()
    }
}

struct FakeIngest(Arc<FakeStore>);

#[async_trait]
impl IngestChannel for FakeIngest {
    async fn append(&self, row: IngestRow) -> Result<(), StoreError> {
        if let Some(message) = self.0.write_error.lock().clone() {
            return Err(StoreError::Rejected(message));
        }
        self.0.rows.lock().push(row);
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.0.events.lock().push("ingest flush");
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.0.events.lock().push("ingest close");
        self.0.closed_handles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeQuery(Arc<FakeStore>);

#[async_trait]
impl QueryChannel for FakeQuery {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, StoreError> {
        if self.0.unhealthy.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        if sql == LIVENESS_QUERY {
            return Ok(Vec::new());
        }
        self.0.queries.lock().push(sql.to_string());
        if let Some(message) = self.0.query_error.lock().clone() {
            return Err(StoreError::Rejected(message));
        }
        Ok(self.0.query_rows.lock().clone())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.0.events.lock().push("query close");
        Ok(())
    }
}

/// Metric sink that keeps what it is given
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub written: Mutex<Vec<linkwatch_model::Metric>>,
    pub fail_with: Mutex<Option<linkwatch_model::DbError>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl super::MetricSink for RecordingSink {
    async fn write_metric(
        &self,
        metric: &linkwatch_model::Metric,
    ) -> Result<(), linkwatch_model::DbError> {
        if let Some(err) = self.fail_with.lock().clone() {
            return Err(err);
        }
        self.written.lock().push(metric.clone());
        Ok(())
    }
}
