//! QuestDB storage backend
//!
//! Rows are encoded as InfluxDB line protocol and shipped either over HTTP
//! (`/write`) or a raw TCP socket. Queries go through the `/exec` REST
//! endpoint and come back as a column list plus a dataset.

use super::{
    Column, DisconnectReporter, IngestChannel, IngestRow, QueryChannel, Row, StoreConnector,
    StoreError, StoreHandle, Value,
};
use crate::config::{IngestProtocol, StoreConfig};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct QuestDbConnector {
    host: String,
    http_port: u16,
    protocol: IngestProtocol,
    ilp_port: u16,
    auto_flush_rows: usize,
    auto_flush_interval: Duration,
    request_timeout: Duration,
    retry_timeout: Duration,
}

impl QuestDbConnector {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            host: config.host.clone(),
            http_port: config.port,
            protocol: config.protocol,
            ilp_port: config.ilp_port,
            auto_flush_rows: config.auto_flush_rows.max(1),
            auto_flush_interval: Duration::from_millis(config.auto_flush_interval_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            retry_timeout: Duration::from_millis(config.retry_timeout_ms),
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.http_port)
    }
}

#[async_trait]
impl StoreConnector for QuestDbConnector {
    async fn connect(&self, reporter: DisconnectReporter) -> Result<StoreHandle, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .connect_timeout(self.request_timeout)
            .build()?;

        let flush = FlushPolicy {
            rows: self.auto_flush_rows,
            interval: self.auto_flush_interval,
        };

        let ingest: Box<dyn IngestChannel> = match self.protocol {
            IngestProtocol::Http => Box::new(HttpIngest {
                client: client.clone(),
                url: format!("{}/write", self.base_url()),
                retry_timeout: self.retry_timeout,
                buffer: Mutex::new(IlpBuffer::new(flush)),
                closed: AtomicBool::new(false),
            }),
            IngestProtocol::Tcp => {
                let addr = format!("{}:{}", self.host, self.ilp_port);
                Box::new(TcpIngest::connect(&addr, flush, reporter).await?)
            }
        };

        let query = Box::new(HttpQuery {
            client,
            url: format!("{}/exec", self.base_url()),
            closed: AtomicBool::new(false),
        });

        Ok(StoreHandle { ingest, query })
    }

    fn describe(&self) -> String {
        match self.protocol {
            IngestProtocol::Http => format!("questdb {}", self.base_url()),
            IngestProtocol::Tcp => format!(
                "questdb {} (ilp tcp :{})",
                self.base_url(),
                self.ilp_port
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FlushPolicy {
    rows: usize,
    interval: Duration,
}

/// Pending ILP lines plus the bookkeeping for auto-flush
struct IlpBuffer {
    text: String,
    rows: usize,
    last_flush: Instant,
    policy: FlushPolicy,
}

impl IlpBuffer {
    fn new(policy: FlushPolicy) -> Self {
        Self {
            text: String::new(),
            rows: 0,
            last_flush: Instant::now(),
            policy,
        }
    }

    fn push(&mut self, row: &IngestRow) {
        encode_line(&mut self.text, row);
        self.rows += 1;
    }

    fn should_flush(&self) -> bool {
        self.rows >= self.policy.rows || self.last_flush.elapsed() >= self.policy.interval
    }

    fn take(&mut self) -> Option<String> {
        self.last_flush = Instant::now();
        if self.rows == 0 {
            return None;
        }
        self.rows = 0;
        Some(std::mem::take(&mut self.text))
    }

    /// Put a batch back after a failed send so it goes out with the next flush.
    fn restore(&mut self, batch: String, rows: usize) {
        let mut text = batch;
        text.push_str(&self.text);
        self.text = text;
        self.rows += rows;
    }
}

struct HttpIngest {
    client: reqwest::Client,
    url: String,
    retry_timeout: Duration,
    buffer: Mutex<IlpBuffer>,
    closed: AtomicBool,
}

impl HttpIngest {
    async fn send(&self, body: &str) -> Result<(), StoreError> {
        let started = Instant::now();
        let mut backoff = Duration::from_millis(10);
        loop {
            let result = self.client.post(&self.url).body(body.to_string()).send().await;
            match result {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if !resp.status().is_server_error() => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(StoreError::Rejected(format!(
                        "ingest rejected ({}): {}",
                        status,
                        ilp_error_message(&text)
                    )));
                }
                Ok(resp) => {
                    if started.elapsed() + backoff > self.retry_timeout {
                        let status = resp.status();
                        let text = resp.text().await.unwrap_or_default();
                        return Err(StoreError::Rejected(format!(
                            "ingest failed ({}): {}",
                            status,
                            ilp_error_message(&text)
                        )));
                    }
                }
                Err(e) => {
                    if started.elapsed() + backoff > self.retry_timeout {
                        return Err(e.into());
                    }
                    debug!("Retrying ILP write after error: {}", e);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
    }

    async fn flush_locked(&self, buffer: &mut IlpBuffer) -> Result<(), StoreError> {
        let rows = buffer.rows;
        if let Some(batch) = buffer.take() {
            if let Err(e) = self.send(&batch).await {
                // Rejected batches are dropped; transport failures keep them.
                if !matches!(e, StoreError::Rejected(_)) {
                    buffer.restore(batch, rows);
                }
                return Err(e);
            }
            debug!("Flushed {} rows over ILP/HTTP", rows);
        }
        Ok(())
    }
}

#[async_trait]
impl IngestChannel for HttpIngest {
    async fn append(&self, row: IngestRow) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let mut buffer = self.buffer.lock().await;
        buffer.push(&row);
        if buffer.should_flush() {
            self.flush_locked(&mut buffer).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer).await
    }
}

/// ILP over a plain socket. The server never answers; it closes the socket
/// on a bad line, which the reader task reports as a disconnect.
struct TcpIngest {
    writer: Mutex<Option<OwnedWriteHalf>>,
    buffer: Mutex<IlpBuffer>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    reporter: DisconnectReporter,
}

impl TcpIngest {
    async fn connect(
        addr: &str,
        policy: FlushPolicy,
        reporter: DisconnectReporter,
    ) -> Result<Self, StoreError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut read_half, write_half) = stream.into_split();

        let watch = reporter.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        watch.report("ILP socket closed by server");
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        watch.report(format!("ILP socket error: {}", e));
                        return;
                    }
                }
            }
        });

        Ok(Self {
            writer: Mutex::new(Some(write_half)),
            buffer: Mutex::new(IlpBuffer::new(policy)),
            reader: parking_lot::Mutex::new(Some(reader)),
            reporter,
        })
    }

    async fn flush_locked(&self, buffer: &mut IlpBuffer) -> Result<(), StoreError> {
        let rows = buffer.rows;
        let Some(batch) = buffer.take() else {
            return Ok(());
        };
        let mut writer = self.writer.lock().await;
        let Some(socket) = writer.as_mut() else {
            buffer.restore(batch, rows);
            return Err(StoreError::Closed);
        };
        if let Err(e) = socket.write_all(batch.as_bytes()).await {
            buffer.restore(batch, rows);
            self.reporter.report(format!("ILP socket error: {}", e));
            return Err(e.into());
        }
        debug!("Flushed {} rows over ILP/TCP", rows);
        Ok(())
    }
}

#[async_trait]
impl IngestChannel for TcpIngest {
    async fn append(&self, row: IngestRow) -> Result<(), StoreError> {
        let mut buffer = self.buffer.lock().await;
        buffer.push(&row);
        if buffer.should_flush() {
            self.flush_locked(&mut buffer).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let flushed = {
            let mut buffer = self.buffer.lock().await;
            self.flush_locked(&mut buffer).await
        };
        if let Some(mut socket) = self.writer.lock().await.take() {
            if let Err(e) = socket.shutdown().await {
                warn!("Error shutting down ILP socket: {}", e);
            }
        }
        flushed
    }
}

impl Drop for TcpIngest {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

struct HttpQuery {
    client: reqwest::Client,
    url: String,
    closed: AtomicBool,
}

#[derive(Debug, Deserialize)]
struct ExecColumn {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    #[serde(default)]
    columns: Vec<ExecColumn>,
    #[serde(default)]
    dataset: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl QueryChannel for HttpQuery {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let resp = self
            .client
            .get(&self.url)
            .query(&[("query", sql)])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        parse_exec_response(status, &body)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn parse_exec_response(status: reqwest::StatusCode, body: &str) -> Result<Vec<Row>, StoreError> {
    let parsed: ExecResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) if status.is_success() => {
            return Err(StoreError::Rejected(format!("malformed query response: {}", e)));
        }
        Err(_) => {
            return Err(StoreError::Rejected(format!("query failed ({}): {}", status, body)));
        }
    };

    if let Some(error) = parsed.error {
        return Err(StoreError::Rejected(error));
    }
    if !status.is_success() {
        return Err(StoreError::Rejected(format!("query failed ({})", status)));
    }

    Ok(parsed
        .dataset
        .into_iter()
        .map(|record| {
            parsed
                .columns
                .iter()
                .zip(record)
                .map(|(column, value)| (column.name.clone(), json_value(value)))
                .collect()
        })
        .collect())
}

fn json_value(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
        },
        serde_json::Value::String(s) => Value::Text(s),
        other => Value::Text(other.to_string()),
    }
}

/// QuestDB answers ILP/HTTP errors with a JSON body carrying `message`.
fn ilp_error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct IlpError {
        message: String,
    }
    serde_json::from_str::<IlpError>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

/// Append one ILP line: `table,symbols fields timestamp\n`
fn encode_line(out: &mut String, row: &IngestRow) {
    escape_into(out, &row.table, &[',', ' ']);

    for (name, column) in &row.columns {
        if let Column::Symbol(value) = column {
            out.push(',');
            escape_into(out, name, &[',', '=', ' ']);
            out.push('=');
            escape_into(out, value, &[',', '=', ' ']);
        }
    }

    let mut first = true;
    for (name, column) in &row.columns {
        let rendered = match column {
            Column::Symbol(_) => continue,
            Column::Str(s) => {
                let mut quoted = String::from("\"");
                escape_into(&mut quoted, s, &['"']);
                quoted.push('"');
                quoted
            }
            Column::Float(v) => format_float(*v),
            Column::Int(v) => format!("{}i", v),
        };
        out.push(if first { ' ' } else { ',' });
        first = false;
        escape_into(out, name, &[',', '=', ' ']);
        out.push('=');
        out.push_str(&rendered);
    }

    let _ = write!(out, " {}", row.timestamp_ns);
    out.push('\n');
}

fn escape_into(out: &mut String, raw: &str, special: &[char]) {
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if special.contains(&c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        format!("{:?}", v)
    }
}

#[cfg(test)]
fn encode(row: &IngestRow) -> String {
    let mut out = String::new();
    encode_line(&mut out, row);
    out
}
