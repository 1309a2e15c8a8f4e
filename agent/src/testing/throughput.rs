//! Throughput tests against an HTTP speed-test endpoint

use crate::config::ThroughputConfig;
use crate::network_monitor::{detect_local_ip, get_public_ip};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use linkwatch_model::{ThroughputError, ThroughputResult};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One external bandwidth measurement
#[async_trait]
pub trait SpeedTestBackend: Send + Sync {
    async fn measure(&self) -> Result<ThroughputResult>;
}

/// Bounds a backend measurement with a wall-clock timeout.
pub struct ThroughputTester {
    backend: Arc<dyn SpeedTestBackend>,
    timeout: Duration,
}

impl ThroughputTester {
    pub fn new(backend: Arc<dyn SpeedTestBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// The in-flight measurement is dropped when the timeout fires.
    pub async fn run_test(&self) -> Result<ThroughputResult, ThroughputError> {
        match tokio::time::timeout(self.timeout, self.backend.measure()).await {
            Ok(Ok(result)) => {
                info!(
                    "Throughput test: {:.2} Mbps down, {:.2} Mbps up, {:.1}ms latency",
                    result.download_mbps, result.upload_mbps, result.latency_ms
                );
                Ok(result)
            }
            Ok(Err(e)) => Err(ThroughputError::Execution(format!("{:#}", e))),
            Err(_) => Err(ThroughputError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

/// Cloudflare-style speed test: `/__down?bytes=N`, `/__up` and `/meta`
pub struct HttpSpeedTest {
    client: reqwest::Client,
    endpoint: String,
    download_bytes: u64,
    upload_bytes: u64,
    latency_samples: u32,
    public_ip_service: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Meta {
    client_ip: Option<String>,
    as_organization: Option<String>,
    colo: Option<String>,
    city: Option<String>,
}

impl Meta {
    fn server_location(&self) -> Option<String> {
        match (&self.city, &self.colo) {
            (Some(city), Some(colo)) => Some(format!("{} ({})", city, colo)),
            (Some(only), None) | (None, Some(only)) => Some(only.clone()),
            (None, None) => None,
        }
    }
}

impl HttpSpeedTest {
    pub fn from_config(config: &ThroughputConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("linkwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            download_bytes: config.download_bytes,
            upload_bytes: config.upload_bytes,
            latency_samples: config.latency_samples.max(1),
            public_ip_service: config.public_ip_service.clone(),
        })
    }

    async fn meta(&self) -> Result<Meta> {
        let meta = self
            .client
            .get(format!("{}/meta", self.endpoint))
            .send()
            .await?
            .error_for_status()?
            .json::<Meta>()
            .await?;
        Ok(meta)
    }

    /// Mean round-trip of empty downloads, and jitter between them.
    async fn idle_latency(&self) -> Result<(f64, Option<f64>)> {
        let mut samples = Vec::with_capacity(self.latency_samples as usize);
        for _ in 0..self.latency_samples {
            let started = Instant::now();
            self.client
                .get(format!("{}/__down?bytes=0", self.endpoint))
                .send()
                .await
                .context("Latency request failed")?
                .error_for_status()?
                .bytes()
                .await?;
            samples.push(started.elapsed().as_secs_f64() * 1000.0);
        }
        Ok(latency_stats(&samples))
    }

    async fn download(&self) -> Result<f64> {
        let started = Instant::now();
        let mut response = self
            .client
            .get(format!("{}/__down?bytes={}", self.endpoint, self.download_bytes))
            .send()
            .await
            .context("Download request failed")?
            .error_for_status()?;

        let mut received = 0u64;
        while let Some(chunk) = response.chunk().await.context("Download interrupted")? {
            received += chunk.len() as u64;
        }
        debug!("Downloaded {} bytes in {:?}", received, started.elapsed());
        Ok(mbps(received, started.elapsed()))
    }

    async fn upload(&self) -> Result<f64> {
        let body = vec![0u8; self.upload_bytes as usize];
        let started = Instant::now();
        self.client
            .post(format!("{}/__up", self.endpoint))
            .body(body)
            .send()
            .await
            .context("Upload request failed")?
            .error_for_status()?;
        debug!("Uploaded {} bytes in {:?}", self.upload_bytes, started.elapsed());
        Ok(mbps(self.upload_bytes, started.elapsed()))
    }
}

#[async_trait]
impl SpeedTestBackend for HttpSpeedTest {
    async fn measure(&self) -> Result<ThroughputResult> {
        let meta = self.meta().await.unwrap_or_else(|e| {
            warn!("Speed test metadata unavailable: {:#}", e);
            Meta::default()
        });

        let (latency_ms, jitter_ms) = self.idle_latency().await?;
        let download_mbps = self.download().await?;
        let upload_mbps = self.upload().await?;

        let external_ip = match &meta.client_ip {
            Some(ip) => Some(ip.clone()),
            None => match get_public_ip(&self.client, &self.public_ip_service).await {
                Ok(ip) => Some(ip.to_string()),
                Err(e) => {
                    warn!("Failed to get public IP: {:#}", e);
                    None
                }
            },
        };
        let internal_ip = detect_local_ip().await.ok().map(|ip| ip.to_string());

        Ok(ThroughputResult {
            timestamp: Utc::now(),
            download_mbps,
            upload_mbps,
            latency_ms,
            jitter_ms,
            server_location: meta.server_location(),
            isp: meta.as_organization.clone(),
            external_ip,
            internal_ip,
        })
    }
}

fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(1e-6);
    bytes as f64 * 8.0 / secs / 1_000_000.0
}

fn latency_stats(samples: &[f64]) -> (f64, Option<f64>) {
    let mean = samples.iter().sum::<f64>() / samples.len().max(1) as f64;
    let jitter = (samples.len() > 1).then(|| {
        samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f64>()
            / (samples.len() - 1) as f64
    });
    (mean, jitter)
}
