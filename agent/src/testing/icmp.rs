//! ICMP reachability probes

use async_trait::async_trait;
use linkwatch_model::{ProbeError, ProbeResult};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use surge_ping::{Client, Config as PingConfig, ICMP, PingIdentifier, PingSequence, SurgeError};
use tokio::sync::OnceCell;
use tracing::debug;

/// Slack on top of the probe timeout for resolution and scheduling.
const TIMEOUT_GRACE: Duration = Duration::from_millis(500);

/// Standard ping payload size
const PAYLOAD: [u8; 56] = [0u8; 56];

/// Raw echo primitive under the probe client
#[async_trait]
pub trait EchoTransport: Send + Sync {
    async fn resolve(&self, host: &str) -> io::Result<IpAddr>;

    /// Send one echo request. `Ok(None)` means no reply within `timeout`.
    async fn echo(&self, addr: IpAddr, seq: u16, timeout: Duration)
    -> io::Result<Option<Duration>>;
}

/// One reachability probe against one host. No internal retry.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(
        &self,
        host: &str,
        timeout: Duration,
        samples: u32,
    ) -> Result<ProbeResult, ProbeError>;
}

/// ICMP transport backed by surge-ping. Raw sockets are opened on first use
/// (CAP_NET_RAW required).
#[derive(Default)]
pub struct SurgeTransport {
    v4: OnceCell<Client>,
    v6: OnceCell<Client>,
}

impl SurgeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self, addr: IpAddr) -> io::Result<&Client> {
        let (cell, kind) = match addr {
            IpAddr::V4(_) => (&self.v4, ICMP::V4),
            IpAddr::V6(_) => (&self.v6, ICMP::V6),
        };
        cell.get_or_try_init(|| async move {
            let config = PingConfig::builder().kind(kind).build();
            Client::new(&config)
        })
        .await
    }
}

#[async_trait]
impl EchoTransport for SurgeTransport {
    async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        tokio::net::lookup_host((host, 0))
            .await?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses found"))
    }

    async fn echo(
        &self,
        addr: IpAddr,
        seq: u16,
        timeout: Duration,
    ) -> io::Result<Option<Duration>> {
        let client = self.client(addr).await?;
        let mut pinger = client.pinger(addr, PingIdentifier(rand::random())).await;
        pinger.timeout(timeout);

        match pinger.ping(PingSequence(seq), &PAYLOAD).await {
            Ok((_packet, rtt)) => Ok(Some(rtt)),
            Err(SurgeError::Timeout { .. }) => Ok(None),
            Err(e) => Err(io::Error::other(e.to_string())),
        }
    }
}

pub struct ProbeClient {
    transport: Arc<dyn EchoTransport>,
}

impl ProbeClient {
    pub fn new(transport: Arc<dyn EchoTransport>) -> Self {
        Self { transport }
    }

    async fn sample(
        &self,
        host: &str,
        timeout: Duration,
        samples: u32,
    ) -> Result<ProbeResult, ProbeError> {
        let addr = self
            .transport
            .resolve(host)
            .await
            .map_err(|e| ProbeError::Network {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        let samples = samples.max(1);
        let per_echo = (timeout / samples).max(Duration::from_millis(1));
        let mut rtts = Vec::with_capacity(samples as usize);

        for seq in 0..samples {
            match self.transport.echo(addr, seq as u16, per_echo).await {
                Ok(Some(rtt)) => rtts.push(rtt.as_micros() as f64 / 1000.0),
                Ok(None) => debug!("ICMP {} seq {} -> no reply", host, seq),
                Err(e) => {
                    return Err(ProbeError::Network {
                        host: host.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if rtts.is_empty() {
            return Err(ProbeError::HostUnreachable {
                host: host.to_string(),
            });
        }

        let result = summarize(host, &rtts, samples);
        debug!(
            "ICMP {} -> {:.2}ms, {:.1}% loss",
            host,
            result.latency_ms.unwrap_or_default(),
            result.packet_loss_pct.unwrap_or_default()
        );
        Ok(result)
    }
}

#[async_trait]
impl Prober for ProbeClient {
    async fn probe(
        &self,
        host: &str,
        timeout: Duration,
        samples: u32,
    ) -> Result<ProbeResult, ProbeError> {
        let bound = timeout.saturating_add(TIMEOUT_GRACE);
        match tokio::time::timeout(bound, self.sample(host, timeout, samples)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout {
                host: host.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Mean latency, jitter as mean absolute difference of consecutive samples,
/// population standard deviation and packet loss.
fn summarize(host: &str, rtts: &[f64], sent: u32) -> ProbeResult {
    let n = rtts.len() as f64;
    let mean = rtts.iter().sum::<f64>() / n;
    let variance = rtts.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let jitter = (rtts.len() > 1).then(|| {
        rtts.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f64>() / (n - 1.0)
    });
    let lost = sent as f64 - n;

    ProbeResult {
        host: host.to_string(),
        reachable: true,
        latency_ms: Some(mean),
        packet_loss_pct: Some(lost / sent as f64 * 100.0),
        jitter_ms: jitter,
        stddev_ms: Some(variance.sqrt()),
    }
}
