//! Monitoring scheduler
//!
//! Two independent repeating cycles: a probe cycle that fans out one probe
//! per host, and a throughput cycle that goes through the single-flight
//! trigger. Each cycle runs as its own task so a panic in one cycle is
//! logged and the schedule carries on. The next run is scheduled one
//! interval after the previous one completes.

use crate::config::Config;
use crate::storage::MetricSink;
use crate::testing::Prober;
use crate::trigger::{ThroughputTrigger, best_effort};
use chrono::{DateTime, Utc};
use linkwatch_model::{Metric, MonitorStats, ProbeError, TriggerError};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Single writer of the monitor statistics. Held by the scheduler only.
pub struct StatsRecorder {
    stats: Arc<RwLock<MonitorStats>>,
}

/// Read-only handle to the statistics
#[derive(Clone)]
pub struct StatsView {
    stats: Arc<RwLock<MonitorStats>>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        let stats = MonitorStats {
            started_at: Some(Utc::now()),
            ..MonitorStats::default()
        };
        Self {
            stats: Arc::new(RwLock::new(stats)),
        }
    }

    pub fn view(&self) -> StatsView {
        StatsView {
            stats: self.stats.clone(),
        }
    }

    fn record_probe_cycle(&self, succeeded: u64, failed: u64, at: DateTime<Utc>) {
        let mut stats = self.stats.write();
        stats.successful_probes += succeeded;
        stats.failed_probes += failed;
        stats.last_probe_time = Some(at);
    }

    fn record_throughput(&self, succeeded: bool, at: DateTime<Utc>) {
        let mut stats = self.stats.write();
        if succeeded {
            stats.successful_throughput_tests += 1;
            stats.last_throughput_time = Some(at);
        } else {
            stats.failed_throughput_tests += 1;
        }
    }
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsView {
    pub fn snapshot(&self) -> MonitorStats {
        let mut stats = self.stats.read().clone();
        if let Some(started_at) = stats.started_at {
            stats.uptime_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
        }
        stats
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub hosts: Vec<String>,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub sample_count: u32,
    pub throughput_interval: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hosts: config.probe.hosts.clone(),
            probe_interval: config.probe_interval(),
            probe_timeout: config.probe_timeout(),
            sample_count: config.probe.sample_count,
            throughput_interval: config.throughput_interval(),
        }
    }
}

pub struct MonitoringScheduler {
    settings: SchedulerSettings,
    prober: Arc<dyn Prober>,
    trigger: Arc<ThroughputTrigger>,
    sink: Arc<dyn MetricSink>,
    stats: StatsRecorder,
}

impl MonitoringScheduler {
    pub fn new(
        settings: SchedulerSettings,
        prober: Arc<dyn Prober>,
        trigger: Arc<ThroughputTrigger>,
        sink: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            settings,
            prober,
            trigger,
            sink,
            stats: StatsRecorder::new(),
        }
    }

    pub fn stats(&self) -> StatsView {
        self.stats.view()
    }

    /// Run one probe cycle now, then keep both cycles going until `cancel`.
    /// An in-flight cycle is allowed to finish.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(
            "Starting scheduler: {} hosts every {:?}, throughput every {:?}",
            self.settings.hosts.len(),
            self.settings.probe_interval,
            self.settings.throughput_interval
        );

        let probes = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let interval = this.settings.probe_interval;
                loop {
                    let cycle = this.clone();
                    isolate("probe cycle", async move { cycle.probe_cycle().await }).await;
                    if !pause(interval, &cancel).await {
                        break;
                    }
                }
                debug!("Probe schedule stopped");
            })
        };

        let throughput = {
            let this = self.clone();
            tokio::spawn(async move {
                let interval = this.settings.throughput_interval;
                while pause(interval, &cancel).await {
                    let cycle = this.clone();
                    isolate("throughput cycle", async move { cycle.throughput_cycle().await })
                        .await;
                }
                debug!("Throughput schedule stopped");
            })
        };

        vec![probes, throughput]
    }

    /// Probe every host concurrently and write one row per host.
    pub async fn probe_cycle(&self) {
        let started = Utc::now();
        let timeout = self.settings.probe_timeout;
        let samples = self.settings.sample_count;

        let handles: Vec<(String, JoinHandle<bool>)> = self
            .settings
            .hosts
            .iter()
            .map(|host| {
                let host = host.clone();
                let prober = self.prober.clone();
                let sink = self.sink.clone();
                let task = tokio::spawn({
                    let host = host.clone();
                    async move {
                        let (metric, reachable) =
                            match prober.probe(&host, timeout, samples).await {
                                Ok(result) => (Metric::from_probe(&result, Utc::now()), true),
                                Err(e) => {
                                    warn!("{}", e);
                                    (Metric::probe_down(&e, Utc::now()), false)
                                }
                            };
                        best_effort("probe metric write", sink.write_metric(&metric)).await;
                        reachable
                    }
                });
                (host, task)
            })
            .collect();

        let (mut succeeded, mut failed) = (0u64, 0u64);
        for (host, handle) in handles {
            match handle.await {
                Ok(true) => succeeded += 1,
                Ok(false) => failed += 1,
                Err(e) => {
                    error!("Probe task for {} crashed: {}", host, e);
                    let crashed = ProbeError::Network {
                        host,
                        message: format!("probe task crashed: {}", e),
                    };
                    let metric = Metric::probe_down(&crashed, Utc::now());
                    best_effort("probe metric write", self.sink.write_metric(&metric)).await;
                    failed += 1;
                }
            }
        }

        self.stats.record_probe_cycle(succeeded, failed, Utc::now());
        info!(
            "Probe cycle done in {}ms: {} up, {} failed",
            (Utc::now() - started).num_milliseconds(),
            succeeded,
            failed
        );
    }

    pub async fn throughput_cycle(&self) {
        match self.trigger.trigger().await {
            Ok(_) => self.stats.record_throughput(true, Utc::now()),
            Err(TriggerError::AlreadyRunning) => {
                info!("Skipping scheduled throughput test, one is already running");
            }
            Err(e) => {
                warn!("Scheduled throughput test failed: {}", e);
                self.stats.record_throughput(false, Utc::now());
            }
        }
    }
}

/// Sleep for `interval`. Returns false when cancelled first.
async fn pause(interval: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}

/// Run one cycle as its own task so a panic stays inside it.
async fn isolate<F>(name: &str, cycle: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Err(e) = tokio::spawn(cycle).await {
        error!("{} crashed: {}", name, e);
    }
}
