//! Service wiring: store connection, repository, probes, trigger, scheduler

use crate::config::{Config, StoreBackend};
use crate::scheduler::{MonitoringScheduler, SchedulerSettings, StatsView};
use crate::storage::questdb::QuestDbConnector;
use crate::storage::sqlite::SqliteConnector;
use crate::storage::{ConnectionManager, ConnectionSettings, MetricsRepository, StoreConnector};
use crate::testing::{HttpSpeedTest, ProbeClient, Prober, SurgeTransport, ThroughputTester};
use crate::trigger::ThroughputTrigger;
use anyhow::Result;
use linkwatch_model::MonitorStats;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long shutdown waits for each background task
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Monitor {
    repository: Arc<MetricsRepository>,
    trigger: Arc<ThroughputTrigger>,
    scheduler: Arc<MonitoringScheduler>,
    stats: StatsView,
    cancel: CancellationToken,
    connection_task: Mutex<Option<JoinHandle<()>>>,
    schedule_tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub fn connector_for(config: &Config) -> Arc<dyn StoreConnector> {
    match config.store.backend {
        StoreBackend::Questdb => Arc::new(QuestDbConnector::from_config(&config.store)),
        StoreBackend::Sqlite => Arc::new(SqliteConnector::new(
            config.store.path.clone(),
            config.store.table.clone(),
        )),
    }
}

impl Monitor {
    pub fn build(config: &Config) -> Result<Self> {
        let prober: Arc<dyn Prober> = Arc::new(ProbeClient::new(Arc::new(SurgeTransport::new())));
        Self::build_with(config, connector_for(config), prober)
    }

    /// Build with explicit collaborators for the store and the probe.
    pub fn build_with(
        config: &Config,
        connector: Arc<dyn StoreConnector>,
        prober: Arc<dyn Prober>,
    ) -> Result<Self> {
        let connection =
            ConnectionManager::new(connector, ConnectionSettings::from_config(&config.store));
        let repository = Arc::new(MetricsRepository::new(
            connection,
            config.store.table.clone(),
        ));

        let backend = Arc::new(HttpSpeedTest::from_config(&config.throughput)?);
        let tester = ThroughputTester::new(backend, config.throughput_timeout());
        let trigger = Arc::new(ThroughputTrigger::new(tester, repository.clone()));

        let scheduler = Arc::new(MonitoringScheduler::new(
            SchedulerSettings::from_config(config),
            prober,
            trigger.clone(),
            repository.clone(),
        ));
        let stats = scheduler.stats();

        Ok(Self {
            repository,
            trigger,
            scheduler,
            stats,
            cancel: CancellationToken::new(),
            connection_task: Mutex::new(None),
            schedule_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the store connection loop and the scheduler.
    pub fn start(&self) {
        let connection = self.repository.connection().spawn();
        *self.connection_task.lock() = Some(tokio::spawn(async move {
            match connection.await {
                Ok(exit) => info!("Store connection loop ended: {:?}", exit),
                Err(e) => warn!("Store connection loop task failed: {}", e),
            }
        }));

        self.schedule_tasks
            .lock()
            .extend(self.scheduler.start(self.cancel.clone()));
        info!("Monitor started");
    }

    pub fn repository(&self) -> &Arc<MetricsRepository> {
        &self.repository
    }

    pub fn trigger(&self) -> &Arc<ThroughputTrigger> {
        &self.trigger
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats.snapshot()
    }

    /// Stop scheduling, wait for in-flight work, then flush and close the store.
    pub async fn shutdown(&self) {
        info!("Shutting down monitor");
        self.cancel.cancel();
        let schedules: Vec<_> = self.schedule_tasks.lock().drain(..).collect();
        for task in schedules {
            join_with_grace(task).await;
        }

        // Also stops the connection loop.
        self.repository.close().await;
        let connection = self.connection_task.lock().take();
        if let Some(task) = connection {
            join_with_grace(task).await;
        }
        info!("Monitor stopped");
    }
}

async fn join_with_grace(task: JoinHandle<()>) {
    let abort = task.abort_handle();
    if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
        warn!("Background task did not stop within {:?}, aborting", SHUTDOWN_GRACE);
        abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fake::{FakeConnector, FakeStore};
    use async_trait::async_trait;
    use linkwatch_model::{ProbeError, ProbeResult};

    struct AlwaysUp;

    #[async_trait]
    impl Prober for AlwaysUp {
        async fn probe(
            &self,
            host: &str,
            _timeout: Duration,
            _samples: u32,
        ) -> Result<ProbeResult, ProbeError> {
            Ok(ProbeResult {
                host: host.to_string(),
                reachable: true,
                latency_ms: Some(5.0),
                packet_loss_pct: Some(0.0),
                jitter_ms: None,
                stddev_ms: None,
            })
        }
    }

    #[tokio::test]
    async fn test_start_probe_and_shutdown_closes_store() {
        let store = FakeStore::new();
        let connector = Arc::new(FakeConnector(store.clone()));
        let monitor = Monitor::build_with(&Config::default(), connector, Arc::new(AlwaysUp)).unwrap();

        monitor.start();
        while monitor.stats().total_probes() < 2
            || !monitor.repository().connection().get_state().is_connected()
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!monitor.trigger().is_running());

        monitor.shutdown().await;
        assert!(!monitor.repository().connection().get_state().is_connected());
        assert_eq!(store.closed_handles.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            *store.events.lock(),
            vec!["ingest flush", "ingest close", "query close"]
        );
    }
}
