//! Single-flight throughput trigger
//!
//! At most one throughput test runs at a time, whether it was started by the
//! scheduler or by a user request. Callers that find a test running are
//! rejected immediately; nothing queues.

use crate::storage::MetricSink;
use crate::testing::ThroughputTester;
use linkwatch_model::{Metric, ThroughputResult, TriggerError};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

pub struct ThroughputTrigger {
    running: AtomicBool,
    tester: ThroughputTester,
    sink: Arc<dyn MetricSink>,
}

/// Clears the running flag when dropped, on every exit path including panics
/// and cancellation of the trigger future.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ThroughputTrigger {
    pub fn new(tester: ThroughputTester, sink: Arc<dyn MetricSink>) -> Self {
        Self {
            running: AtomicBool::new(false),
            tester,
            sink,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one test and persist it. A failed write does not fail the test.
    pub async fn trigger(&self) -> Result<ThroughputResult, TriggerError> {
        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            return Err(TriggerError::AlreadyRunning);
        };

        info!("Starting throughput test");
        let result = self.tester.run_test().await?;

        let metric = Metric::from_throughput(&result);
        best_effort("throughput metric write", self.sink.write_metric(&metric)).await;
        Ok(result)
    }
}

/// Await a side effect whose failure is logged and dropped.
pub async fn best_effort<E, F>(label: &str, fut: F) -> bool
where
    E: std::fmt::Display,
    F: Future<Output = Result<(), E>>,
{
    match fut.await {
        Ok(()) => true,
        Err(e) => {
            warn!("{} failed, dropping: {}", label, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fake::RecordingSink;
    use crate::testing::SpeedTestBackend;
    use async_trait::async_trait;
    use chrono::Utc;
    use linkwatch_model::{DbError, MetricSource};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::Notify;

    enum Outcome {
        Succeed,
        Fail,
        Hang,
    }

    struct GatedBackend {
        outcome: Outcome,
        calls: AtomicU32,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl SpeedTestBackend for GatedBackend {
        async fn measure(&self) -> anyhow::Result<ThroughputResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match self.outcome {
                Outcome::Succeed => Ok(ThroughputResult {
                    timestamp: Utc::now(),
                    download_mbps: 100.0,
                    upload_mbps: 20.0,
                    latency_ms: 12.0,
                    jitter_ms: None,
                    server_location: None,
                    isp: None,
                    external_ip: None,
                    internal_ip: None,
                }),
                Outcome::Fail => anyhow::bail!("speed test server unreachable"),
                Outcome::Hang => std::future::pending().await,
            }
        }
    }

    fn trigger_with(
        outcome: Outcome,
        gate: Option<Arc<Notify>>,
        sink: Arc<RecordingSink>,
    ) -> (Arc<ThroughputTrigger>, Arc<GatedBackend>) {
        let backend = Arc::new(GatedBackend {
            outcome,
            calls: AtomicU32::new(0),
            gate,
        });
        let tester = ThroughputTester::new(backend.clone(), Duration::from_secs(120));
        (Arc::new(ThroughputTrigger::new(tester, sink)), backend)
    }

    #[tokio::test]
    async fn test_success_writes_metric_and_clears_flag() {
        let sink = RecordingSink::new();
        let (trigger, _) = trigger_with(Outcome::Succeed, None, sink.clone());

        let result = trigger.trigger().await.unwrap();
        assert_eq!(result.download_mbps, 100.0);
        assert!(!trigger.is_running());

        let written = sink.written.lock();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].source, MetricSource::Throughput);
        assert_eq!(written[0].download_bandwidth_bps, Some(100_000_000));
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_rejected() {
        let sink = RecordingSink::new();
        let gate = Arc::new(Notify::new());
        let (trigger, backend) = trigger_with(Outcome::Succeed, Some(gate.clone()), sink.clone());

        let first = tokio::spawn({
            let trigger = trigger.clone();
            async move { trigger.trigger().await }
        });
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(trigger.is_running());

        for _ in 0..3 {
            assert_eq!(trigger.trigger().await.unwrap_err(), TriggerError::AlreadyRunning);
        }

        gate.notify_one();
        first.await.unwrap().unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.written.lock().len(), 1);
        assert!(!trigger.is_running());
    }

    #[tokio::test]
    async fn test_execution_failure_clears_flag() {
        let sink = RecordingSink::new();
        let (trigger, _) = trigger_with(Outcome::Fail, None, sink.clone());

        let err = trigger.trigger().await.unwrap_err();
        assert_eq!(err.code(), "EXECUTION_FAILED");
        assert!(!trigger.is_running());
        assert!(sink.written.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_clears_flag() {
        let (trigger, _) = trigger_with(Outcome::Hang, None, RecordingSink::new());

        let err = trigger.trigger().await.unwrap_err();
        assert_eq!(err, TriggerError::Timeout { timeout_ms: 120_000 });
        assert!(!trigger.is_running());
    }

    #[tokio::test]
    async fn test_cancelled_trigger_clears_flag() {
        let gate = Arc::new(Notify::new());
        let (trigger, backend) = trigger_with(Outcome::Succeed, Some(gate), RecordingSink::new());

        let task = tokio::spawn({
            let trigger = trigger.clone();
            async move { trigger.trigger().await }
        });
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;
        assert!(!trigger.is_running());
    }

    #[tokio::test]
    async fn test_write_failure_does_not_fail_result() {
        let sink = RecordingSink::new();
        *sink.fail_with.lock() = Some(DbError::Unavailable("connection refused".into()));
        let (trigger, _) = trigger_with(Outcome::Succeed, None, sink);

        assert!(trigger.trigger().await.is_ok());
        assert!(!trigger.is_running());
    }

    #[tokio::test]
    async fn test_best_effort_reports_outcome() {
        assert!(best_effort("ok", async { Ok::<(), String>(()) }).await);
        assert!(!best_effort("bad", async { Err::<(), _>("boom") }).await);
    }
}
