//! Store connection lifecycle
//!
//! A single supervised control loop owns reconnects and health polling.
//! Other callers only read the state, or tear the connection down through
//! [`ConnectionManager::mark_disconnected`] when they observe it is dead.

use super::{DisconnectReporter, StoreConnector, StoreHandle};
use crate::config::StoreConfig;
use crate::supervisor::{RestartPolicy, SupervisorExit, supervise};
use chrono::{DateTime, Utc};
use linkwatch_model::DbError;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Per-call connect timeout; a whole attempt may take twice this.
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    /// Delay before the control loop is restarted after a crash
    pub restart_backoff: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.request_timeout_ms),
            reconnect_interval: Duration::from_millis(config.reconnect_interval_ms),
            health_check_interval: Duration::from_millis(config.health_check_interval_ms),
            health_check_timeout: Duration::from_millis(config.request_timeout_ms),
            restart_backoff: Duration::from_millis(config.reconnect_interval_ms),
        }
    }

    fn attempt_timeout(&self) -> Duration {
        self.connect_timeout.saturating_mul(2)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LastError {
    fn now(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub connection: Option<Arc<StoreHandle>>,
    pub is_connecting: bool,
    pub last_error: Option<LastError>,
    pub connected_since: Option<DateTime<Utc>>,
    generation: u64,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Seconds since the current connection was established
    pub fn uptime_seconds(&self) -> Option<i64> {
        self.connected_since
            .map(|since| (Utc::now() - since).num_seconds().max(0))
    }
}

type Report = (u64, String);

struct Inner {
    connector: Arc<dyn StoreConnector>,
    settings: ConnectionSettings,
    state: RwLock<ConnectionState>,
    generation: AtomicU64,
    reports_tx: mpsc::UnboundedSender<Report>,
    reports_rx: Mutex<mpsc::UnboundedReceiver<Report>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn StoreConnector>, settings: ConnectionSettings) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                connector,
                settings,
                state: RwLock::new(ConnectionState::default()),
                generation: AtomicU64::new(0),
                reports_tx,
                reports_rx: Mutex::new(reports_rx),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// The live handle, or `Unavailable` right away. Never waits for a reconnect.
    pub fn get_connection(&self) -> Result<Arc<StoreHandle>, DbError> {
        let state = self.inner.state.read();
        match &state.connection {
            Some(handle) => Ok(handle.clone()),
            None => Err(DbError::Unavailable(
                state
                    .last_error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "no active connection".to_string()),
            )),
        }
    }

    pub fn get_state(&self) -> ConnectionState {
        self.inner.state.read().clone()
    }

    /// Tear down the live handle, if any, and record why. Idempotent.
    pub async fn mark_disconnected(&self, reason: &str) {
        let handle = {
            let mut state = self.inner.state.write();
            state.last_error = Some(LastError::now(reason));
            state.connected_since = None;
            state.connection.take()
        };

        if let Some(handle) = handle {
            warn!("Store connection lost: {}", reason);
            self.teardown(handle).await;
        }
    }

    /// Stop the control loop, flush and close the channels, reset the state.
    pub async fn close(&self) {
        self.inner.cancel.cancel();

        let handle = {
            let mut state = self.inner.state.write();
            let handle = state.connection.take();
            *state = ConnectionState::default();
            handle
        };

        if let Some(handle) = handle {
            match tokio::time::timeout(self.inner.settings.connect_timeout, handle.shutdown())
                .await
            {
                Ok(Ok(())) => info!("Store connection closed"),
                Ok(Err(e)) => warn!("Error while closing store connection: {}", e),
                Err(_) => warn!("Timed out while closing store connection"),
            }
        }
    }

    /// Spawn the supervised control loop. It runs until [`close`](Self::close).
    pub fn spawn(&self) -> JoinHandle<SupervisorExit> {
        let this = self.clone();
        let cancel = self.inner.cancel.clone();
        let policy = RestartPolicy::unbounded(self.inner.settings.restart_backoff);

        info!("Starting store connection loop for {}", self.inner.connector.describe());

        tokio::spawn(async move {
            supervise("store connection loop", policy, cancel, move || {
                let this = this.clone();
                async move { this.control_loop().await }
            })
            .await
        })
    }

    /// One connect attempt: open both channels and verify with a round-trip,
    /// all bounded by the attempt timeout.
    pub async fn connect_once(&self) -> Result<(), String> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.state.write().is_connecting = true;

        let reporter = DisconnectReporter::new(generation, self.inner.reports_tx.clone());
        let connector = self.inner.connector.clone();
        let attempt = async move {
            let handle = connector.connect(reporter).await?;
            if let Err(e) = handle.ping().await {
                let _ = handle.shutdown().await;
                return Err(e);
            }
            Ok(handle)
        };

        let timeout = self.inner.settings.attempt_timeout();
        let outcome = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("connect timed out after {:?}", timeout)),
        };

        // close() may have run while the attempt was in flight.
        let discarded = {
            let mut state = self.inner.state.write();
            state.is_connecting = false;
            if !self.inner.cancel.is_cancelled() {
                return match outcome {
                    Ok(handle) => {
                        state.connection = Some(Arc::new(handle));
                        state.generation = generation;
                        state.connected_since = Some(Utc::now());
                        state.last_error = None;
                        info!("Connected to {}", self.inner.connector.describe());
                        Ok(())
                    }
                    Err(reason) => {
                        state.last_error = Some(LastError::now(reason.clone()));
                        warn!(
                            "Failed to connect to {}: {}",
                            self.inner.connector.describe(),
                            reason
                        );
                        Err(reason)
                    }
                };
            }
            outcome.ok()
        };

        if let Some(handle) = discarded {
            self.teardown(Arc::new(handle)).await;
        }
        debug!("Discarding connect attempt that finished after close");
        Err("connection manager closed".to_string())
    }

    async fn check_health(&self) -> Result<(), String> {
        let handle = self.get_connection().map_err(|e| e.to_string())?;
        let timeout = self.inner.settings.health_check_timeout;
        match tokio::time::timeout(timeout, handle.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", timeout)),
        }
    }

    async fn control_loop(&self) -> anyhow::Result<()> {
        let mut reports = self.inner.reports_rx.lock().await;
        let settings = self.inner.settings;

        loop {
            let wait = if self.get_state().is_connected() {
                match self.check_health().await {
                    Ok(()) => settings.health_check_interval,
                    Err(reason) => {
                        self.mark_disconnected(&format!("health check failed: {}", reason))
                            .await;
                        Duration::ZERO
                    }
                }
            } else {
                match self.connect_once().await {
                    Ok(()) => settings.health_check_interval,
                    Err(_) => settings.reconnect_interval,
                }
            };

            let sleep = tokio::time::sleep(wait);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    Some((generation, reason)) = reports.recv() => {
                        if self.handle_report(generation, &reason).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Returns true when the report tore down the current connection.
    async fn handle_report(&self, generation: u64, reason: &str) -> bool {
        let current = {
            let state = self.inner.state.read();
            state.connection.is_some() && state.generation == generation
        };
        if !current {
            debug!(
                "Ignoring stale transport report for connection #{}: {}",
                generation, reason
            );
            return false;
        }
        self.mark_disconnected(reason).await;
        true
    }

    async fn teardown(&self, handle: Arc<StoreHandle>) {
        match tokio::time::timeout(self.inner.settings.connect_timeout, handle.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Ignoring error while tearing down connection: {}", e),
            Err(_) => debug!("Timed out tearing down connection"),
        }
    }
}
