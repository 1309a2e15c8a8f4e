//! Supervised background tasks
//!
//! A body that returns an error or panics is logged and started again after
//! a backoff, so long-lived loops survive their own bugs.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// `None` restarts forever
    pub max_restarts: Option<u32>,
    pub backoff: Duration,
}

impl RestartPolicy {
    pub fn unbounded(backoff: Duration) -> Self {
        Self {
            max_restarts: None,
            backoff,
        }
    }

    pub fn bounded(max_restarts: u32, backoff: Duration) -> Self {
        Self {
            max_restarts: Some(max_restarts),
            backoff,
        }
    }
}

/// Why supervision ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The body returned `Ok(())`
    Completed,
    Cancelled,
    /// The restart budget ran out
    GaveUp { restarts: u32 },
}

/// Run `body` under `policy` until it completes, is cancelled or gives up.
pub async fn supervise<F, Fut>(
    name: &str,
    policy: RestartPolicy,
    cancel: CancellationToken,
    mut body: F,
) -> SupervisorExit
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut restarts = 0u32;

    loop {
        let task = tokio::spawn(body());
        let abort = task.abort_handle();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                abort.abort();
                info!("{} stopped", name);
                return SupervisorExit::Cancelled;
            }
            outcome = task => outcome,
        };

        match outcome {
            Ok(Ok(())) => return SupervisorExit::Completed,
            Ok(Err(e)) => error!("{} failed: {:#}", name, e),
            Err(e) if e.is_panic() => error!("{} panicked: {}", name, e),
            Err(_) => return SupervisorExit::Cancelled,
        }

        if let Some(max) = policy.max_restarts {
            if restarts >= max {
                error!("{} gave up after {} restarts", name, restarts);
                return SupervisorExit::GaveUp { restarts };
            }
        }
        restarts += 1;

        warn!(
            "Restarting {} in {:?} (restart #{})",
            name, policy.backoff, restarts
        );
        tokio::select! {
            _ = cancel.cancelled() => return SupervisorExit::Cancelled,
            _ = tokio::time::sleep(policy.backoff) => {}
        }
    }
}
