//! Periodic backend health checks.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::backend::BackendState;
use super::pool::BackendPool;
use crate::constants::BACKGROUND_CHECK_TIMEOUT_SECS;
use crate::runtime::RuntimeProvider;

/// Pings every non-maintenance backend's runtime and feeds the result into
/// the pool's health state machine. The ping is a real `list_models` call,
/// so a backend that answers HTTP but has lost its model server still
/// degrades.
pub struct HealthChecker;

impl HealthChecker {
    /// Starts the check loop, ticking every `interval`.
    pub fn spawn(
        pool: Arc<BackendPool>,
        runtimes: Arc<dyn RuntimeProvider>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("health checker stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        Self::check_all(&pool, runtimes.as_ref()).await;
                    }
                }
            }
        })
    }

    /// Runs one round of checks. Exposed for tests that want deterministic
    /// timing.
    pub async fn check_all(pool: &BackendPool, runtimes: &dyn RuntimeProvider) {
        for backend in pool.list() {
            if backend.state == BackendState::Maintenance {
                continue;
            }
            let runtime = runtimes.runtime_for(&backend.address);
            let ok = tokio::time::timeout(
                Duration::from_secs(BACKGROUND_CHECK_TIMEOUT_SECS),
                runtime.list_models(),
            )
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);

            debug!(backend = %backend.id, ok, "health check");
            // The backend may have been removed mid-round; that is fine.
            let _ = pool.record_health_check(&backend.id, ok);
        }
    }
}
