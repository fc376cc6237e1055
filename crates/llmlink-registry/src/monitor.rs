//! Background health loop

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::TunnelRegistry;

/// Runs [`TunnelRegistry::perform_health_checks`] every
/// `health_check_interval` until shut down
///
/// Dropping the monitor detaches the loop; call [`HealthMonitor::shutdown`]
/// to stop it.
pub struct HealthMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    /// Spawn the loop on the current runtime
    ///
    /// The first pass runs one interval after start, not immediately.
    pub fn start(registry: Arc<TunnelRegistry>) -> Self {
        let cancel = CancellationToken::new();
        let cancel_task = cancel.clone();
        let period = registry.config().health_check_interval;

        info!(interval = ?period, "Starting health monitor");

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel_task.cancelled() => {
                        debug!("Health monitor cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        registry.perform_health_checks().await;
                    }
                }
            }
        });

        Self { cancel, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the loop and wait for an in-flight pass to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Health monitor task ended abnormally");
        }
        info!("Health monitor stopped");
    }
}
