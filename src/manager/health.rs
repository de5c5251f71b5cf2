//! Background health probing.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use super::BackendManager;

/// Periodic re-prober for managed backends.
///
/// Runs one probe cycle per tick until aborted. Dropping the ticker stops
/// the task.
pub struct HealthTicker {
    handle: JoinHandle<()>,
}

impl HealthTicker {
    /// Spawn the ticker at the manager's configured interval.
    pub fn spawn(manager: Arc<BackendManager>) -> Self {
        let interval = manager.health_interval();
        Self::spawn_with_interval(manager, interval)
    }

    pub fn spawn_with_interval(manager: Arc<BackendManager>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would race start_all.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("running backend probe cycle");
                manager.run_probe_cycle().await;
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for HealthTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
