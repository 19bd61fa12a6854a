use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::WorkerRegistry;

const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(10);

impl WorkerRegistry {
    /// Spawn the background refresh loop.
    ///
    /// The first tick fires one `interval` from now; callers that want a
    /// warm cache at startup refresh once themselves. Errors are logged and
    /// the loop keeps going. The task exits, dropping its timer, when
    /// `token` is cancelled, abandoning any refresh still in flight.
    pub fn run_auto_refresh(
        self: Arc<Self>,
        token: CancellationToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        let period = interval.max(MIN_REFRESH_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(interval_ms = period.as_millis() as u64, "Worker auto-refresh started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("Worker auto-refresh stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        // A refresh dropped mid-flight releases the refresh
                        // lock and leaves the previous cache in place
                        tokio::select! {
                            _ = token.cancelled() => {
                                tracing::info!("Worker auto-refresh stopped during refresh");
                                break;
                            }
                            result = self.refresh() => match result {
                                Ok(workers) => {
                                    tracing::debug!(count = workers.len(), "Auto-refresh complete");
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "Auto-refresh failed, keeping previous workers");
                                }
                            },
                        }
                    }
                }
            }
        })
    }
}
