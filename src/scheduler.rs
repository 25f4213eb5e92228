//! Periodic drift scans.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::Engine;

#[derive(Debug, Clone)]
pub struct ScanScheduler {
    engine: Arc<Engine>,
    resources: Vec<String>,
    interval: Duration,
}

impl ScanScheduler {
    pub fn new(engine: Arc<Engine>, resources: Vec<String>, interval: Duration) -> Self {
        Self { engine, resources, interval }
    }

    /// Scan every interval, starting immediately, until `shutdown` fires.
    /// A slow scan delays the next one rather than overlapping it.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            resources = self.resources.len(),
            interval_secs = self.interval.as_secs(),
            "Scan scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = self.engine.request_scan(&self.resources).await;
                    info!(
                        reports = outcome.summary.reports.len(),
                        clean = outcome.summary.clean.len(),
                        failures = outcome.summary.failures.len(),
                        dispatched = outcome.actions.len(),
                        "Scheduled scan finished"
                    );
                }
            }
        }

        info!("Scan scheduler stopped");
    }
}
