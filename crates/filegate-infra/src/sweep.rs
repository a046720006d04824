//! Periodic removal of stale staging directories
//!
//! Directories normally disappear with their request. The sweep catches what a
//! killed process left behind.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::staging::{StagingArea, SweepReport};

/// Background service that sweeps the staging root on a fixed interval.
pub struct StagingSweeper {
    area: Arc<StagingArea>,
    every: Duration,
}

impl StagingSweeper {
    pub fn new(area: Arc<StagingArea>, every: Duration) -> Self {
        Self { area, every }
    }

    /// One sweep, logged.
    pub async fn sweep_once(area: &StagingArea) -> SweepReport {
        let report = area.sweep_stale().await;
        if report.removed > 0 || report.failed > 0 {
            tracing::info!(
                root = %area.root().display(),
                removed = report.removed,
                failed = report.failed,
                kept = report.kept,
                "Swept stale staging directories"
            );
        } else {
            tracing::debug!(kept = report.kept, "Staging sweep found nothing stale");
        }
        report
    }

    /// Spawns the sweep loop. The first sweep happens one interval from now;
    /// the startup sweep is the caller's. Abort the handle to stop it.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // `interval` fires immediately once.
            ticker.tick().await;

            tracing::info!(
                interval_secs = self.every.as_secs(),
                max_age_secs = self.area.max_age().as_secs(),
                "Staging sweeper started"
            );
            loop {
                ticker.tick().await;
                Self::sweep_once(&self.area).await;
            }
        })
    }
}
