//! Periodic retention and snapshots.

use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tanksync_core::SyncCoordinator;
use tanksync_store::{SnapshotDb, SnapshotSummary};
use tanksync_types::Timestamp;

use crate::config::StorageConfig;

const DAY_MS: i64 = 86_400_000;

/// Owns the snapshot database and enforces retention on a timer.
pub struct Maintenance {
    coordinator: SyncCoordinator,
    db: SnapshotDb,
    storage: StorageConfig,
}

impl Maintenance {
    pub fn new(coordinator: SyncCoordinator, db: SnapshotDb, storage: StorageConfig) -> Self {
        Self {
            coordinator,
            db,
            storage,
        }
    }

    /// Apply every configured retention limit once.
    pub async fn enforce_retention(&mut self) -> usize {
        let mut evicted = 0;
        if let Some(days) = self.storage.max_age_days {
            let age = i64::try_from(days).unwrap_or(i64::MAX).saturating_mul(DAY_MS);
            let cutoff = Timestamp::now().saturating_sub_millis(age);
            evicted += self.coordinator.evict_before(cutoff).await;
        }
        for limit in self.storage.retention_limits() {
            evicted += self.coordinator.enforce_retention(limit).await;
        }
        if evicted > 0 {
            debug!(evicted, "Retention pass complete");
        }
        evicted
    }

    /// Write the current store to the snapshot database.
    pub async fn snapshot(&mut self) -> Result<SnapshotSummary, tanksync_store::Error> {
        let timeline = self.coordinator.timeline();
        let timeline = timeline.lock().await;
        self.db.save(timeline.store())
    }

    /// Run until cancelled, then take a final snapshot.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut retention = interval(Duration::from_secs(self.storage.retention_interval_secs.max(1)));
        let mut snapshots = interval(Duration::from_secs(self.storage.snapshot_interval_secs.max(1)));
        retention.set_missed_tick_behavior(MissedTickBehavior::Delay);
        snapshots.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately
        snapshots.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = retention.tick() => {
                    self.enforce_retention().await;
                }
                _ = snapshots.tick() => self.save_logged().await,
            }
        }

        self.save_logged().await;
        info!("Maintenance stopped");
    }

    async fn save_logged(&mut self) {
        match self.snapshot().await {
            Ok(summary) => debug!(
                readings = summary.readings,
                windows = summary.windows,
                "Snapshot saved"
            ),
            Err(e) => error!("Failed to save snapshot: {}", e),
        }
    }
}
