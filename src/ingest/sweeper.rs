//! Background sweeper for abandoned uploads and deleted files
//!
//! Runs periodically to expire sessions past their upload window, give back
//! reservations whose session row is gone, reclaim the backend objects of
//! tombstoned files and drop old finished session rows.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::credential::DriverSet;
use crate::error::DriveResult;
use crate::ingest::IngestionCoordinator;
use crate::metadata::{FileRecord, MetadataStorage};
use crate::policy::registry::PolicyRegistry;

/// Sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Enable the sweeper
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds between passes
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Most items handled per category per pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long finished sessions are kept
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    /// Age before a reservation without a session counts as orphaned
    #[serde(default = "default_orphan_grace")]
    pub orphan_grace_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_interval() -> u64 {
    60
}

fn default_batch_size() -> usize {
    100
}

fn default_retention() -> u64 {
    7 * 24 * 3600
}

fn default_orphan_grace() -> u64 {
    600
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval(),
            batch_size: default_batch_size(),
            retention_secs: default_retention(),
            orphan_grace_secs: default_orphan_grace(),
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub orphans_released: usize,
    pub reclaimed: usize,
    pub purged_sessions: usize,
}

pub struct UploadSweeper {
    coordinator: Arc<IngestionCoordinator>,
    store: Arc<dyn MetadataStorage>,
    registry: Arc<PolicyRegistry>,
    drivers: Arc<DriverSet>,
    config: SweeperConfig,
}

impl UploadSweeper {
    pub fn new(
        coordinator: Arc<IngestionCoordinator>,
        store: Arc<dyn MetadataStorage>,
        registry: Arc<PolicyRegistry>,
        drivers: Arc<DriverSet>,
        config: SweeperConfig,
    ) -> Self {
        Self { coordinator, store, registry, drivers, config }
    }

    /// Start the sweeper (runs forever)
    pub async fn start(&self) {
        info!("Starting upload sweeper with {}s interval", self.config.interval_secs);
        let mut interval = time::interval(Duration::from_secs(self.config.interval_secs.max(1)));

        loop {
            interval.tick().await;
            match self.run_once(Utc::now()).await {
                Ok(report) if report != SweepReport::default() => info!("Sweep finished: {:?}", report),
                Ok(_) => {}
                Err(e) => error!("Error during upload sweep: {}", e),
            }
        }
    }

    /// One pass over every category. A failing item is logged and left for
    /// the next pass.
    pub async fn run_once(&self, now: DateTime<Utc>) -> DriveResult<SweepReport> {
        let mut report = SweepReport::default();
        let limit = self.config.batch_size;

        for pending in self.store.expired_pending(now, limit)? {
            match self.coordinator.expire_session(&pending.session_id, now).await {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to expire session {}: {}", pending.session_id, e),
            }
        }

        let grace = ChronoDuration::seconds(self.config.orphan_grace_secs as i64);
        for orphan in self.store.orphaned_reservations(now - grace, limit)? {
            if self.store.release_quota(&orphan.session_id)?.is_some() {
                warn!("Released orphaned reservation {} ({} bytes)", orphan.session_id, orphan.bytes);
                report.orphans_released += 1;
            }
        }

        for record in self.store.tombstoned_files(limit)? {
            match self.reclaim(&record).await {
                Ok(()) => {
                    self.store.purge_file(record.id)?;
                    report.reclaimed += 1;
                }
                Err(e) => error!("Failed to reclaim file {}: {}", record.id, e),
            }
        }

        let retention = ChronoDuration::seconds(self.config.retention_secs as i64);
        report.purged_sessions = self.store.purge_finished_pending(now - retention)?;
        Ok(report)
    }

    /// Delete the stored bytes behind a tombstoned record.
    async fn reclaim(&self, record: &FileRecord) -> DriveResult<()> {
        let (policy_id, key) = match (record.policy_id, record.backend_key.as_deref()) {
            (Some(policy_id), Some(key)) if !record.is_dir() => (policy_id, key),
            _ => return Ok(()),
        };
        let policy = self.registry.resolve(policy_id)?;
        self.drivers.get(policy.kind)?.delete_object(&policy, key).await?;
        info!("Reclaimed object {} of file {} on policy {}", key, record.id, policy.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkAssembler;
    use crate::credential::local::LocalDriver;
    use crate::metadata::mock_store::MockMetadataStore;
    use crate::metadata::{Group, QuotaReservation};
    use crate::policy::StoragePolicy;
    use crate::quota::QuotaLedger;
    use crate::storage::mock_store::MockObjectStore;
    use bytes::Bytes;
    use tempfile::TempDir;

    #[test]
    fn test_sweeper_config_defaults() {
        let config: SweeperConfig = serde_yaml::from_str("interval_secs: 5").unwrap();
        assert!(config.enabled);
        assert_eq!(config.interval_secs, 5);
        assert_eq!(config.batch_size, 100);
    }

    #[tokio::test]
    async fn test_sweep_pass() {
        let scratch = TempDir::new().unwrap();
        let store: Arc<dyn MetadataStorage> = Arc::new(MockMetadataStore::new());
        store.put_policy(&StoragePolicy::local(1, "local")).unwrap();
        let registry = Arc::new(PolicyRegistry::load(store.clone()).unwrap());
        let quota = Arc::new(QuotaLedger::new(store.clone(), 1));
        quota
            .set_group(&Group { id: 1, name: "default".into(), max_storage: 100, policy_ids: vec![1] })
            .unwrap();
        let objects = Arc::new(MockObjectStore::new());
        let drivers = Arc::new(DriverSet::new().with(Arc::new(LocalDriver::new(objects.clone()))));
        let coordinator = Arc::new(IngestionCoordinator::new(
            store.clone(),
            registry.clone(),
            quota,
            drivers.clone(),
            objects.clone(),
            Arc::new(ChunkAssembler::new(scratch.path()).unwrap()),
            "http://drive.test",
        ));
        let sweeper = UploadSweeper::new(coordinator.clone(), store.clone(), registry, drivers, SweeperConfig::default());

        // One abandoned session, one deleted file, one orphaned reservation.
        coordinator.issue(7, 1, "/abandoned.bin", 30).await.unwrap();
        coordinator.upload_direct(7, "/gone.txt", Bytes::from_static(b"bytes")).await.unwrap();
        coordinator.tree().delete_path(7, "/gone.txt").unwrap();
        store
            .reserve_quota(&QuotaReservation { session_id: "lost".into(), user_id: 7, bytes: 10, created_at: Utc::now() })
            .unwrap();
        assert_eq!(objects.object_count(), 1);

        let later = Utc::now() + ChronoDuration::hours(2);
        let report = sweeper.run_once(later).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.orphans_released, 1);
        assert_eq!(report.reclaimed, 1);
        assert_eq!(objects.object_count(), 0);

        let usage = store.quota_usage(7).unwrap();
        assert_eq!((usage.used, usage.reserved), (0, 0));

        // Nothing left to do.
        assert_eq!(sweeper.run_once(later).await.unwrap().expired, 0);
    }
}
