//! Restore Orchestrator
//!
//! Drives freezer records through `Ready -> Restoring -> Finished` and
//! deletes finished copies once their lifetime runs out. Every state
//! change for a freezer happens under that freezer's distributed lock.
//!
//! ```text
//! startup ──▶ continue Restoring ──▶ restore_object
//! pass    ──▶ Ready    ──▶ restore_object   (copy into hot pool, Finished)
//!         ──▶ Finished ──▶ eliminate_object (lifetime over: delete + recycle)
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::locks::LockKeeper;
use crate::config::{parse_duration, GatewayConfig};
use crate::error::{ApiErrorCode, Result};
use crate::meta::{Freezer, PartsIndex, RestoreStatus, StorageClass};
use crate::metrics;
use crate::storage::DataPath;

/// Freezer records fetched per page.
pub const MAX_LIST_NUM: usize = 100;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the restore orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Freezer records handled per page
    pub list_limit: usize,

    /// Repeat the restore pass on `interval` instead of running it once
    pub enable_cron: bool,

    /// Interval between restore passes
    pub interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            list_limit: MAX_LIST_NUM,
            enable_cron: false,
            interval: Duration::from_secs(24 * 3600),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Result<Self> {
        Ok(Self {
            list_limit: config.restore.list_limit.max(1),
            enable_cron: config.restore.enable_cron,
            interval: parse_duration(&config.restore.interval)?,
        })
    }
}

/// Result of handling one freezer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Data copied into the hot pool, freezer finished.
    Restored,
    /// Restored copy deleted after its lifetime.
    Eliminated,
    /// Source object gone; freezer deleted.
    SourceMissing,
    /// Locked elsewhere, not due, or already handled.
    Skipped,
}

impl RestoreOutcome {
    fn label(&self) -> &'static str {
        match self {
            RestoreOutcome::Restored => "restored",
            RestoreOutcome::Eliminated => "eliminated",
            RestoreOutcome::SourceMissing => "source_missing",
            RestoreOutcome::Skipped => "skipped",
        }
    }
}

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub restored: usize,
    pub eliminated: usize,
    pub source_missing: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PassStats {
    fn record(&mut self, result: &Result<RestoreOutcome>) {
        match result {
            Ok(RestoreOutcome::Restored) => self.restored += 1,
            Ok(RestoreOutcome::Eliminated) => self.eliminated += 1,
            Ok(RestoreOutcome::SourceMissing) => self.source_missing += 1,
            Ok(RestoreOutcome::Skipped) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Distributed lock key of a freezer.
pub fn lock_key(freezer: &Freezer) -> String {
    format!(
        "restore:{}:{}:{}",
        freezer.bucket, freezer.name, freezer.version_id
    )
}

/// Whether a finished copy has outlived its lifetime.
pub fn needs_elimination(freezer: &Freezer, now: DateTime<Utc>) -> bool {
    match freezer
        .last_modified
        .checked_add_signed(chrono::Duration::days(i64::from(freezer.lifetime_days)))
    {
        Some(expiry) => expiry <= now,
        None => false,
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct RestoreOrchestrator {
    config: OrchestratorConfig,
    data: Arc<DataPath>,
    locks: Arc<LockKeeper>,
}

impl RestoreOrchestrator {
    pub fn new(config: OrchestratorConfig, data: Arc<DataPath>, locks: Arc<LockKeeper>) -> Self {
        Self {
            config,
            data,
            locks,
        }
    }

    pub fn locks(&self) -> &Arc<LockKeeper> {
        &self.locks
    }

    /// Resume restores a previous process left in `Restoring`, then run the
    /// restore pass once or on the configured interval.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting restore orchestrator with {:?}", self.config);
        match self.continue_restore_not_finished().await {
            Ok(stats) => info!("Resumed unfinished restores: {:?}", stats),
            Err(e) => error!("Resuming unfinished restores failed: {}", e),
        }

        if !self.config.enable_cron {
            info!("Running restore and elimination once");
            self.pass_logged(Utc::now()).await;
            return;
        }

        let mut tick = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Restore orchestrator shutting down");
                    break;
                }
                _ = tick.tick() => self.pass_logged(Utc::now()).await,
            }
        }
    }

    async fn pass_logged(&self, now: DateTime<Utc>) {
        match self.operate_object(now).await {
            Ok(stats) => info!("Restore pass finished: {:?}", stats),
            Err(e) => error!("Restore pass failed: {}", e),
        }
    }

    /// Re-run restores stuck in `Restoring`.
    pub async fn continue_restore_not_finished(&self) -> Result<PassStats> {
        let mut stats = PassStats::default();
        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let (page, next) = self
                .data
                .meta()
                .list_freezers(RestoreStatus::Restoring, cursor.as_deref(), self.config.list_limit)
                .await?;
            let results = join_all(page.into_iter().map(|f| self.restore_object(f))).await;
            for result in &results {
                stats.record(result);
            }
            match next {
                Some(key) => cursor = Some(key),
                None => return Ok(stats),
            }
        }
    }

    /// One restore and elimination pass as of `now`.
    pub async fn operate_object(&self, now: DateTime<Utc>) -> Result<PassStats> {
        let mut stats = PassStats::default();

        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let (page, next) = self
                .data
                .meta()
                .list_freezers(RestoreStatus::Ready, cursor.as_deref(), self.config.list_limit)
                .await?;
            let results = join_all(page.into_iter().map(|f| self.restore_object(f))).await;
            for result in &results {
                stats.record(result);
            }
            match next {
                Some(key) => cursor = Some(key),
                None => break,
            }
        }

        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let (page, next) = self
                .data
                .meta()
                .list_freezers(RestoreStatus::Finished, cursor.as_deref(), self.config.list_limit)
                .await?;
            let results = join_all(page.into_iter().map(|f| self.eliminate_object(f, now))).await;
            for result in &results {
                stats.record(result);
            }
            match next {
                Some(key) => cursor = Some(key),
                None => break,
            }
        }
        Ok(stats)
    }

    /// Copy a freezer's source object into the hot pool.
    #[instrument(skip(self, freezer), fields(bucket = %freezer.bucket, key = %freezer.name))]
    pub async fn restore_object(&self, freezer: Freezer) -> Result<RestoreOutcome> {
        let key = lock_key(&freezer);
        if self.locks.obtain(&key).await?.is_none() {
            debug!("Restore of {}/{} is locked elsewhere", freezer.bucket, freezer.name);
            return Ok(RestoreOutcome::Skipped);
        }
        let result = self.restore_locked(&key, &freezer).await;
        self.locks.release(&key).await;

        match &result {
            Ok(outcome) => metrics::restore(outcome.label()),
            Err(e) => {
                metrics::restore("failed");
                error!("Restore of {}/{} failed: {}", freezer.bucket, freezer.name, e);
            }
        }
        result
    }

    async fn restore_locked(&self, key: &str, scanned: &Freezer) -> Result<RestoreOutcome> {
        let meta = self.data.meta();
        let mut freezer = match meta
            .get_freezer(&scanned.bucket, &scanned.name, &scanned.version_id)
            .await
        {
            Ok(freezer) => freezer,
            Err(e) if e.is_api(ApiErrorCode::NoSuchKey) => return Ok(RestoreOutcome::Skipped),
            Err(e) => return Err(e),
        };
        if freezer.status == RestoreStatus::Finished {
            return Ok(RestoreOutcome::Skipped);
        }

        let source = match meta
            .get_object(&freezer.bucket, &freezer.name, &freezer.version_id)
            .await
        {
            Ok(source) if !source.delete_marker => source,
            Ok(_) => {
                meta.delete_freezer(&freezer.bucket, &freezer.name, &freezer.version_id)
                    .await?;
                info!("Dropped restore of deleted object {}/{}", freezer.bucket, freezer.name);
                return Ok(RestoreOutcome::SourceMissing);
            }
            Err(e) if e.is_api(ApiErrorCode::NoSuchKey) => {
                meta.delete_freezer(&freezer.bucket, &freezer.name, &freezer.version_id)
                    .await?;
                info!("Dropped restore of deleted object {}/{}", freezer.bucket, freezer.name);
                return Ok(RestoreOutcome::SourceMissing);
            }
            Err(e) => return Err(e),
        };

        if freezer.status == RestoreStatus::Restoring {
            debug!(
                "Resuming restore of {}/{} after {} attempts",
                freezer.bucket, freezer.name, freezer.tried_times
            );
        }
        freezer.status = RestoreStatus::Restoring;
        freezer.tried_times = freezer.tried_times.saturating_add(1);
        meta.put_freezer(&freezer).await?;

        let copy = match self
            .data
            .copy_object_data(&source, StorageClass::Standard)
            .await
        {
            Ok(copy) => copy,
            Err(e) => {
                self.reset_to_ready(&freezer).await;
                return Err(e);
            }
        };

        if !self.locks.is_held(key) {
            warn!(
                "Lost lock while restoring {}/{}, dropping the copy",
                freezer.bucket, freezer.name
            );
            self.data.recycle().enqueue_all(copy.backend_tuples());
            return Ok(RestoreOutcome::Skipped);
        }

        freezer.location = copy.location.clone();
        freezer.pool = copy.pool;
        freezer.object_id = copy.object_id.clone();
        freezer.parts = copy.parts.clone();
        freezer.parts_index = (!copy.parts.is_empty()).then(|| PartsIndex::build(&copy.parts));
        freezer.object_type = source.object_type;
        freezer.storage_class = source.storage_class;
        freezer.size = source.size;
        freezer.etag = source.etag.clone();
        freezer.owner_id = source.owner_id.clone();
        freezer.status = RestoreStatus::Finished;
        freezer.last_modified = Utc::now();
        if let Err(e) = meta.put_freezer(&freezer).await {
            self.data.recycle().enqueue_all(copy.backend_tuples());
            self.reset_to_ready(&freezer).await;
            return Err(e);
        }

        info!(
            "Restored {}/{} ({} bytes) to {}",
            freezer.bucket, freezer.name, freezer.size, freezer.location
        );
        Ok(RestoreOutcome::Restored)
    }

    async fn reset_to_ready(&self, freezer: &Freezer) {
        if let Err(e) = self
            .data
            .meta()
            .set_freezer_status(
                &freezer.bucket,
                &freezer.name,
                &freezer.version_id,
                RestoreStatus::Ready,
            )
            .await
        {
            error!(
                "Failed to reset {}/{} to ready: {}",
                freezer.bucket, freezer.name, e
            );
        }
    }

    /// Delete a finished copy whose lifetime is over.
    #[instrument(skip(self, freezer), fields(bucket = %freezer.bucket, key = %freezer.name))]
    pub async fn eliminate_object(&self, freezer: Freezer, now: DateTime<Utc>) -> Result<RestoreOutcome> {
        if !needs_elimination(&freezer, now) {
            return Ok(RestoreOutcome::Skipped);
        }
        let key = lock_key(&freezer);
        if self.locks.obtain(&key).await?.is_none() {
            return Ok(RestoreOutcome::Skipped);
        }
        let result = self.eliminate_locked(&freezer, now).await;
        self.locks.release(&key).await;
        if let Ok(outcome) = &result {
            metrics::restore(outcome.label());
        }
        result
    }

    async fn eliminate_locked(&self, scanned: &Freezer, now: DateTime<Utc>) -> Result<RestoreOutcome> {
        let meta = self.data.meta();
        let freezer = match meta
            .get_freezer(&scanned.bucket, &scanned.name, &scanned.version_id)
            .await
        {
            Ok(freezer) => freezer,
            Err(e) if e.is_api(ApiErrorCode::NoSuchKey) => return Ok(RestoreOutcome::Skipped),
            Err(e) => return Err(e),
        };
        if freezer.status != RestoreStatus::Finished || !needs_elimination(&freezer, now) {
            return Ok(RestoreOutcome::Skipped);
        }

        meta.delete_freezer(&freezer.bucket, &freezer.name, &freezer.version_id)
            .await?;
        let tuples = freezer.backend_tuples();
        info!(
            "Eliminated restored copy of {}/{}, recycling {} blobs",
            freezer.bucket,
            freezer.name,
            tuples.len()
        );
        self.data.recycle().enqueue_all(tuples);
        Ok(RestoreOutcome::Eliminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{
        InMemoryLockService, MemoryKvStore, MemoryObjectStore, StripedCluster, StripedClusterConfig,
    };
    use crate::domain::{Cluster, LockService, Pool};
    use crate::meta::{Bucket, MetaStore, Object, ObjectType};
    use crate::restore::locks::LockKeeperConfig;
    use crate::storage::{ClusterSelector, ClusterWeight, RecycleQueue, RecycleQueueConfig, SelectorConfig};
    use std::collections::HashMap;
    use std::io::Cursor;

    const BODY: &[u8] = b"archived payload";

    fn data_path() -> Arc<DataPath> {
        let store = Arc::new(MemoryObjectStore::new("c1"));
        let cluster: Arc<dyn Cluster> =
            Arc::new(StripedCluster::new(store, StripedClusterConfig::default()));
        let clusters = HashMap::from([("c1".to_string(), cluster)]);
        let weights = Pool::ALL
            .into_iter()
            .map(|pool| ClusterWeight {
                cluster_id: "c1".into(),
                pool,
                weight: 1,
            })
            .collect();
        let selector = Arc::new(ClusterSelector::new(
            SelectorConfig::default(),
            clusters.clone(),
            weights,
        ));
        let meta = MetaStore::new(Arc::new(MemoryKvStore::new()));
        let recycle = RecycleQueue::new(RecycleQueueConfig::default(), clusters, meta.clone());
        Arc::new(DataPath::new(selector, meta, recycle))
    }

    struct Fixture {
        data: Arc<DataPath>,
        service: Arc<InMemoryLockService>,
        fatal: CancellationToken,
        orchestrator: RestoreOrchestrator,
    }

    fn fixture() -> Fixture {
        let data = data_path();
        let service = Arc::new(InMemoryLockService::new());
        let fatal = CancellationToken::new();
        let keeper = Arc::new(LockKeeper::new(
            service.clone(),
            LockKeeperConfig::default(),
            fatal.clone(),
        ));
        let orchestrator = RestoreOrchestrator::new(
            OrchestratorConfig {
                list_limit: 2,
                ..Default::default()
            },
            data.clone(),
            keeper,
        );
        Fixture {
            data,
            service,
            fatal,
            orchestrator,
        }
    }

    async fn archive(data: &DataPath, name: &str) -> (Object, Freezer) {
        let bucket = Bucket::new("b", "o");
        data.meta().put_bucket(&bucket).await.unwrap();
        let object = data
            .upload_object(
                &bucket,
                name,
                "o",
                &mut Cursor::new(BODY.to_vec()),
                Some(BODY.len() as u64),
                StorageClass::Glacier,
            )
            .await
            .unwrap();
        assert_eq!(object.pool, Pool::Cold);
        let freezer = Freezer::request("b", name, &object.version_id, "o", 1);
        data.meta().put_freezer(&freezer).await.unwrap();
        (object, freezer)
    }

    #[tokio::test]
    async fn test_ready_freezer_is_restored() {
        let f = fixture();
        let (object, freezer) = archive(&f.data, "k").await;

        let stats = f.orchestrator.operate_object(Utc::now()).await.unwrap();
        assert_eq!(stats.restored, 1);

        let restored = f
            .data
            .meta()
            .get_freezer("b", "k", &freezer.version_id)
            .await
            .unwrap();
        assert_eq!(restored.status, RestoreStatus::Finished);
        assert_eq!(restored.location, "c1");
        assert_ne!(restored.pool, Pool::Cold);
        assert_eq!(restored.size, BODY.len() as u64);
        assert_eq!(restored.etag, object.etag);
        assert_eq!(restored.backend_tuples().len(), 1);
        assert_eq!(restored.storage_class, StorageClass::Glacier);
        assert_eq!(restored.object_type, object.object_type);
        assert_eq!(restored.create_time, freezer.create_time);
        assert_eq!(restored.parts_index, None);
        assert_eq!(restored.tried_times, 1);
        assert_eq!(f.service.held_count(), 0);
        assert_eq!(f.orchestrator.locks().held_count(), 0);
    }

    #[tokio::test]
    async fn test_pages_through_many_freezers() {
        let f = fixture();
        for name in ["a", "b", "c", "d", "e"] {
            archive(&f.data, name).await;
        }
        let stats = f.orchestrator.operate_object(Utc::now()).await.unwrap();
        assert_eq!(stats.restored, 5);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_locked_freezer_is_skipped() {
        let f = fixture();
        let (_, freezer) = archive(&f.data, "k").await;
        f.service
            .obtain(&lock_key(&freezer), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let outcome = f.orchestrator.restore_object(freezer.clone()).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Skipped);
        let stored = f
            .data
            .meta()
            .get_freezer("b", "k", &freezer.version_id)
            .await
            .unwrap();
        assert_eq!(stored.status, RestoreStatus::Ready);
    }

    #[tokio::test]
    async fn test_missing_source_drops_freezer() {
        let f = fixture();
        let freezer = Freezer::request("b", "gone", "v1", "o", 1);
        f.data.meta().put_freezer(&freezer).await.unwrap();

        let outcome = f.orchestrator.restore_object(freezer).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::SourceMissing);
        assert!(f.data.meta().get_freezer("b", "gone", "v1").await.is_err());
        assert_eq!(f.data.recycle().pending(), 0);
    }

    #[tokio::test]
    async fn test_unfinished_restore_is_resumed() {
        let f = fixture();
        let (_, mut freezer) = archive(&f.data, "k").await;
        freezer.status = RestoreStatus::Restoring;
        freezer.tried_times = 1;
        f.data.meta().put_freezer(&freezer).await.unwrap();

        let stats = f.orchestrator.continue_restore_not_finished().await.unwrap();
        assert_eq!(stats.restored, 1);
        let stored = f
            .data
            .meta()
            .get_freezer("b", "k", &freezer.version_id)
            .await
            .unwrap();
        assert_eq!(stored.status, RestoreStatus::Finished);
        assert_eq!(stored.tried_times, 2);
    }

    #[tokio::test]
    async fn test_multipart_restore_records_parts() {
        let f = fixture();
        let bucket = Bucket::new("b", "o");
        f.data.meta().put_bucket(&bucket).await.unwrap();
        let upload = f
            .data
            .create_multipart(&bucket, "mp", "o", StorageClass::Glacier, Utc::now())
            .await
            .unwrap();
        for (number, part) in [(1, b"first part".to_vec()), (2, b"second".to_vec())] {
            let size = part.len() as u64;
            f.data
                .upload_part(&upload, number, &mut Cursor::new(part), size)
                .await
                .unwrap();
        }
        let object = f.data.complete_multipart(&bucket, &upload).await.unwrap();
        let freezer = Freezer::request("b", "mp", &object.version_id, "o", 1);
        f.data.meta().put_freezer(&freezer).await.unwrap();

        let outcome = f.orchestrator.restore_object(freezer.clone()).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Restored);
        let restored = f
            .data
            .meta()
            .get_freezer("b", "mp", &object.version_id)
            .await
            .unwrap();
        assert_eq!(restored.object_type, ObjectType::Multipart);
        assert_eq!(restored.parts.len(), 2);
        assert_eq!(
            restored.parts_index,
            Some(PartsIndex {
                starts: vec![0, 10]
            })
        );
        assert_eq!(restored.backend_tuples().len(), 2);
    }

    #[tokio::test]
    async fn test_expired_copy_is_eliminated() {
        let f = fixture();
        let (_, freezer) = archive(&f.data, "k").await;
        f.orchestrator.restore_object(freezer.clone()).await.unwrap();

        // Lifetime one day: not due tomorrow minus a minute, due after two days.
        let early = Utc::now() + chrono::Duration::days(1) - chrono::Duration::minutes(1);
        let stats = f.orchestrator.operate_object(early).await.unwrap();
        assert_eq!(stats.eliminated, 0);

        let later = Utc::now() + chrono::Duration::days(2);
        let stats = f.orchestrator.operate_object(later).await.unwrap();
        assert_eq!(stats.eliminated, 1);
        assert!(f
            .data
            .meta()
            .get_freezer("b", "k", &freezer.version_id)
            .await
            .is_err());
        assert!(f.data.recycle().pending() >= 1);
    }

    #[tokio::test]
    async fn test_lock_outage_is_fatal() {
        let f = fixture();
        let (_, freezer) = archive(&f.data, "k").await;
        f.service.set_unavailable(true);

        assert!(f.orchestrator.restore_object(freezer).await.is_err());
        assert!(f.fatal.is_cancelled());
    }

    #[test]
    fn test_needs_elimination_saturates() {
        let mut freezer = Freezer::request("b", "k", "v", "o", u32::MAX);
        freezer.last_modified = DateTime::<Utc>::MAX_UTC - chrono::Duration::days(1);
        assert!(!needs_elimination(&freezer, DateTime::<Utc>::MAX_UTC));
    }

    #[test]
    fn test_config_from_gateway() {
        let mut gateway = GatewayConfig::default();
        gateway.restore.enable_cron = true;
        gateway.restore.interval = "1h".to_string();
        let config = OrchestratorConfig::from_gateway(&gateway).unwrap();
        assert!(config.enable_cron);
        assert_eq!(config.interval, Duration::from_secs(3600));
        assert_eq!(config.list_limit, MAX_LIST_NUM);
    }
}
