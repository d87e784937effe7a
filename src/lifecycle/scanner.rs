//! Lifecycle Scanner
//!
//! Walks the object and multipart tables within an externally assigned
//! key range, evaluates each bucket's rules and publishes one job per
//! record that needs work. The scanner never mutates metadata or data.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::evaluate::{
    compute_action, compute_action_for_abort, compute_action_for_noncurrent, Action,
    EvalContext, ObjectFacts,
};
use super::job::LifecycleJob;
use super::model::{Lifecycle, RuleSets};
use crate::config::{parse_duration, GatewayConfig};
use crate::domain::MessageBus;
use crate::error::{Error, Result};
use crate::meta::{
    decode, decode_upload_id, keys, next_key, Bucket, MetaStore, Multipart, Object, StorageClass,
};
use crate::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the lifecycle scanner
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Interval between scan passes
    pub interval: Duration,

    /// Assigned key range; an empty end is unbounded
    pub range_start: Vec<u8>,
    pub range_end: Vec<u8>,

    /// Topic jobs are published on
    pub topic: String,

    /// Keys fetched per page
    pub batch: usize,

    /// One rule day lasts one second
    pub debug_mode: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            range_start: Vec::new(),
            range_end: Vec::new(),
            topic: "lifecycle".to_string(),
            batch: 256,
            debug_mode: false,
        }
    }
}

impl ScannerConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Result<Self> {
        let lc = &config.lifecycle;
        let range = |raw: &str| {
            hex::decode(raw).map_err(|e| Error::Config(format!("invalid scan range {:?}: {}", raw, e)))
        };
        Ok(Self {
            interval: parse_duration(&lc.scan_interval)?,
            range_start: range(&lc.scan_start)?,
            range_end: range(&lc.scan_end)?,
            topic: lc.topic.clone(),
            batch: lc.scan_batch.max(1),
            debug_mode: lc.debug_mode,
        })
    }
}

/// Counters for one scan pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub buckets: usize,
    pub scanned: usize,
    pub jobs: usize,
    pub errors: usize,
}

/// A bucket with a lifecycle, as cached for one pass.
struct BucketPlan {
    bucket: Bucket,
    rules: RuleSets,
    prefix: String,
}

/// Latest version of the key currently being walked.
struct LatestVersion {
    name: String,
    version_id: String,
    last_modified: DateTime<Utc>,
    lone_delete_marker: bool,
}

// =============================================================================
// Scanner
// =============================================================================

pub struct LifecycleScanner {
    config: ScannerConfig,
    meta: MetaStore,
    bus: Arc<dyn MessageBus>,
}

impl LifecycleScanner {
    pub fn new(config: ScannerConfig, meta: MetaStore, bus: Arc<dyn MessageBus>) -> Self {
        Self { config, meta, bus }
    }

    /// Scan on the configured interval until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Starting lifecycle scanner, interval {:?}, topic {}",
            self.config.interval, self.config.topic
        );
        let mut tick = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Lifecycle scanner shutting down");
                    break;
                }
                _ = tick.tick() => {
                    match self.scan_once().await {
                        Ok(stats) => debug!("Lifecycle scan pass: {:?}", stats),
                        Err(e) => error!("Lifecycle scan pass failed: {}", e),
                    }
                }
            }
        }
    }

    /// One pass over the assigned range.
    pub async fn scan_once(&self) -> Result<ScanStats> {
        self.scan_at(Utc::now()).await
    }

    /// One pass evaluated as of `now`.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Result<ScanStats> {
        let ctx = EvalContext::new(now, self.config.debug_mode);
        let mut stats = ScanStats::default();
        let plans = self.load_buckets(&mut stats).await?;

        for plan in &plans {
            stats.buckets += 1;
            if !plan.rules.current.is_empty() || !plan.rules.noncurrent.is_empty() {
                self.scan_objects(&ctx, plan, &mut stats).await?;
            }
            if !plan.rules.abort.is_empty() {
                self.scan_multiparts(&ctx, plan, &mut stats).await?;
            }
        }
        self.bus.flush().await?;

        if stats.jobs > 0 || stats.errors > 0 {
            info!(
                "Lifecycle scan: {} buckets, {} records, {} jobs, {} errors",
                stats.buckets, stats.scanned, stats.jobs, stats.errors
            );
        }
        Ok(stats)
    }

    /// Buckets carrying a usable lifecycle.
    async fn load_buckets(&self, stats: &mut ScanStats) -> Result<Vec<BucketPlan>> {
        let mut plans = Vec::new();
        for bucket in self.meta.list_buckets().await? {
            let Some(xml) = bucket.lifecycle_xml.as_deref() else {
                continue;
            };
            let lifecycle = match Lifecycle::parse(xml) {
                Ok(lc) => lc,
                Err(e) => {
                    warn!("Skipping bucket {} with unusable lifecycle: {}", bucket.name, e);
                    stats.errors += 1;
                    continue;
                }
            };
            let rules = lifecycle.filter_rules();
            if rules.is_empty() {
                continue;
            }
            plans.push(BucketPlan {
                prefix: lifecycle.common_prefix(),
                rules,
                bucket,
            });
        }
        Ok(plans)
    }

    /// Clip a bucket subrange to the assigned range.
    fn clip(&self, range: (Vec<u8>, Vec<u8>)) -> Option<(Vec<u8>, Vec<u8>)> {
        keys::intersect(
            (range.0.as_slice(), range.1.as_slice()),
            (
                self.config.range_start.as_slice(),
                self.config.range_end.as_slice(),
            ),
        )
    }

    #[instrument(skip(self, ctx, plan, stats), fields(bucket = %plan.bucket.name))]
    async fn scan_objects(&self, ctx: &EvalContext, plan: &BucketPlan, stats: &mut ScanStats) -> Result<()> {
        let Some((mut cursor, end)) =
            self.clip(keys::object_prefix_range(&plan.bucket.name, &plan.prefix))
        else {
            return Ok(());
        };
        let mut latest: Option<LatestVersion> = None;

        loop {
            let rows = self.meta.kv().scan(&cursor, &end, self.config.batch).await?;
            let exhausted = rows.len() < self.config.batch;
            for (key, raw) in rows {
                cursor = next_key(&key);
                stats.scanned += 1;
                metrics::lifecycle_scanned();

                let object: Object = match decode(&raw) {
                    Ok(object) => object,
                    Err(e) => {
                        warn!("Skipping undecodable object record: {}", e);
                        stats.errors += 1;
                        continue;
                    }
                };
                match self.evaluate_object(ctx, plan, object, &mut latest).await {
                    Ok(Some(job)) => {
                        self.publish(&job).await?;
                        stats.jobs += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Skipping object after evaluation error: {}", e);
                        stats.errors += 1;
                    }
                }
            }
            if exhausted {
                return Ok(());
            }
        }
    }

    async fn evaluate_object(
        &self,
        ctx: &EvalContext,
        plan: &BucketPlan,
        object: Object,
        latest: &mut Option<LatestVersion>,
    ) -> Result<Option<LifecycleJob>> {
        if !plan.bucket.versioning.is_versioned() {
            let facts = ObjectFacts {
                name: &object.name,
                tags: &object.tags,
                storage_class: object.storage_class,
                mod_time: object.last_modified,
                lone_delete_marker: false,
            };
            let (action, class) = compute_action(ctx, &facts, &plan.rules.current);
            return Ok(job_for(object, action, class));
        }

        let cached = latest.as_ref().map(|l| l.name == object.name).unwrap_or(false);
        if !cached {
            *latest = Some(self.latest_version(&object.bucket, &object.name).await?);
        }
        let Some(current) = latest.as_ref() else {
            return Ok(None);
        };

        let (action, class) = if object.version_id == current.version_id {
            let facts = ObjectFacts {
                name: &object.name,
                tags: &object.tags,
                storage_class: object.storage_class,
                mod_time: object.last_modified,
                lone_delete_marker: current.lone_delete_marker,
            };
            let decision = compute_action(ctx, &facts, &plan.rules.current);
            // Markers hiding older versions are only removed by their own rule.
            if object.delete_marker && decision.0 != Action::DeleteMarker {
                (Action::None, None)
            } else {
                decision
            }
        } else {
            let facts = ObjectFacts {
                name: &object.name,
                tags: &object.tags,
                storage_class: object.storage_class,
                mod_time: current.last_modified,
                lone_delete_marker: false,
            };
            let decision = compute_action_for_noncurrent(ctx, &facts, &plan.rules.noncurrent);
            if object.delete_marker && decision.0 == Action::Transition {
                (Action::None, None)
            } else {
                decision
            }
        };
        Ok(job_for(object, action, class))
    }

    async fn latest_version(&self, bucket: &str, name: &str) -> Result<LatestVersion> {
        let latest = self.meta.get_latest_object(bucket, name).await?;
        let lone_delete_marker = latest.delete_marker
            && !self
                .meta
                .other_versions_exist(bucket, name, &latest.version_id)
                .await?;
        Ok(LatestVersion {
            name: name.to_string(),
            version_id: latest.version_id,
            last_modified: latest.last_modified,
            lone_delete_marker,
        })
    }

    #[instrument(skip(self, ctx, plan, stats), fields(bucket = %plan.bucket.name))]
    async fn scan_multiparts(&self, ctx: &EvalContext, plan: &BucketPlan, stats: &mut ScanStats) -> Result<()> {
        let Some((mut cursor, end)) =
            self.clip(keys::multipart_prefix_range(&plan.bucket.name, &plan.prefix))
        else {
            return Ok(());
        };

        loop {
            let rows = self.meta.kv().scan(&cursor, &end, self.config.batch).await?;
            let exhausted = rows.len() < self.config.batch;
            for (key, raw) in rows {
                cursor = next_key(&key);
                stats.scanned += 1;
                metrics::lifecycle_scanned();

                let upload: Multipart = match decode(&raw) {
                    Ok(upload) => upload,
                    Err(e) => {
                        warn!("Skipping undecodable multipart record: {}", e);
                        stats.errors += 1;
                        continue;
                    }
                };
                let initiated = decode_upload_id(&upload.upload_id).unwrap_or(upload.initial_time);
                let action = compute_action_for_abort(ctx, &upload.object, initiated, &plan.rules.abort);
                if action == Action::AbortMultipartUpload {
                    self.publish(&LifecycleJob::for_multipart(upload)).await?;
                    stats.jobs += 1;
                }
            }
            if exhausted {
                return Ok(());
            }
        }
    }

    async fn publish(&self, job: &LifecycleJob) -> Result<()> {
        let payload = job.encode()?;
        self.bus
            .publish(&self.config.topic, job.key(), payload)
            .await?;
        metrics::lifecycle_job(job.action.name());
        debug!(
            "Published {:?} for {}/{}",
            job.action,
            job.bucket(),
            job.key()
        );
        Ok(())
    }
}

fn job_for(
    object: Object,
    action: Action,
    class: Option<StorageClass>,
) -> Option<LifecycleJob> {
    if action == Action::None {
        return None;
    }
    Some(LifecycleJob::for_object(object, action, class))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryMessageCollector, MemoryKvStore};
    use crate::domain::Pool;
    use crate::meta::{version_id_for, ObjectType, VersioningStatus, NULL_VERSION};
    use std::collections::BTreeMap;

    const EXPIRE_FOODIR: &str = "<LifecycleConfiguration><Rule><Status>Enabled</Status>\
        <Filter><Prefix>foodir/</Prefix></Filter><Expiration><Days>5</Days></Expiration>\
        </Rule></LifecycleConfiguration>";

    fn object(bucket: &str, name: &str, version_id: &str, at: DateTime<Utc>) -> Object {
        Object {
            bucket: bucket.into(),
            name: name.into(),
            version_id: version_id.into(),
            location: "c1".into(),
            pool: Pool::Small,
            owner_id: "o".into(),
            size: 1,
            object_id: format!("{}-{}", name, version_id),
            last_modified: at,
            etag: String::new(),
            content_type: String::new(),
            custom_attrs: BTreeMap::new(),
            tags: BTreeMap::new(),
            parts: BTreeMap::new(),
            storage_class: StorageClass::Standard,
            object_type: ObjectType::Normal,
            delete_marker: false,
            null_version: version_id == NULL_VERSION,
        }
    }

    async fn setup(
        lifecycle: &str,
        versioning: VersioningStatus,
    ) -> (MetaStore, Arc<InMemoryMessageCollector>) {
        let meta = MetaStore::new(Arc::new(MemoryKvStore::new()));
        let mut bucket = Bucket::new("b", "o");
        bucket.versioning = versioning;
        bucket.lifecycle_xml = Some(lifecycle.to_string());
        meta.put_bucket(&bucket).await.unwrap();
        (meta, Arc::new(InMemoryMessageCollector::new()))
    }

    fn scanner(meta: &MetaStore, bus: &Arc<InMemoryMessageCollector>) -> LifecycleScanner {
        LifecycleScanner::new(ScannerConfig::default(), meta.clone(), bus.clone())
    }

    fn jobs(bus: &InMemoryMessageCollector) -> Vec<LifecycleJob> {
        bus.messages()
            .iter()
            .map(|m| LifecycleJob::decode(&m.payload).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_unversioned_expiration() {
        let (meta, bus) = setup(EXPIRE_FOODIR, VersioningStatus::Disabled).await;
        let now = Utc::now();
        let old = now - chrono::Duration::days(6);
        meta.put_object(&object("b", "foodir/x", NULL_VERSION, old)).await.unwrap();
        meta.put_object(&object("b", "foxdir/x", NULL_VERSION, old)).await.unwrap();
        meta.put_object(&object("b", "foodir/new", NULL_VERSION, now)).await.unwrap();

        let stats = scanner(&meta, &bus).scan_at(now).await.unwrap();
        assert_eq!(stats.jobs, 1);
        // The common prefix keeps foxdir out of the walk.
        assert_eq!(stats.scanned, 2);

        let jobs = jobs(&bus);
        assert_eq!(jobs[0].action, Action::Delete);
        assert_eq!(jobs[0].key(), "foodir/x");
        assert_eq!(bus.messages()[0].topic, "lifecycle");
        assert_eq!(bus.messages()[0].key, "foodir/x");
    }

    #[tokio::test]
    async fn test_versioned_noncurrent_expiration() {
        let lifecycle = "<LifecycleConfiguration><Rule><Status>Enabled</Status>\
            <NoncurrentVersionExpiration><NoncurrentDays>3</NoncurrentDays>\
            </NoncurrentVersionExpiration></Rule></LifecycleConfiguration>";
        let (meta, bus) = setup(lifecycle, VersioningStatus::Enabled).await;
        let now = Utc::now();
        let old = now - chrono::Duration::days(10);
        let replaced = now - chrono::Duration::days(4);
        meta.put_object(&object("b", "k", &version_id_for(old), old)).await.unwrap();
        meta.put_object(&object("b", "k", &version_id_for(replaced), replaced))
            .await
            .unwrap();

        let stats = scanner(&meta, &bus).scan_at(now).await.unwrap();
        assert_eq!(stats.jobs, 1);
        let job = &jobs(&bus)[0];
        assert_eq!(job.action, Action::Delete);
        assert_eq!(job.object.as_ref().unwrap().version_id, version_id_for(old));
    }

    #[tokio::test]
    async fn test_lone_delete_marker_job() {
        let lifecycle = "<LifecycleConfiguration><Rule><Status>Enabled</Status><Expiration>\
            <ExpiredObjectDeleteMarker>true</ExpiredObjectDeleteMarker></Expiration>\
            </Rule></LifecycleConfiguration>";
        let (meta, bus) = setup(lifecycle, VersioningStatus::Enabled).await;
        let now = Utc::now();
        let mut marker = object("b", "gone", &version_id_for(now), now);
        marker.delete_marker = true;
        marker.object_id.clear();
        meta.put_object(&marker).await.unwrap();

        scanner(&meta, &bus).scan_at(now).await.unwrap();
        let jobs = jobs(&bus);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].action, Action::DeleteMarker);
    }

    #[tokio::test]
    async fn test_abort_incomplete_multipart() {
        let lifecycle = "<LifecycleConfiguration><Rule><Status>Enabled</Status>\
            <AbortIncompleteMultipartUpload><DaysAfterInitiation>7</DaysAfterInitiation>\
            </AbortIncompleteMultipartUpload></Rule></LifecycleConfiguration>";
        let (meta, bus) = setup(lifecycle, VersioningStatus::Disabled).await;
        let now = Utc::now();
        for (name, age) in [("stale", 8), ("fresh", 1)] {
            let initial_time = now - chrono::Duration::days(age);
            meta.put_multipart(&Multipart {
                bucket: "b".into(),
                object: name.into(),
                upload_id: crate::meta::encode_upload_id(initial_time).unwrap(),
                initial_time,
                owner_id: "o".into(),
                storage_class: StorageClass::Standard,
                location: "c1".into(),
                pool: Pool::Big,
                content_type: String::new(),
                parts: BTreeMap::new(),
            })
            .await
            .unwrap();
        }

        let stats = scanner(&meta, &bus).scan_at(now).await.unwrap();
        assert_eq!(stats.jobs, 1);
        let job = &jobs(&bus)[0];
        assert_eq!(job.action, Action::AbortMultipartUpload);
        assert_eq!(job.key(), "stale");
    }

    #[tokio::test]
    async fn test_assigned_range_limits_scan() {
        let (meta, bus) = setup(EXPIRE_FOODIR, VersioningStatus::Disabled).await;
        let now = Utc::now();
        let old = now - chrono::Duration::days(6);
        meta.put_object(&object("b", "foodir/a", NULL_VERSION, old)).await.unwrap();
        meta.put_object(&object("b", "foodir/z", NULL_VERSION, old)).await.unwrap();

        let config = ScannerConfig {
            range_start: keys::object_key("b", "foodir/m", ""),
            ..Default::default()
        };
        let scanner = LifecycleScanner::new(config, meta.clone(), bus.clone());
        let stats = scanner.scan_at(now).await.unwrap();
        assert_eq!(stats.jobs, 1);
        assert_eq!(jobs(&bus)[0].key(), "foodir/z");
    }

    #[tokio::test]
    async fn test_bad_lifecycle_is_skipped() {
        let (meta, bus) = setup("<LifecycleConfiguration/>", VersioningStatus::Disabled).await;
        meta.put_object(&object("b", "x", NULL_VERSION, Utc::now() - chrono::Duration::days(100)))
            .await
            .unwrap();
        let stats = scanner(&meta, &bus).scan_at(Utc::now()).await.unwrap();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.buckets, 0);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_config_from_gateway() {
        let mut gateway = GatewayConfig::default();
        gateway.lifecycle.scan_start = "6f1f".into();
        let config = ScannerConfig::from_gateway(&gateway).unwrap();
        assert_eq!(config.range_start, vec![b'o', 0x1f]);
        assert!(config.range_end.is_empty());

        gateway.lifecycle.scan_end = "zz".into();
        assert!(matches!(
            ScannerConfig::from_gateway(&gateway),
            Err(Error::Config(_))
        ));
    }
}
