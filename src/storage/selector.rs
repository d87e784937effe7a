//! Cluster and Pool Selection
//!
//! Picks the pool from object size, append mode and storage class, then a
//! cluster for that pool by weighted random choice among clusters whose
//! weight is positive and whose usage is under the admission limit.
//!
//! The chosen cluster is memoised per pool. Usage is re-sampled at most once
//! per refresh interval; the refresh is claimed through an atomic timestamp
//! so concurrent callers never sample twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::domain::{Cluster, Pool};
use crate::error::{Error, Result};
use crate::meta::StorageClass;

/// Clusters above this usage percentage take no new writes.
pub const CLUSTER_MAX_USED_SPACE_PERCENT: u8 = 85;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for cluster selection
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Objects strictly smaller than this go to the small pool
    pub small_object_threshold: u64,

    /// Usage admission limit in percent
    pub max_used_percent: u8,

    /// Minimum time between usage samples
    pub usage_refresh: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            small_object_threshold: 512 << 10,
            max_used_percent: CLUSTER_MAX_USED_SPACE_PERCENT,
            usage_refresh: Duration::from_secs(24 * 3600),
        }
    }
}

impl SelectorConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Result<Self> {
        Ok(Self {
            small_object_threshold: config.storage.small_object_threshold,
            max_used_percent: config.storage.cluster_max_used_percent,
            usage_refresh: crate::config::parse_duration(&config.storage.usage_refresh_interval)?,
        })
    }
}

/// Selection weight of one cluster for one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterWeight {
    pub cluster_id: String,
    pub pool: Pool,
    pub weight: u32,
}

impl ClusterWeight {
    /// Weights declared in configuration.
    pub fn from_gateway(config: &GatewayConfig) -> Vec<ClusterWeight> {
        let mut weights = Vec::new();
        for cluster in &config.clusters {
            for (pool_name, weight) in &cluster.weights {
                match Pool::from_name(pool_name) {
                    Some(pool) => weights.push(ClusterWeight {
                        cluster_id: cluster.id.clone(),
                        pool,
                        weight: *weight,
                    }),
                    None => warn!("Ignoring weight for unknown pool {:?}", pool_name),
                }
            }
        }
        weights
    }
}

// =============================================================================
// Selector
// =============================================================================

/// Picks a cluster and pool for new writes.
pub struct ClusterSelector {
    config: SelectorConfig,
    clusters: Vec<Arc<dyn Cluster>>,
    by_id: HashMap<String, Arc<dyn Cluster>>,
    weights: Vec<ClusterWeight>,
    memo: DashMap<Pool, String>,
    last_refresh: [AtomicI64; 3],
    usage: DashMap<String, u8>,
    rng: Mutex<StdRng>,
}

fn pool_slot(pool: Pool) -> usize {
    match pool {
        Pool::Small => 0,
        Pool::Big => 1,
        Pool::Cold => 2,
    }
}

impl ClusterSelector {
    pub fn new(
        config: SelectorConfig,
        clusters: HashMap<String, Arc<dyn Cluster>>,
        weights: Vec<ClusterWeight>,
    ) -> Self {
        let mut ordered: Vec<Arc<dyn Cluster>> = clusters.values().cloned().collect();
        ordered.sort_by(|a, b| a.id().cmp(b.id()));
        Self {
            config,
            clusters: ordered,
            by_id: clusters,
            weights,
            memo: DashMap::new(),
            last_refresh: [AtomicI64::new(0), AtomicI64::new(0), AtomicI64::new(0)],
            usage: DashMap::new(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Use a deterministic random source.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Look up a cluster by id.
    pub fn cluster(&self, id: &str) -> Result<Arc<dyn Cluster>> {
        self.by_id
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("unknown cluster {}", id)))
    }

    /// All clusters, ordered by id.
    pub fn clusters(&self) -> &[Arc<dyn Cluster>] {
        &self.clusters
    }

    /// Pool for an object.
    ///
    /// Archive classes go cold, appends and large or unsized objects go big,
    /// everything else small.
    pub fn pick_pool(&self, size: Option<u64>, is_append: bool, class: StorageClass) -> Pool {
        if class.is_archive() {
            return Pool::Cold;
        }
        if is_append {
            return Pool::Big;
        }
        match size {
            Some(size) if size < self.config.small_object_threshold => Pool::Small,
            _ => Pool::Big,
        }
    }

    /// Pick pool and cluster for a new write.
    pub async fn pick(
        &self,
        size: Option<u64>,
        is_append: bool,
        class: StorageClass,
    ) -> Result<(Arc<dyn Cluster>, Pool)> {
        let pool = self.pick_pool(size, is_append, class);
        let cluster = self.pick_cluster(pool).await?;
        Ok((cluster, pool))
    }

    /// Pick a cluster for `pool`.
    pub async fn pick_cluster(&self, pool: Pool) -> Result<Arc<dyn Cluster>> {
        if self.clusters.is_empty() {
            return Err(Error::Config("no clusters configured".to_string()));
        }

        if self.claim_refresh(pool) {
            self.sample_usage().await;
            self.memo.remove(&pool);
        }

        if let Some(id) = self.memo.get(&pool).map(|e| e.value().clone()) {
            if let Some(cluster) = self.by_id.get(&id) {
                return Ok(cluster.clone());
            }
        }

        let chosen = self.choose(pool).await;
        debug!("Pool {} now writes to cluster {}", pool, chosen.id());
        self.memo.insert(pool, chosen.id().to_string());
        Ok(chosen)
    }

    /// Claim the usage refresh for `pool` if it is due.
    fn claim_refresh(&self, pool: Pool) -> bool {
        let slot = &self.last_refresh[pool_slot(pool)];
        let now = Utc::now().timestamp();
        let last = slot.load(Ordering::Acquire);
        let due = last == 0 || now.saturating_sub(last) >= self.config.usage_refresh.as_secs() as i64;
        due && slot
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn sample_usage(&self) {
        for cluster in &self.clusters {
            let pct = match cluster.usage().await {
                Ok(usage) => usage.percent(),
                Err(e) => {
                    warn!("Usage of cluster {} unavailable: {}", cluster.id(), e);
                    100
                }
            };
            self.usage.insert(cluster.id().to_string(), pct);
        }
        info!("Sampled usage of {} clusters", self.clusters.len());
    }

    async fn usage_of(&self, cluster: &Arc<dyn Cluster>) -> u8 {
        if let Some(pct) = self.usage.get(cluster.id()) {
            return *pct;
        }
        let pct = cluster.usage().await.map(|u| u.percent()).unwrap_or(100);
        self.usage.insert(cluster.id().to_string(), pct);
        pct
    }

    async fn choose(&self, pool: Pool) -> Arc<dyn Cluster> {
        let mut candidates: Vec<(Arc<dyn Cluster>, u32)> = Vec::new();
        for cluster in &self.clusters {
            let weight = self
                .weights
                .iter()
                .find(|w| w.pool == pool && w.cluster_id == cluster.id())
                .map(|w| w.weight)
                .unwrap_or(0);
            if weight == 0 {
                continue;
            }
            if self.usage_of(cluster).await > self.config.max_used_percent {
                continue;
            }
            candidates.push((cluster.clone(), weight));
        }

        let total: u64 = candidates.iter().map(|(_, w)| *w as u64).sum();
        if total == 0 {
            warn!("No eligible cluster for pool {}, falling back", pool);
            return self.clusters[0].clone();
        }

        let mut roll = self.rng.lock().gen_range(0..total);
        for (cluster, weight) in &candidates {
            if roll < *weight as u64 {
                return cluster.clone();
            }
            roll -= *weight as u64;
        }
        candidates[candidates.len() - 1].0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryObjectStore, StripedCluster, StripedClusterConfig};
    use crate::domain::Usage;

    fn cluster_with_usage(id: &str, pct: u64) -> Arc<dyn Cluster> {
        let store = Arc::new(MemoryObjectStore::new(id));
        store.set_usage(Usage {
            kb: 100,
            kb_used: pct,
        });
        Arc::new(StripedCluster::new(store, StripedClusterConfig::default()))
    }

    fn weight(id: &str, pool: Pool, weight: u32) -> ClusterWeight {
        ClusterWeight {
            cluster_id: id.into(),
            pool,
            weight,
        }
    }

    fn selector(clusters: Vec<Arc<dyn Cluster>>, weights: Vec<ClusterWeight>) -> ClusterSelector {
        let map = clusters
            .into_iter()
            .map(|c| (c.id().to_string(), c))
            .collect();
        ClusterSelector::new(SelectorConfig::default(), map, weights).with_seed(7)
    }

    #[test]
    fn test_pick_pool() {
        let s = selector(vec![cluster_with_usage("a", 0)], vec![]);
        assert_eq!(s.pick_pool(Some(10), false, StorageClass::Standard), Pool::Small);
        assert_eq!(s.pick_pool(Some(10 << 20), false, StorageClass::Standard), Pool::Big);
        assert_eq!(s.pick_pool(None, false, StorageClass::Standard), Pool::Big);
        assert_eq!(s.pick_pool(Some(10), true, StorageClass::Standard), Pool::Big);
        assert_eq!(s.pick_pool(Some(10), false, StorageClass::Glacier), Pool::Cold);
        assert_eq!(s.pick_pool(Some(10), true, StorageClass::DeepArchive), Pool::Cold);
    }

    #[tokio::test]
    async fn test_skips_full_and_zero_weight_clusters() {
        let s = selector(
            vec![
                cluster_with_usage("full", 90),
                cluster_with_usage("ok", 50),
                cluster_with_usage("unweighted", 0),
            ],
            vec![
                weight("full", Pool::Big, 10),
                weight("ok", Pool::Big, 1),
                weight("unweighted", Pool::Big, 0),
            ],
        );
        for _ in 0..10 {
            let picked = s.pick_cluster(Pool::Big).await.unwrap();
            assert_eq!(picked.id(), "ok");
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_first_cluster() {
        let s = selector(
            vec![cluster_with_usage("b", 99), cluster_with_usage("a", 99)],
            vec![weight("a", Pool::Big, 1), weight("b", Pool::Big, 1)],
        );
        assert_eq!(s.pick_cluster(Pool::Big).await.unwrap().id(), "a");
    }

    #[tokio::test]
    async fn test_choice_is_memoised() {
        let s = selector(
            vec![cluster_with_usage("a", 10), cluster_with_usage("b", 10)],
            vec![weight("a", Pool::Big, 1), weight("b", Pool::Big, 1)],
        );
        let first = s.pick_cluster(Pool::Big).await.unwrap().id().to_string();
        for _ in 0..20 {
            assert_eq!(s.pick_cluster(Pool::Big).await.unwrap().id(), first);
        }
    }

    #[tokio::test]
    async fn test_weighted_choice_honours_weights() {
        let clusters: HashMap<String, Arc<dyn Cluster>> = [
            ("a".to_string(), cluster_with_usage("a", 10)),
            ("b".to_string(), cluster_with_usage("b", 10)),
        ]
        .into_iter()
        .collect();
        let weights = vec![weight("a", Pool::Big, 1), weight("b", Pool::Big, 9)];
        let mut picks_b = 0;
        for seed in 0..200 {
            let s = ClusterSelector::new(SelectorConfig::default(), clusters.clone(), weights.clone())
                .with_seed(seed);
            if s.pick_cluster(Pool::Big).await.unwrap().id() == "b" {
                picks_b += 1;
            }
        }
        assert!(picks_b > 140, "b picked {} of 200", picks_b);
    }

    #[tokio::test]
    async fn test_no_clusters() {
        let s = ClusterSelector::new(SelectorConfig::default(), HashMap::new(), vec![]);
        assert!(s.pick_cluster(Pool::Big).await.is_err());
    }

    #[test]
    fn test_weights_from_config() {
        let config = GatewayConfig::default();
        let weights = ClusterWeight::from_gateway(&config);
        assert!(weights.is_empty());

        let mut config = GatewayConfig::default();
        config.clusters.push(crate::config::ClusterConfig::default());
        let weights = ClusterWeight::from_gateway(&config);
        assert_eq!(weights.len(), 3);
    }
}
