//! Recycle Queue
//!
//! Removes backend blobs whose metadata is gone or was never committed.
//! Producers push onto an unbounded channel and never wait; a pool of
//! workers drains it and calls the owning cluster's `remove`.
//!
//! ```text
//! data path ──enqueue──▶ [channel] ──▶ worker × N ──remove──▶ cluster
//!                            ▲              │
//!                            │       retry (≤ max_tries, backoff)
//!   GC table ──load on start─┘              │
//!       ▲                                   │
//!       └──── exhausted / flushed on shutdown
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::GatewayConfig;
use crate::domain::{BackendTuple, Cluster};
use crate::error::Result;
use crate::meta::{GarbageRecord, MetaStore};
use crate::metrics;

/// Removal attempts before a blob is parked in the GC table.
pub const MAX_TRY_TIMES: u32 = 3;

/// GC rows loaded per startup page.
const GC_LOAD_PAGE: usize = 1000;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the recycle queue
#[derive(Debug, Clone)]
pub struct RecycleQueueConfig {
    /// Worker tasks draining the queue
    pub workers: usize,

    /// Removal attempts per blob
    pub max_tries: u32,

    /// Delay before the first retry; grows linearly per attempt
    pub backoff_base: Duration,

    /// Upper bound of the retry delay
    pub backoff_cap: Duration,
}

impl Default for RecycleQueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_tries: MAX_TRY_TIMES,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(5),
        }
    }
}

impl RecycleQueueConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Result<Self> {
        Ok(Self {
            workers: config.recycle.workers.max(1),
            max_tries: config.recycle.max_tries.max(1),
            backoff_cap: crate::config::parse_duration(&config.recycle.backoff_cap)?,
            ..Default::default()
        })
    }

    fn backoff(&self, tried_times: u32) -> Duration {
        self.backoff_base
            .saturating_mul(tried_times.max(1))
            .min(self.backoff_cap)
    }
}

/// A blob waiting for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecycleItem {
    pub tuple: BackendTuple,
    pub tried_times: u32,
}

// =============================================================================
// Recycle Queue
// =============================================================================

/// Asynchronous backend blob removal.
pub struct RecycleQueue {
    config: RecycleQueueConfig,
    clusters: HashMap<String, Arc<dyn Cluster>>,
    meta: MetaStore,
    tx: mpsc::UnboundedSender<RecycleItem>,
    rx: Mutex<mpsc::UnboundedReceiver<RecycleItem>>,
    pending: AtomicUsize,
}

impl RecycleQueue {
    pub fn new(
        config: RecycleQueueConfig,
        clusters: HashMap<String, Arc<dyn Cluster>>,
        meta: MetaStore,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            clusters,
            meta,
            tx,
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
        })
    }

    /// Queue a blob for removal. Never blocks.
    pub fn enqueue(&self, tuple: BackendTuple) {
        self.push(RecycleItem {
            tuple,
            tried_times: 0,
        });
    }

    /// Queue every blob in `tuples`.
    pub fn enqueue_all(&self, tuples: impl IntoIterator<Item = BackendTuple>) {
        for tuple in tuples {
            self.enqueue(tuple);
        }
    }

    fn push(&self, item: RecycleItem) {
        debug!("Recycling {} (tried {})", item.tuple, item.tried_times);
        self.pending.fetch_add(1, Ordering::Relaxed);
        metrics::recycle_pending(1);
        if let Err(e) = self.tx.send(item) {
            // Receiver lives in self, so this only happens while dropping.
            self.pending.fetch_sub(1, Ordering::Relaxed);
            metrics::recycle_pending(-1);
            error!("Recycle queue closed, dropping {}", e.0.tuple);
        }
    }

    /// Blobs queued or being removed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Move persisted GC rows back onto the queue.
    #[instrument(skip(self))]
    pub async fn load_persisted(&self) -> Result<usize> {
        let mut loaded = 0;
        loop {
            let rows = self.meta.list_garbage(GC_LOAD_PAGE).await?;
            if rows.is_empty() {
                break;
            }
            let page = rows.len();
            for row in rows {
                // Queue first; the row goes only once the blob is queued.
                self.push(RecycleItem {
                    tuple: row.tuple.clone(),
                    // Fresh budget for this process.
                    tried_times: 0,
                });
                loaded += 1;
                self.meta.delete_garbage(&row.tuple).await?;
            }
            if page < GC_LOAD_PAGE {
                break;
            }
        }
        if loaded > 0 {
            info!("Loaded {} garbage records into the recycle queue", loaded);
        }
        Ok(loaded)
    }

    /// Run the workers until `shutdown`, then flush what is left.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting recycle queue with {:?}", self.config);

        let mut workers = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let queue = Arc::clone(&self);
            let token = shutdown.clone();
            workers.push(tokio::spawn(async move {
                queue.worker(worker_id, token).await;
            }));
        }
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Recycle worker panicked: {}", e);
            }
        }

        match self.flush().await {
            Ok(0) => info!("Recycle queue stopped"),
            Ok(n) => info!("Recycle queue stopped, {} blobs parked for next start", n),
            Err(e) => error!("Failed to flush recycle queue: {}", e),
        }
    }

    async fn worker(&self, worker_id: usize, shutdown: CancellationToken) {
        debug!("Recycle worker {} started", worker_id);
        loop {
            let item = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    item = rx.recv() => item,
                }
            };
            let Some(item) = item else {
                break;
            };
            self.process(item, &shutdown).await;
        }
        debug!("Recycle worker {} stopped", worker_id);
    }

    /// One removal attempt.
    async fn process(&self, item: RecycleItem, shutdown: &CancellationToken) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
        metrics::recycle_pending(-1);

        let tried_times = item.tried_times + 1;
        let Some(cluster) = self.clusters.get(&item.tuple.cluster_id) else {
            warn!("Unknown cluster for {}, parking it", item.tuple);
            self.park(item.tuple, tried_times).await;
            return;
        };

        match cluster.remove(item.tuple.pool, &item.tuple.object_id).await {
            Ok(()) => {
                debug!("Removed {}", item.tuple);
                metrics::recycle_removed();
            }
            Err(e) if tried_times >= self.config.max_tries => {
                warn!(
                    "Giving up on {} after {} attempts: {}",
                    item.tuple, tried_times, e
                );
                metrics::recycle_failed();
                self.park(item.tuple, tried_times).await;
            }
            Err(e) => {
                let delay = self.config.backoff(tried_times);
                warn!(
                    "Failed to remove {} (attempt {}), retrying in {:?}: {}",
                    item.tuple, tried_times, delay, e
                );
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        self.park(item.tuple, tried_times).await;
                    }
                    _ = tokio::time::sleep(delay) => {
                        self.push(RecycleItem {
                            tuple: item.tuple,
                            tried_times,
                        });
                    }
                }
            }
        }
    }

    /// Persist a blob into the GC table.
    async fn park(&self, tuple: BackendTuple, tried_times: u32) {
        let record = GarbageRecord::pending(tuple, tried_times);
        if let Err(e) = self.meta.put_garbage(&record).await {
            error!("Failed to persist garbage record {}: {}", record.tuple, e);
        }
    }

    /// Drain the channel into the GC table. Returns blobs persisted, or the
    /// first failure once every item has been tried.
    pub async fn flush(&self) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        let mut flushed = 0;
        let mut first_error = None;
        while let Ok(item) = rx.try_recv() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            metrics::recycle_pending(-1);
            let record = GarbageRecord::pending(item.tuple, item.tried_times);
            match self.meta.put_garbage(&record).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    error!("Failed to persist garbage record {}: {}", record.tuple, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryKvStore, MemoryObjectStore, StripedCluster, StripedClusterConfig};
    use crate::domain::Pool;
    use crate::error::Error;
    use std::io::Cursor;

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        cluster: Arc<dyn Cluster>,
        kv: Arc<MemoryKvStore>,
        meta: MetaStore,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryObjectStore::new("c1"));
        let cluster: Arc<dyn Cluster> = Arc::new(StripedCluster::new(
            store.clone(),
            StripedClusterConfig::default(),
        ));
        let kv = Arc::new(MemoryKvStore::new());
        Fixture {
            store,
            cluster,
            meta: MetaStore::new(kv.clone()),
            kv,
        }
    }

    fn fast_config() -> RecycleQueueConfig {
        RecycleQueueConfig {
            workers: 2,
            max_tries: 3,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
        }
    }

    fn queue(f: &Fixture) -> Arc<RecycleQueue> {
        let clusters = HashMap::from([("c1".to_string(), f.cluster.clone())]);
        RecycleQueue::new(fast_config(), clusters, f.meta.clone())
    }

    async fn wait_idle(queue: &RecycleQueue) {
        for _ in 0..500 {
            if queue.pending() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("recycle queue did not drain");
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RecycleQueueConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_secs(1));
        assert_eq!(config.backoff(100), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_removes_enqueued_blob() {
        let f = fixture();
        let put = f
            .cluster
            .put(Pool::Small, &mut Cursor::new(b"hello".to_vec()))
            .await
            .unwrap();
        assert!(f.store.contains("small", &put.object_id));

        let queue = queue(&f);
        let token = CancellationToken::new();
        let handle = tokio::spawn(queue.clone().run(token.clone()));

        queue.enqueue(BackendTuple::new("c1", Pool::Small, &put.object_id));
        wait_idle(&queue).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!f.store.contains("small", &put.object_id));

        token.cancel();
        handle.await.unwrap();
        assert!(f.meta.list_garbage(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_parked() {
        let f = fixture();
        f.store.fail_next_removes(10);
        let queue = queue(&f);
        let token = CancellationToken::new();
        let handle = tokio::spawn(queue.clone().run(token.clone()));

        let tuple = BackendTuple::new("c1", Pool::Small, "gone");
        queue.enqueue(tuple.clone());

        let mut parked = Vec::new();
        for _ in 0..500 {
            parked = f.meta.list_garbage(10).await.unwrap();
            if !parked.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].tuple, tuple);
        assert_eq!(parked[0].tried_times, 3);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_cluster_is_parked() {
        let f = fixture();
        let queue = queue(&f);
        let token = CancellationToken::new();
        let handle = tokio::spawn(queue.clone().run(token.clone()));

        queue.enqueue(BackendTuple::new("nowhere", Pool::Big, "x"));
        wait_idle(&queue).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(f.meta.list_garbage(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_and_reload() {
        let f = fixture();
        let queue = queue(&f);
        queue.enqueue_all(vec![
            BackendTuple::new("c1", Pool::Big, "a"),
            BackendTuple::new("c1", Pool::Big, "b"),
        ]);
        assert_eq!(queue.pending(), 2);

        // Never started: everything goes to the GC table.
        assert_eq!(queue.flush().await.unwrap(), 2);
        assert_eq!(queue.pending(), 0);
        assert_eq!(f.meta.list_garbage(10).await.unwrap().len(), 2);

        let restarted = self::queue(&f);
        assert_eq!(restarted.load_persisted().await.unwrap(), 2);
        assert_eq!(restarted.pending(), 2);
        assert!(f.meta.list_garbage(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flush_keeps_going_after_a_failed_write() {
        let f = fixture();
        let queue = queue(&f);
        queue.enqueue_all(vec![
            BackendTuple::new("c1", Pool::Big, "a"),
            BackendTuple::new("c1", Pool::Big, "b"),
            BackendTuple::new("c1", Pool::Big, "c"),
        ]);

        f.kv.fail_next_writes(1);
        assert!(matches!(queue.flush().await, Err(Error::Metadata(_))));
        assert_eq!(queue.pending(), 0);
        let parked = f.meta.list_garbage(10).await.unwrap();
        let names: Vec<_> = parked.iter().map(|r| r.tuple.object_id.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_reload_keeps_rows_until_queued() {
        let f = fixture();
        for name in ["a", "b"] {
            f.meta
                .put_garbage(&GarbageRecord::pending(
                    BackendTuple::new("c1", Pool::Big, name),
                    1,
                ))
                .await
                .unwrap();
        }

        let queue = queue(&f);
        f.kv.set_fail_writes(true);
        assert!(queue.load_persisted().await.is_err());
        // The row being loaded is already queued and still on disk.
        assert_eq!(queue.pending(), 1);
        assert_eq!(f.meta.list_garbage(10).await.unwrap().len(), 2);

        f.kv.set_fail_writes(false);
        assert_eq!(queue.load_persisted().await.unwrap(), 2);
        assert!(f.meta.list_garbage(10).await.unwrap().is_empty());
    }
}
