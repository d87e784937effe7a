//! Property-Based Tests for the Data Path
//!
//! # Test Properties
//!
//! 1. **Window Bounds**: the adaptive window never leaves `[min, max]`
//! 2. **Byte Accounting**: bytes written equal bytes read from the source
//! 3. **Bounded Pipelining**: never more than the configured writes in flight
//! 4. **Ordering**: newer version ids sort before older ones
//! 5. **Round Trip**: objects written through the data path read back
//!    identically, whole and by range, under any stripe layout

#![cfg(test)]

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use proptest::prelude::*;

use super::writer::{ChunkSink, PipelinedWriter, WindowController, WriterConfig};
use super::{ClusterSelector, ClusterWeight, DataPath, RecycleQueue, RecycleQueueConfig, SelectorConfig};
use crate::adapters::{MemoryKvStore, MemoryObjectStore, StripeLayout, StripedCluster, StripedClusterConfig};
use crate::domain::{Cluster, Pool};
use crate::error::Result;
use crate::meta::{version_id_for, Bucket, MetaStore, StorageClass};

// =============================================================================
// Helpers
// =============================================================================

#[derive(Default)]
struct CountingSink {
    chunks: Mutex<BTreeMap<u64, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay_us: u64,
}

#[async_trait]
impl ChunkSink for CountingSink {
    async fn write_chunk(&self, offset: u64, data: Bytes) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if self.delay_us > 0 {
            tokio::time::sleep(Duration::from_micros(self.delay_us)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.chunks.lock().insert(offset, data.len());
        Ok(())
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime")
}

/// Objects below this size land in the small pool.
const SMALL_LIMIT: u64 = 16;

/// Data path over one in-memory striped cluster.
fn striped_data_path(layout: StripeLayout, min_chunk: u64, max_chunk: u64) -> DataPath {
    let store = Arc::new(MemoryObjectStore::new("c1"));
    let config = StripedClusterConfig {
        small_object_threshold: SMALL_LIMIT,
        layout,
        append_layout: layout,
        writer: WriterConfig {
            min_chunk,
            max_chunk,
            ..Default::default()
        },
    };
    let cluster: Arc<dyn Cluster> = Arc::new(StripedCluster::new(store, config));
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
        SelectorConfig {
            small_object_threshold: SMALL_LIMIT,
            ..Default::default()
        },
        clusters.clone(),
        weights,
    ));
    let meta = MetaStore::new(Arc::new(MemoryKvStore::new()));
    let recycle = RecycleQueue::new(RecycleQueueConfig::default(), clusters, meta.clone());
    DataPath::new(selector, meta, recycle)
}

/// Strategy for small valid stripe layouts.
fn layout_strategy() -> impl Strategy<Value = StripeLayout> {
    (1u64..=32, 1u64..=4, 1u64..=4).prop_map(|(unit, count, units_per_object)| StripeLayout {
        unit,
        count,
        object_size: unit * units_per_object,
    })
}

/// Strategy for window bounds `(min, max)` with `min <= max`.
fn bounds_strategy() -> impl Strategy<Value = (u64, u64)> {
    (1u64..=1 << 20, 0u32..=6).prop_map(|(min, shift)| (min, min << shift))
}

/// Strategy for (bytes filled, elapsed nanoseconds) observations.
fn observations_strategy() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..=u64::MAX / 2, 0u64..=10_000_000_000), 1..200)
}

// =============================================================================
// Window Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the window stays within its bounds for any timings.
    #[test]
    fn prop_window_within_bounds(
        (min, max) in bounds_strategy(),
        observations in observations_strategy(),
    ) {
        let mut window = WindowController::new(min, max);
        for (bytes, elapsed_ns) in observations {
            window.observe(bytes, Duration::from_nanos(elapsed_ns));
            prop_assert!(window.window() >= min);
            prop_assert!(window.window() <= max);
        }
    }

    /// Property: version ids order inversely to time.
    #[test]
    fn prop_version_ids_sort_newest_first(
        a in 0i64..4_000_000_000_000_000_000,
        b in 0i64..4_000_000_000_000_000_000,
    ) {
        prop_assume!(a != b);
        let (older, newer) = if a < b { (a, b) } else { (b, a) };
        let older = version_id_for(Utc.timestamp_nanos(older));
        let newer = version_id_for(Utc.timestamp_nanos(newer));
        prop_assert!(newer < older);
    }
}

// =============================================================================
// Writer Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: every source byte is written exactly once, contiguously,
    /// with bounded concurrency.
    #[test]
    fn prop_writer_accounts_for_every_byte(
        len in 0usize..200_000,
        min in 1u64..=4096,
        shift in 0u32..=4,
        concurrency in 1usize..=6,
        delay_us in 0u64..=200,
    ) {
        let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        let sink = Arc::new(CountingSink { delay_us, ..Default::default() });
        let config = WriterConfig {
            min_chunk: min,
            max_chunk: min << shift,
            concurrency,
            ..Default::default()
        };
        let writer = PipelinedWriter::new(config, sink.clone());

        let outcome = runtime().block_on(async {
            writer.write_all(&mut Cursor::new(data), 0).await
        })?;

        prop_assert_eq!(outcome.bytes, len as u64);
        prop_assert!(sink.max_in_flight.load(Ordering::SeqCst) <= concurrency);

        let chunks = sink.chunks.lock();
        prop_assert_eq!(chunks.len() as u64, outcome.chunks);
        let mut expected_offset = 0u64;
        for (offset, size) in chunks.iter() {
            prop_assert_eq!(*offset, expected_offset);
            prop_assert!(*size as u64 <= min << shift);
            expected_offset += *size as u64;
        }
        prop_assert_eq!(expected_offset, len as u64);
    }
}

// =============================================================================
// Data Path Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: any body up to twice the largest window reads back
    /// unchanged, in full and for an arbitrary range.
    #[test]
    fn prop_data_path_round_trip(
        layout in layout_strategy(),
        min_chunk in 1u64..=64,
        shift in 0u32..=3,
        len_seed in any::<u64>(),
        offset_seed in any::<u64>(),
        length_seed in any::<u64>(),
        seed in any::<u8>(),
    ) {
        let max_chunk = min_chunk << shift;
        let len = len_seed % (2 * max_chunk + 1);
        let data: Vec<u8> = (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();

        let (whole, ranged, range) = runtime().block_on(async {
            let path = striped_data_path(layout, min_chunk, max_chunk);
            let bucket = Bucket::new("b", "o");
            let object = path
                .upload_object(
                    &bucket,
                    "k",
                    "o",
                    &mut Cursor::new(data.clone()),
                    Some(len),
                    StorageClass::Standard,
                )
                .await?;

            let mut whole = Vec::new();
            path.get_object(&object, None, &mut whole).await?;

            let mut ranged = Vec::new();
            let mut range = None;
            if len > 0 {
                let offset = offset_seed % len;
                let length = 1 + length_seed % (len - offset);
                path.get_object(&object, Some((offset, length)), &mut ranged).await?;
                range = Some((offset as usize, (offset + length) as usize));
            }
            Ok::<_, crate::error::Error>((whole, ranged, range))
        })?;

        prop_assert_eq!(&whole, &data);
        if let Some((start, end)) = range {
            prop_assert_eq!(&ranged[..], &data[start..end]);
        }
    }
}
