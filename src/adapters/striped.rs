//! Striped Cluster Backend
//!
//! Stores blobs on a [`RawObjectStore`]. Small-pool blobs are written whole
//! as a single record. Big and cold pool blobs are striped over sub-objects
//! and written through the adaptive pipelined writer; their logical size is
//! kept in a head record named by the object id.
//!
//! Small-pool ids are `"{instance}:{counter}"`. Striped ids carry their
//! layout (`"{instance}:{counter}:{unit}:{count}:{size}"`) so that reads and
//! removes always re-apply the geometry used at write time, even after the
//! cluster's configured layout changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument, warn};

use super::layout::{Addressing, BlobReader, StripeLayout};
use crate::config::GatewayConfig;
use crate::domain::{BodyReader, Cluster, ObjectReader, Pool, PutResult, RawObjectStore, Usage};
use crate::error::{ApiErrorCode, Error, Result};
use crate::storage::writer::{ChunkSink, PipelinedWriter, WriterConfig};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a striped cluster
#[derive(Debug, Clone)]
pub struct StripedClusterConfig {
    /// Largest blob accepted by the small pool
    pub small_object_threshold: u64,

    /// Layout for new big/cold blobs, and for striped ids without one
    pub layout: StripeLayout,

    /// Layout recorded into ids created by append
    pub append_layout: StripeLayout,

    /// Pipelined writer settings
    pub writer: WriterConfig,
}

impl Default for StripedClusterConfig {
    fn default() -> Self {
        Self {
            small_object_threshold: 512 << 10,
            layout: StripeLayout::default(),
            append_layout: StripeLayout::default(),
            writer: WriterConfig::default(),
        }
    }
}

impl StripedClusterConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Result<Self> {
        let timeouts = config.timeouts.resolve()?;
        Ok(Self {
            small_object_threshold: config.storage.small_object_threshold,
            writer: WriterConfig {
                min_chunk: config.storage.upload_min_chunk,
                max_chunk: config.storage.upload_max_chunk,
                read_timeout: timeouts.read,
                write_timeout: timeouts.write,
                ..WriterConfig::default()
            },
            ..Self::default()
        })
    }
}

// =============================================================================
// Striped Sink
// =============================================================================

/// Writes pipelined chunks onto stripe sub-objects.
struct StripedSink {
    store: Arc<dyn RawObjectStore>,
    pool: String,
    object_id: String,
    layout: StripeLayout,
}

#[async_trait]
impl ChunkSink for StripedSink {
    async fn write_chunk(&self, offset: u64, data: Bytes) -> Result<()> {
        let mut written = 0usize;
        while written < data.len() {
            let placement = self.layout.locate(offset + written as u64);
            let take = (placement.unit_remaining as usize).min(data.len() - written);
            let name = StripeLayout::sub_object_name(&self.object_id, placement.object_no);
            self.store
                .write_at(
                    &self.pool,
                    &name,
                    placement.object_offset,
                    data.slice(written..written + take),
                )
                .await?;
            written += take;
        }
        Ok(())
    }
}

// =============================================================================
// Striped Cluster
// =============================================================================

/// [`Cluster`] striping large blobs over a record store.
pub struct StripedCluster {
    id: String,
    store: Arc<dyn RawObjectStore>,
    instance_id: String,
    counter: AtomicU64,
    config: StripedClusterConfig,
}

impl StripedCluster {
    pub fn new(store: Arc<dyn RawObjectStore>, config: StripedClusterConfig) -> Self {
        Self {
            id: store.fsid().to_string(),
            store,
            instance_id: uuid::Uuid::new_v4().simple().to_string(),
            counter: AtomicU64::new(0),
            config,
        }
    }

    fn next_object_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}", self.instance_id, n)
    }

    fn striped_object_id(&self, layout: StripeLayout) -> String {
        format!("{}:{}", self.next_object_id(), layout.id_suffix())
    }

    /// Layout a striped blob was written with.
    fn layout_of(&self, object_id: &str) -> Result<StripeLayout> {
        Ok(StripeLayout::encoded_in(object_id)?.unwrap_or(self.config.layout))
    }

    async fn read_head(&self, pool: Pool, object_id: &str) -> Result<Option<u64>> {
        match self.store.read_at(pool.name(), object_id, 0, 8).await {
            Ok(head) if head.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&head);
                Ok(Some(u64::from_be_bytes(raw)))
            }
            Ok(_) => Err(Error::Backend {
                cluster: self.id.clone(),
                reason: format!("corrupt head record for {}", object_id),
            }),
            Err(Error::ObjectNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_head(&self, pool: Pool, object_id: &str, size: u64) -> Result<()> {
        self.store
            .write_full(
                pool.name(),
                object_id,
                Bytes::copy_from_slice(&size.to_be_bytes()),
            )
            .await
    }

    async fn put_small(&self, body: &mut BodyReader<'_>) -> Result<PutResult> {
        let limit = self.config.small_object_threshold;
        let mut data = Vec::new();
        let mut limited = body.take(limit + 1);
        limited.read_to_end(&mut data).await?;
        if data.len() as u64 > limit {
            return Err(Error::Api(ApiErrorCode::EntityTooLarge));
        }
        let object_id = self.next_object_id();
        let size = data.len() as u64;
        self.store
            .write_full(Pool::Small.name(), &object_id, Bytes::from(data))
            .await?;
        Ok(PutResult { object_id, size })
    }

    async fn write_striped(
        &self,
        pool: Pool,
        object_id: &str,
        layout: StripeLayout,
        body: &mut BodyReader<'_>,
        offset: u64,
    ) -> Result<u64> {
        let sink = Arc::new(StripedSink {
            store: self.store.clone(),
            pool: pool.name().to_string(),
            object_id: object_id.to_string(),
            layout,
        });
        let writer = PipelinedWriter::new(self.config.writer.clone(), sink);
        let outcome = writer.write_all(body, offset).await?;
        debug!(
            "Striped write of {} bytes in {} chunks to {}",
            outcome.bytes, outcome.chunks, object_id
        );
        Ok(outcome.bytes)
    }

    /// Remove sub-objects of a failed write. There is no head yet, so probe
    /// upwards until a full object set is missing twice in a row.
    async fn cleanup_partial(&self, pool: Pool, object_id: &str) {
        let layout = self.config.layout;
        let mut misses = 0;
        let mut object_no = 0;
        while misses < layout.count * 2 {
            let name = StripeLayout::sub_object_name(object_id, object_no);
            match self.store.remove(pool.name(), &name).await {
                Ok(true) => misses = 0,
                Ok(false) => misses += 1,
                Err(e) => {
                    warn!("Cleanup of {} stopped: {}", name, e);
                    return;
                }
            }
            object_no += 1;
        }
    }

    async fn remove_striped(&self, pool: Pool, object_id: &str) -> Result<()> {
        let Some(size) = self.read_head(pool, object_id).await? else {
            debug!("Remove of missing blob {}", object_id);
            return Ok(());
        };
        let layout = self.layout_of(object_id)?;
        for object_no in layout.objects_for_size(size) {
            let name = StripeLayout::sub_object_name(object_id, object_no);
            self.store.remove(pool.name(), &name).await?;
        }
        self.store.remove(pool.name(), object_id).await?;
        Ok(())
    }
}

#[async_trait]
impl Cluster for StripedCluster {
    fn id(&self) -> &str {
        &self.id
    }

    async fn usage(&self) -> Result<Usage> {
        self.store.usage().await
    }

    #[instrument(skip(self, body), fields(cluster = %self.id))]
    async fn put(&self, pool: Pool, body: &mut BodyReader<'_>) -> Result<PutResult> {
        if pool == Pool::Small {
            return self.put_small(body).await;
        }
        let object_id = self.striped_object_id(self.config.layout);
        let result = self
            .write_striped(pool, &object_id, self.config.layout, body, 0)
            .await;
        match result {
            Ok(size) => {
                self.write_head(pool, &object_id, size).await?;
                Ok(PutResult { object_id, size })
            }
            Err(e) => {
                warn!("Striped put to {} failed: {}", object_id, e);
                self.cleanup_partial(pool, &object_id).await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self, body), fields(cluster = %self.id))]
    async fn append(
        &self,
        pool: Pool,
        existing: Option<&str>,
        body: &mut BodyReader<'_>,
        offset: u64,
    ) -> Result<PutResult> {
        if pool != Pool::Big {
            return Err(Error::Api(ApiErrorCode::NotImplemented));
        }
        let object_id = match existing {
            Some(id) => id.to_string(),
            None => self.striped_object_id(self.config.append_layout),
        };
        let layout = self.layout_of(&object_id)?;
        let current = self.read_head(pool, &object_id).await?.unwrap_or(0);
        if existing.is_some() && offset != current {
            return Err(Error::Api(ApiErrorCode::InvalidArgument));
        }

        let written = self
            .write_striped(pool, &object_id, layout, body, offset)
            .await?;
        self.write_head(pool, &object_id, current.max(offset + written))
            .await?;
        Ok(PutResult {
            object_id,
            size: written,
        })
    }

    async fn get_reader(
        &self,
        pool: Pool,
        object_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn ObjectReader>> {
        let (addressing, blob_size) = if pool == Pool::Small {
            let size = self
                .store
                .size(pool.name(), object_id)
                .await?
                .ok_or_else(|| Error::ObjectNotFound(object_id.to_string()))?;
            (Addressing::Whole, size)
        } else {
            let size = self
                .read_head(pool, object_id)
                .await?
                .ok_or_else(|| Error::ObjectNotFound(object_id.to_string()))?;
            (
                Addressing::Striped(self.layout_of(object_id)?),
                size,
            )
        };
        Ok(Box::new(BlobReader::new(
            self.store.clone(),
            pool.name(),
            object_id,
            addressing,
            blob_size,
            offset,
            length,
        )))
    }

    #[instrument(skip(self), fields(cluster = %self.id))]
    async fn remove(&self, pool: Pool, object_id: &str) -> Result<()> {
        if pool == Pool::Small {
            self.store.remove(pool.name(), object_id).await?;
            return Ok(());
        }
        self.remove_striped(pool, object_id).await
    }
}
