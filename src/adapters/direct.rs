//! Direct Cluster Backend
//!
//! Small-object backend that stores every blob whole as one record,
//! regardless of pool. Append is not supported.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::instrument;

use super::layout::{Addressing, BlobReader};
use crate::domain::{BodyReader, Cluster, ObjectReader, Pool, PutResult, RawObjectStore, Usage};
use crate::error::{ApiErrorCode, Error, Result};

/// [`Cluster`] writing whole records.
pub struct DirectCluster {
    id: String,
    store: Arc<dyn RawObjectStore>,
    max_object_size: u64,
}

impl DirectCluster {
    pub fn new(store: Arc<dyn RawObjectStore>, max_object_size: u64) -> Self {
        Self {
            id: store.fsid().to_string(),
            store,
            max_object_size,
        }
    }
}

#[async_trait]
impl Cluster for DirectCluster {
    fn id(&self) -> &str {
        &self.id
    }

    async fn usage(&self) -> Result<Usage> {
        self.store.usage().await
    }

    #[instrument(skip(self, body), fields(cluster = %self.id))]
    async fn put(&self, pool: Pool, body: &mut BodyReader<'_>) -> Result<PutResult> {
        let mut data = Vec::new();
        let mut limited = body.take(self.max_object_size + 1);
        limited.read_to_end(&mut data).await?;
        if data.len() as u64 > self.max_object_size {
            return Err(Error::Api(ApiErrorCode::EntityTooLarge));
        }
        let object_id = uuid::Uuid::new_v4().simple().to_string();
        let size = data.len() as u64;
        self.store
            .write_full(pool.name(), &object_id, Bytes::from(data))
            .await?;
        Ok(PutResult { object_id, size })
    }

    async fn append(
        &self,
        _pool: Pool,
        _existing: Option<&str>,
        _body: &mut BodyReader<'_>,
        _offset: u64,
    ) -> Result<PutResult> {
        Err(Error::Api(ApiErrorCode::NotImplemented))
    }

    async fn get_reader(
        &self,
        pool: Pool,
        object_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn ObjectReader>> {
        let size = self
            .store
            .size(pool.name(), object_id)
            .await?
            .ok_or_else(|| Error::ObjectNotFound(object_id.to_string()))?;
        Ok(Box::new(BlobReader::new(
            self.store.clone(),
            pool.name(),
            object_id,
            Addressing::Whole,
            size,
            offset,
            length,
        )))
    }

    #[instrument(skip(self), fields(cluster = %self.id))]
    async fn remove(&self, pool: Pool, object_id: &str) -> Result<()> {
        self.store.remove(pool.name(), object_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::MemoryObjectStore;
    use crate::storage::reader::read_to_vec;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_direct_round_trip() {
        let store = Arc::new(MemoryObjectStore::new("d1"));
        let cluster = DirectCluster::new(store.clone(), 1024);
        let mut body: &[u8] = b"hello direct";
        let put = cluster.put(Pool::Cold, &mut body).await.unwrap();
        assert_eq!(put.size, 12);
        assert!(store.contains("cold", &put.object_id));

        let mut reader = cluster
            .get_reader(Pool::Cold, &put.object_id, 6, 6)
            .await
            .unwrap();
        assert_eq!(read_to_vec(reader.as_mut()).await.unwrap(), b"direct");

        cluster.remove(Pool::Cold, &put.object_id).await.unwrap();
        assert!(!store.contains("cold", &put.object_id));
    }

    #[tokio::test]
    async fn test_direct_rejects_append() {
        let cluster = DirectCluster::new(Arc::new(MemoryObjectStore::new("d1")), 1024);
        let mut body: &[u8] = b"x";
        assert_matches!(
            cluster.append(Pool::Big, None, &mut body, 0).await,
            Err(Error::Api(ApiErrorCode::NotImplemented))
        );
    }

    #[tokio::test]
    async fn test_direct_size_limit() {
        let cluster = DirectCluster::new(Arc::new(MemoryObjectStore::new("d1")), 4);
        let mut body: &[u8] = b"too long";
        assert_matches!(
            cluster.put(Pool::Small, &mut body).await,
            Err(Error::Api(ApiErrorCode::EntityTooLarge))
        );
    }
}
