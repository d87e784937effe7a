//! Metadata Store
//!
//! Typed tables over an ordered [`KvStore`]. Records are msgpack with named
//! fields (`rmp-serde`); keys follow the layout in [`keys`].
//!
//! # Tables
//!
//! ```text
//! b␟bucket                       Bucket
//! o␟bucket␟key␟version           Object     (newest version sorts first)
//! m␟bucket␟key␟upload_id         Multipart
//! f␟bucket␟key␟version           Freezer
//! g␟cluster␟pool␟object_id       GarbageRecord
//! ```

pub mod keys;
pub mod types;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::domain::{BackendTuple, KvStore};
use crate::error::{ApiErrorCode, Error, Result};

pub use keys::{
    decode_upload_id, encode_upload_id, version_id_for, version_time, NULL_VERSION,
};
pub use types::{
    Bucket, Freezer, GarbageRecord, GcStatus, Multipart, Object, ObjectType, Part, PartsIndex,
    RestoreStatus, StorageClass, VersioningStatus,
};

/// Page size for internal table walks.
const PAGE: usize = 256;

/// Encode a record.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(record).map_err(|e| Error::Codec(e.to_string()))
}

/// Decode a record.
pub fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    rmp_serde::from_slice(raw).map_err(|e| Error::Codec(e.to_string()))
}

/// Typed access to gateway metadata.
#[derive(Clone)]
pub struct MetaStore {
    kv: Arc<dyn KvStore>,
}

impl MetaStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Underlying store, for range scans.
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    async fn get_record<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_record<T: Serialize>(&self, key: &[u8], record: &T) -> Result<()> {
        self.kv.put(key, encode(record)?).await
    }

    /// Walk `[start, end)` decoding up to `limit` records.
    async fn scan_records<T: DeserializeOwned>(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut cursor = start.to_vec();
        while out.len() < limit {
            let batch = PAGE.min(limit - out.len());
            let rows = self.kv.scan(&cursor, end, batch).await?;
            let done = rows.len() < batch;
            for (key, value) in &rows {
                out.push(decode(value)?);
                cursor = next_key(key);
            }
            if done {
                break;
            }
        }
        Ok(out)
    }

    // =========================================================================
    // Buckets
    // =========================================================================

    pub async fn put_bucket(&self, bucket: &Bucket) -> Result<()> {
        self.put_record(&keys::bucket_key(&bucket.name), bucket).await
    }

    pub async fn get_bucket(&self, name: &str) -> Result<Bucket> {
        self.get_record(&keys::bucket_key(name))
            .await?
            .ok_or(Error::Api(ApiErrorCode::NoSuchBucket))
    }

    pub async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        let (start, end) = keys::table_range(keys::TABLE_BUCKET);
        self.scan_records(&start, &end, usize::MAX).await
    }

    // =========================================================================
    // Objects
    // =========================================================================

    pub async fn put_object(&self, object: &Object) -> Result<()> {
        self.put_record(
            &keys::object_key(&object.bucket, &object.name, &object.version_id),
            object,
        )
        .await
    }

    /// A specific version.
    pub async fn get_object(&self, bucket: &str, name: &str, version_id: &str) -> Result<Object> {
        self.get_record(&keys::object_key(bucket, name, version_id))
            .await?
            .ok_or(Error::Api(ApiErrorCode::NoSuchKey))
    }

    /// Every version of a key, newest first.
    pub async fn list_versions(&self, bucket: &str, name: &str) -> Result<Vec<Object>> {
        let (start, end) = keys::object_versions_range(bucket, name);
        let mut versions: Vec<Object> = self.scan_records(&start, &end, usize::MAX).await?;
        versions.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(versions)
    }

    /// The current version of a key.
    pub async fn get_latest_object(&self, bucket: &str, name: &str) -> Result<Object> {
        self.list_versions(bucket, name)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::Api(ApiErrorCode::NoSuchKey))
    }

    /// Whether a key has any version besides `version_id`.
    pub async fn other_versions_exist(&self, bucket: &str, name: &str, version_id: &str) -> Result<bool> {
        let (start, end) = keys::object_versions_range(bucket, name);
        let rows = self.kv.scan(&start, &end, 2).await?;
        let own = keys::object_key(bucket, name, version_id);
        Ok(rows.iter().any(|(k, _)| *k != own))
    }

    pub async fn delete_object(&self, bucket: &str, name: &str, version_id: &str) -> Result<()> {
        debug!("Deleting metadata for {}/{}@{}", bucket, name, version_id);
        self.kv
            .delete(&keys::object_key(bucket, name, version_id))
            .await
    }

    // =========================================================================
    // Multipart Uploads
    // =========================================================================

    pub async fn put_multipart(&self, upload: &Multipart) -> Result<()> {
        self.put_record(
            &keys::multipart_key(&upload.bucket, &upload.object, &upload.upload_id),
            upload,
        )
        .await
    }

    pub async fn get_multipart(&self, bucket: &str, name: &str, upload_id: &str) -> Result<Multipart> {
        self.get_record(&keys::multipart_key(bucket, name, upload_id))
            .await?
            .ok_or(Error::Api(ApiErrorCode::NoSuchUpload))
    }

    pub async fn delete_multipart(&self, bucket: &str, name: &str, upload_id: &str) -> Result<()> {
        self.kv
            .delete(&keys::multipart_key(bucket, name, upload_id))
            .await
    }

    // =========================================================================
    // Freezers
    // =========================================================================

    pub async fn put_freezer(&self, freezer: &Freezer) -> Result<()> {
        self.put_record(
            &keys::freezer_key(&freezer.bucket, &freezer.name, &freezer.version_id),
            freezer,
        )
        .await
    }

    pub async fn get_freezer(&self, bucket: &str, name: &str, version_id: &str) -> Result<Freezer> {
        self.get_record(&keys::freezer_key(bucket, name, version_id))
            .await?
            .ok_or(Error::Api(ApiErrorCode::NoSuchKey))
    }

    /// Up to `limit` freezers in `status`, starting after `after` if given.
    ///
    /// Returns the records and the key to resume from.
    pub async fn list_freezers(
        &self,
        status: RestoreStatus,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<(Vec<Freezer>, Option<Vec<u8>>)> {
        let (table_start, end) = keys::table_range(keys::TABLE_FREEZER);
        let mut cursor = after.map(next_key).unwrap_or(table_start);
        let mut out = Vec::new();
        loop {
            let rows = self.kv.scan(&cursor, &end, PAGE).await?;
            let exhausted = rows.len() < PAGE;
            for (key, value) in rows {
                let freezer: Freezer = decode(&value)?;
                if freezer.status == status {
                    out.push(freezer);
                    if out.len() == limit {
                        return Ok((out, Some(key)));
                    }
                }
                cursor = next_key(&key);
            }
            if exhausted {
                return Ok((out, None));
            }
        }
    }

    pub async fn set_freezer_status(
        &self,
        bucket: &str,
        name: &str,
        version_id: &str,
        status: RestoreStatus,
    ) -> Result<()> {
        let mut freezer = self.get_freezer(bucket, name, version_id).await?;
        freezer.status = status;
        self.put_freezer(&freezer).await
    }

    pub async fn delete_freezer(&self, bucket: &str, name: &str, version_id: &str) -> Result<()> {
        self.kv
            .delete(&keys::freezer_key(bucket, name, version_id))
            .await
    }

    // =========================================================================
    // Garbage Collection
    // =========================================================================

    pub async fn put_garbage(&self, record: &GarbageRecord) -> Result<()> {
        self.put_record(&keys::gc_key(&record.tuple), record).await
    }

    pub async fn list_garbage(&self, limit: usize) -> Result<Vec<GarbageRecord>> {
        let (start, end) = keys::table_range(keys::TABLE_GC);
        self.scan_records(&start, &end, limit).await
    }

    pub async fn delete_garbage(&self, tuple: &BackendTuple) -> Result<()> {
        self.kv.delete(&keys::gc_key(tuple)).await
    }
}

/// Smallest key strictly greater than `key`.
pub fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}
