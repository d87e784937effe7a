//! Data Path
//!
//! Ties the selector, the cluster backends, the metadata store and the
//! recycle queue together. Every operation that leaves a backend blob
//! without metadata pointing at it hands the blob to the recycle queue.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, instrument, warn};

use super::reader::{copy_reader, stream_range, ByteRange};
use super::recycle::RecycleQueue;
use super::selector::ClusterSelector;
use crate::config::Timeouts;
use crate::domain::{not_found_as_no_such_key, BackendTuple, BodyReader, Cluster, Pool};
use crate::error::{ApiErrorCode, Error, Result};
use crate::meta::{
    encode_upload_id, version_id_for, Bucket, MetaStore, Multipart, Object, ObjectType, Part,
    StorageClass, VersioningStatus, NULL_VERSION,
};

/// Buffer between a source reader and a backend put.
const COPY_PIPE: usize = 1 << 20;

// =============================================================================
// Hashing Reader
// =============================================================================

/// Computes the MD5 etag of everything read through it.
struct HashingReader<R> {
    inner: R,
    hasher: md5::Context,
}

impl<R> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: md5::Context::new(),
        }
    }

    fn etag(self) -> String {
        format!("{:x}", self.hasher.compute())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.hasher.consume(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// Records
// =============================================================================

/// Where a freshly written blob landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredData {
    pub location: String,
    pub pool: Pool,
    pub object_id: String,
    pub size: u64,
    pub etag: String,
}

impl StoredData {
    pub fn tuple(&self) -> BackendTuple {
        BackendTuple::new(&self.location, self.pool, &self.object_id)
    }
}

/// Object record for data written to `bucket` at `now`.
///
/// Versioned buckets get a time derived version id; the rest write the
/// null version.
pub fn object_record(
    bucket: &Bucket,
    name: &str,
    owner_id: &str,
    stored: StoredData,
    storage_class: StorageClass,
    now: DateTime<Utc>,
) -> Object {
    let enabled = bucket.versioning == VersioningStatus::Enabled;
    Object {
        bucket: bucket.name.clone(),
        name: name.to_string(),
        version_id: if enabled {
            version_id_for(now)
        } else {
            NULL_VERSION.to_string()
        },
        location: stored.location,
        pool: stored.pool,
        owner_id: owner_id.to_string(),
        size: stored.size,
        object_id: stored.object_id,
        last_modified: now,
        etag: stored.etag,
        content_type: String::new(),
        custom_attrs: BTreeMap::new(),
        tags: BTreeMap::new(),
        parts: BTreeMap::new(),
        storage_class,
        object_type: ObjectType::Normal,
        delete_marker: false,
        null_version: !enabled,
    }
}

/// Check the multipart layout invariants of an object record.
///
/// Parts are numbered `1..=N`, their offsets tile `[0, size)` and their
/// sizes add up to the object size.
pub fn check_integrity(object: &Object) -> Result<()> {
    if object.parts.is_empty() {
        return Ok(());
    }
    let mut expected_offset = 0u64;
    for (index, (number, part)) in object.parts.iter().enumerate() {
        let want = index as u32 + 1;
        if *number != want || part.number != want {
            return Err(Error::Metadata(format!(
                "{}/{}: part {} where {} expected",
                object.bucket, object.name, number, want
            )));
        }
        if part.offset != expected_offset {
            return Err(Error::Metadata(format!(
                "{}/{}: part {} at offset {} instead of {}",
                object.bucket, object.name, number, part.offset, expected_offset
            )));
        }
        expected_offset += part.size;
    }
    if expected_offset != object.size {
        return Err(Error::Metadata(format!(
            "{}/{}: parts add up to {} bytes, object is {}",
            object.bucket, object.name, expected_offset, object.size
        )));
    }
    Ok(())
}

// =============================================================================
// Data Path
// =============================================================================

/// Object data operations.
pub struct DataPath {
    selector: Arc<ClusterSelector>,
    meta: MetaStore,
    recycle: Arc<RecycleQueue>,
    timeouts: Timeouts,
}

impl DataPath {
    pub fn new(selector: Arc<ClusterSelector>, meta: MetaStore, recycle: Arc<RecycleQueue>) -> Self {
        Self {
            selector,
            meta,
            recycle,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    pub fn recycle(&self) -> &Arc<RecycleQueue> {
        &self.recycle
    }

    pub fn selector(&self) -> &Arc<ClusterSelector> {
        &self.selector
    }

    async fn pick(
        &self,
        size: Option<u64>,
        is_append: bool,
        class: StorageClass,
    ) -> Result<(Arc<dyn Cluster>, Pool)> {
        let limit = self.timeouts.queue_admission;
        tokio::time::timeout(limit, self.selector.pick(size, is_append, class))
            .await
            .map_err(|_| timeout("cluster selection", limit))?
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write a new blob for an object of `storage_class`.
    ///
    /// With a declared `size`, at most that many bytes are read and a short
    /// body fails with `IncompleteBody`.
    #[instrument(skip(self, body))]
    pub async fn put_object(
        &self,
        body: &mut BodyReader<'_>,
        size: Option<u64>,
        storage_class: StorageClass,
    ) -> Result<StoredData> {
        let (cluster, pool) = self.pick(size, false, storage_class).await?;
        self.put_on(cluster.as_ref(), pool, body, size).await
    }

    async fn put_on(
        &self,
        cluster: &dyn Cluster,
        pool: Pool,
        body: &mut BodyReader<'_>,
        size: Option<u64>,
    ) -> Result<StoredData> {
        let mut reader = HashingReader::new(body.take(size.unwrap_or(u64::MAX)));
        let put = cluster.put(pool, &mut reader).await?;
        let stored = StoredData {
            location: cluster.id().to_string(),
            pool,
            object_id: put.object_id,
            size: put.size,
            etag: reader.etag(),
        };
        if let Some(expected) = size {
            if stored.size != expected {
                warn!(
                    "Body ended after {} of {} bytes, recycling {}",
                    stored.size,
                    expected,
                    stored.tuple()
                );
                self.recycle.enqueue(stored.tuple());
                return Err(Error::Api(ApiErrorCode::IncompleteBody));
            }
        }
        debug!("Stored {} bytes as {}", stored.size, stored.tuple());
        Ok(stored)
    }

    /// Persist an object record pointing at freshly written data.
    ///
    /// On failure the data is recycled. A record replaced in place (the
    /// null version) has its old data recycled.
    #[instrument(skip(self, object), fields(bucket = %object.bucket, key = %object.name))]
    pub async fn commit_object(&self, object: &Object) -> Result<()> {
        let previous = match self
            .meta
            .get_object(&object.bucket, &object.name, &object.version_id)
            .await
        {
            Ok(previous) => Some(previous),
            Err(e) if e.is_api(ApiErrorCode::NoSuchKey) => None,
            Err(e) => {
                self.recycle.enqueue_all(object.backend_tuples());
                return Err(e);
            }
        };

        if let Err(e) = self.meta.put_object(object).await {
            warn!("Metadata commit failed, recycling data: {}", e);
            self.recycle.enqueue_all(object.backend_tuples());
            return Err(e);
        }

        if let Some(previous) = previous {
            let keep = object.backend_tuples();
            self.recycle.enqueue_all(
                previous
                    .backend_tuples()
                    .into_iter()
                    .filter(|t| !keep.contains(t)),
            );
        }
        Ok(())
    }

    /// Write and commit an object in one step.
    pub async fn upload_object(
        &self,
        bucket: &Bucket,
        name: &str,
        owner_id: &str,
        body: &mut BodyReader<'_>,
        size: Option<u64>,
        storage_class: StorageClass,
    ) -> Result<Object> {
        let stored = self.put_object(body, size, storage_class).await?;
        let object = object_record(bucket, name, owner_id, stored, storage_class, Utc::now());
        self.commit_object(&object).await?;
        Ok(object)
    }

    /// Append to the null version of `name` at `position`, creating it when
    /// `position` is zero and nothing exists.
    #[instrument(skip(self, bucket, body), fields(bucket = %bucket.name))]
    pub async fn append_object(
        &self,
        bucket: &Bucket,
        name: &str,
        owner_id: &str,
        body: &mut BodyReader<'_>,
        position: u64,
    ) -> Result<Object> {
        let existing = match self.meta.get_object(&bucket.name, name, NULL_VERSION).await {
            Ok(object) => Some(object),
            Err(e) if e.is_api(ApiErrorCode::NoSuchKey) => None,
            Err(e) => return Err(e),
        };

        let (cluster, pool, existing_id) = match &existing {
            Some(object) => {
                if object.object_type != ObjectType::Appendable || object.delete_marker {
                    return Err(Error::Api(ApiErrorCode::ObjectNotAppendable));
                }
                if object.size != position {
                    return Err(Error::Api(ApiErrorCode::PositionNotEqualToLength));
                }
                let cluster = self.selector.cluster(&object.location)?;
                (cluster, object.pool, Some(object.object_id.clone()))
            }
            None => {
                if position != 0 {
                    return Err(Error::Api(ApiErrorCode::PositionNotEqualToLength));
                }
                let (cluster, pool) = self.pick(None, true, StorageClass::Standard).await?;
                (cluster, pool, None)
            }
        };

        let mut reader = HashingReader::new(body);
        let put = cluster
            .append(pool, existing_id.as_deref(), &mut reader, position)
            .await?;
        let now = Utc::now();

        let object = match existing {
            Some(mut object) => {
                object.size = position + put.size;
                object.etag = reader.etag();
                object.last_modified = now;
                object
            }
            None => {
                let stored = StoredData {
                    location: cluster.id().to_string(),
                    pool,
                    object_id: put.object_id,
                    size: put.size,
                    etag: reader.etag(),
                };
                // Appendable objects always live in the null version.
                let mut object = object_record(
                    &Bucket {
                        versioning: VersioningStatus::Disabled,
                        ..bucket.clone()
                    },
                    name,
                    owner_id,
                    stored,
                    StorageClass::Standard,
                    now,
                );
                object.object_type = ObjectType::Appendable;
                object
            }
        };

        if let Err(e) = self.meta.put_object(&object).await {
            if existing_id.is_none() {
                self.recycle.enqueue_all(object.backend_tuples());
            }
            return Err(e);
        }
        Ok(object)
    }

    // =========================================================================
    // Multipart
    // =========================================================================

    /// Start a multipart upload.
    pub async fn create_multipart(
        &self,
        bucket: &Bucket,
        name: &str,
        owner_id: &str,
        storage_class: StorageClass,
        now: DateTime<Utc>,
    ) -> Result<Multipart> {
        let (cluster, pool) = self.pick(None, false, storage_class).await?;
        let upload = Multipart {
            bucket: bucket.name.clone(),
            object: name.to_string(),
            upload_id: encode_upload_id(now)?,
            initial_time: now,
            owner_id: owner_id.to_string(),
            storage_class,
            location: cluster.id().to_string(),
            pool,
            content_type: String::new(),
            parts: BTreeMap::new(),
        };
        self.meta.put_multipart(&upload).await?;
        Ok(upload)
    }

    /// Upload one part. Re-uploading a part number replaces it.
    #[instrument(skip(self, upload, body), fields(upload_id = %upload.upload_id))]
    pub async fn upload_part(
        &self,
        upload: &Multipart,
        number: u32,
        body: &mut BodyReader<'_>,
        size: u64,
    ) -> Result<Part> {
        if number == 0 {
            return Err(Error::Api(ApiErrorCode::InvalidArgument));
        }
        let cluster = self.selector.cluster(&upload.location)?;
        let stored = self
            .put_on(cluster.as_ref(), upload.pool, body, Some(size))
            .await?;
        let part = Part {
            number,
            size: stored.size,
            object_id: stored.object_id.clone(),
            offset: 0,
            etag: stored.etag.clone(),
            last_modified: Utc::now(),
        };

        let mut current = match self
            .meta
            .get_multipart(&upload.bucket, &upload.object, &upload.upload_id)
            .await
        {
            Ok(current) => current,
            Err(e) => {
                self.recycle.enqueue(stored.tuple());
                return Err(e);
            }
        };
        let replaced = current.parts.insert(number, part.clone());
        if let Err(e) = self.meta.put_multipart(&current).await {
            self.recycle.enqueue(stored.tuple());
            return Err(e);
        }
        if let Some(old) = replaced {
            self.recycle
                .enqueue(BackendTuple::new(&current.location, current.pool, old.object_id));
        }
        Ok(part)
    }

    /// Assemble the uploaded parts into an object and drop the upload.
    #[instrument(skip(self, bucket, upload), fields(upload_id = %upload.upload_id))]
    pub async fn complete_multipart(&self, bucket: &Bucket, upload: &Multipart) -> Result<Object> {
        let current = self
            .meta
            .get_multipart(&upload.bucket, &upload.object, &upload.upload_id)
            .await?;
        if current.parts.is_empty() {
            return Err(Error::Api(ApiErrorCode::InvalidPart));
        }

        let mut parts = BTreeMap::new();
        let mut offset = 0u64;
        let mut digests = md5::Context::new();
        for (index, (number, part)) in current.parts.iter().enumerate() {
            if *number != index as u32 + 1 {
                return Err(Error::Api(ApiErrorCode::InvalidPart));
            }
            let raw = hex::decode(&part.etag).map_err(|_| Error::Api(ApiErrorCode::InvalidPart))?;
            digests.consume(&raw);
            let mut part = part.clone();
            part.offset = offset;
            offset += part.size;
            parts.insert(*number, part);
        }

        let now = Utc::now();
        let stored = StoredData {
            location: current.location.clone(),
            pool: current.pool,
            object_id: String::new(),
            size: offset,
            etag: format!("{:x}-{}", digests.compute(), parts.len()),
        };
        let mut object = object_record(
            bucket,
            &current.object,
            &current.owner_id,
            stored,
            current.storage_class,
            now,
        );
        object.parts = parts;
        object.object_type = ObjectType::Multipart;
        object.content_type = current.content_type.clone();

        self.commit_object(&object).await?;
        self.meta
            .delete_multipart(&current.bucket, &current.object, &current.upload_id)
            .await?;
        Ok(object)
    }

    /// Drop an upload and recycle its parts.
    #[instrument(skip(self, upload), fields(bucket = %upload.bucket, key = %upload.object))]
    pub async fn abort_multipart(&self, upload: &Multipart) -> Result<()> {
        let current = match self
            .meta
            .get_multipart(&upload.bucket, &upload.object, &upload.upload_id)
            .await
        {
            Ok(current) => current,
            Err(e) if e.is_api(ApiErrorCode::NoSuchUpload) => upload.clone(),
            Err(e) => return Err(e),
        };
        self.meta
            .delete_multipart(&current.bucket, &current.object, &current.upload_id)
            .await?;
        let parts = current.backend_tuples();
        info!(
            "Aborted upload {} of {}/{}, recycling {} parts",
            current.upload_id,
            current.bucket,
            current.object,
            parts.len()
        );
        self.recycle.enqueue_all(parts);
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Stream an object, or `range` of it, into `out`.
    #[instrument(skip(self, object, out), fields(bucket = %object.bucket, key = %object.name))]
    pub async fn get_object<W>(
        &self,
        object: &Object,
        range: Option<(u64, u64)>,
        out: &mut W,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        if object.delete_marker {
            return Err(Error::Api(ApiErrorCode::NoSuchKey));
        }
        if object.storage_class.is_archive() {
            return Err(Error::Api(ApiErrorCode::InvalidObjectState));
        }
        self.read_object_data(object, range, out).await
    }

    /// Stream object data without storage class checks.
    pub async fn read_object_data<W>(
        &self,
        object: &Object,
        range: Option<(u64, u64)>,
        out: &mut W,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let range = ByteRange::resolve(range, object.size)?;
        let cluster = self.selector.cluster(&object.location)?;
        stream_range(
            cluster.as_ref(),
            object.pool,
            &object.object_id,
            &object.parts,
            range,
            out,
        )
        .await
        .map_err(not_found_as_no_such_key)
    }

    // =========================================================================
    // Deletes
    // =========================================================================

    /// Remove one version and recycle its data.
    #[instrument(skip(self, object), fields(bucket = %object.bucket, key = %object.name))]
    pub async fn delete_object_version(&self, object: &Object) -> Result<()> {
        self.meta
            .delete_object(&object.bucket, &object.name, &object.version_id)
            .await?;
        self.recycle.enqueue_all(object.backend_tuples());
        Ok(())
    }

    /// Insert a delete marker as the current version of `name`.
    ///
    /// Outside enabled versioning the marker takes the null version slot
    /// and the data of the version it replaces is recycled.
    #[instrument(skip(self, bucket), fields(bucket = %bucket.name))]
    pub async fn insert_delete_marker(
        &self,
        bucket: &Bucket,
        name: &str,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Object> {
        let stored = StoredData {
            location: String::new(),
            pool: Pool::Small,
            object_id: String::new(),
            size: 0,
            etag: String::new(),
        };
        let mut marker = object_record(
            bucket,
            name,
            owner_id,
            stored,
            StorageClass::Standard,
            now,
        );
        marker.delete_marker = true;
        self.commit_object(&marker).await?;
        Ok(marker)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Copy an object's data into a pool serving `target` and repoint its
    /// record there.
    #[instrument(skip(self, object), fields(bucket = %object.bucket, key = %object.name))]
    pub async fn transition_object(&self, object: &Object, target: StorageClass) -> Result<Object> {
        if object.delete_marker {
            return Err(Error::Api(ApiErrorCode::InvalidObjectState));
        }
        let copy = self.copy_object_data(object, target).await?;

        let mut moved = object.clone();
        moved.location = copy.location.clone();
        moved.pool = copy.pool;
        moved.object_id = copy.object_id.clone();
        moved.parts = copy.parts.clone();
        moved.storage_class = target;
        let fresh = moved.backend_tuples();

        // Only repoint the record if nobody rewrote it meanwhile.
        let current = match self
            .meta
            .get_object(&object.bucket, &object.name, &object.version_id)
            .await
        {
            Ok(current) => current,
            Err(e) => {
                self.recycle.enqueue_all(fresh);
                return Err(e);
            }
        };
        if current.backend_tuples() != object.backend_tuples() || current.etag != object.etag {
            warn!("Object changed during transition, dropping the copy");
            self.recycle.enqueue_all(fresh);
            return Err(Error::Api(ApiErrorCode::PreconditionFailed));
        }
        if let Err(e) = self.meta.put_object(&moved).await {
            self.recycle.enqueue_all(fresh);
            return Err(e);
        }

        self.recycle.enqueue_all(object.backend_tuples());
        info!(
            "Transitioned {}/{} from {} to {}",
            object.bucket, object.name, object.storage_class, target
        );
        Ok(moved)
    }

    /// Copy an object's data (every part separately for multipart objects)
    /// into a pool for `target`. Nothing is committed; on failure the
    /// partial copy is recycled.
    pub async fn copy_object_data(&self, object: &Object, target: StorageClass) -> Result<CopiedData> {
        let source = self.selector.cluster(&object.location)?;
        let (cluster, pool) = self.pick(Some(object.size), false, target).await?;

        if object.parts.is_empty() {
            let stored = self
                .copy_blob(
                    &source,
                    object.pool,
                    &object.object_id,
                    object.size,
                    cluster.as_ref(),
                    pool,
                )
                .await?;
            return Ok(CopiedData {
                location: stored.location,
                pool,
                object_id: stored.object_id,
                parts: BTreeMap::new(),
            });
        }

        let mut parts = BTreeMap::new();
        for (number, part) in &object.parts {
            let copied = self
                .copy_blob(
                    &source,
                    object.pool,
                    &part.object_id,
                    part.size,
                    cluster.as_ref(),
                    pool,
                )
                .await;
            match copied {
                Ok(stored) => {
                    let mut part = part.clone();
                    part.object_id = stored.object_id;
                    parts.insert(*number, part);
                }
                Err(e) => {
                    self.recycle.enqueue_all(
                        parts
                            .values()
                            .map(|p: &Part| BackendTuple::new(cluster.id(), pool, &p.object_id)),
                    );
                    return Err(e);
                }
            }
        }
        Ok(CopiedData {
            location: cluster.id().to_string(),
            pool,
            object_id: String::new(),
            parts,
        })
    }

    /// Stream one blob into another cluster through an in-memory pipe.
    async fn copy_blob(
        &self,
        source: &Arc<dyn Cluster>,
        source_pool: Pool,
        source_id: &str,
        size: u64,
        target: &dyn Cluster,
        target_pool: Pool,
    ) -> Result<StoredData> {
        let (mut tx, mut rx) = tokio::io::duplex(COPY_PIPE);
        let feeder = {
            let source = Arc::clone(source);
            let source_id = source_id.to_string();
            tokio::spawn(async move {
                let mut reader = source
                    .get_reader(source_pool, &source_id, 0, size)
                    .await?;
                let copied = copy_reader(reader.as_mut(), &mut tx).await?;
                tx.shutdown().await?;
                Ok::<u64, Error>(copied)
            })
        };

        let put = self.put_on(target, target_pool, &mut rx, Some(size)).await;
        drop(rx);
        let fed = feeder
            .await
            .map_err(|e| Error::Internal(format!("copy task failed: {}", e)))?;

        match (put, fed) {
            (Ok(stored), Ok(_)) => Ok(stored),
            (Ok(stored), Err(e)) => {
                self.recycle.enqueue(stored.tuple());
                Err(e)
            }
            // A failed source read surfaces as a short body; report the cause.
            (Err(put_err), Err(feed_err)) if put_err.is_api(ApiErrorCode::IncompleteBody) => {
                Err(not_found_as_no_such_key(feed_err))
            }
            (Err(e), _) => Err(e),
        }
    }
}

/// Data copied by [`DataPath::copy_object_data`].
#[derive(Debug, Clone, PartialEq)]
pub struct CopiedData {
    pub location: String,
    pub pool: Pool,
    /// Empty when the data is in parts.
    pub object_id: String,
    pub parts: BTreeMap<u32, Part>,
}

impl CopiedData {
    pub fn backend_tuples(&self) -> Vec<BackendTuple> {
        if self.parts.is_empty() {
            return vec![BackendTuple::new(&self.location, self.pool, &self.object_id)];
        }
        self.parts
            .values()
            .map(|p| BackendTuple::new(&self.location, self.pool, &p.object_id))
            .collect()
    }
}

fn timeout(operation: &str, duration: Duration) -> Error {
    Error::Timeout {
        operation: operation.to_string(),
        duration,
    }
}
