//! Lifecycle Worker
//!
//! Consumes jobs from one bus partition and applies them through the data
//! path. Every job re-reads its record first; a record that vanished or
//! changed since the scan is left alone.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::evaluate::Action;
use super::job::LifecycleJob;
use crate::domain::BusMessage;
use crate::error::{ApiErrorCode, Result};
use crate::meta::{Multipart, Object};
use crate::storage::DataPath;

/// What a job ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Applied,
    Skipped,
}

pub struct LifecycleWorker {
    data: Arc<DataPath>,
}

impl LifecycleWorker {
    pub fn new(data: Arc<DataPath>) -> Self {
        Self { data }
    }

    /// Consume one partition until shutdown or until the bus closes.
    #[instrument(skip(self, rx, shutdown))]
    pub async fn run(
        self: Arc<Self>,
        partition: usize,
        mut rx: mpsc::UnboundedReceiver<BusMessage>,
        shutdown: CancellationToken,
    ) {
        info!("Lifecycle worker for partition {} started", partition);
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => None,
                message = rx.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            if let Err(e) = self.handle_message(&message).await {
                let report = e.report();
                error!(
                    "Lifecycle job for {} failed ({:?}): {}",
                    message.key, report.error_id, e
                );
            }
        }
        info!("Lifecycle worker for partition {} stopped", partition);
    }

    pub async fn handle_message(&self, message: &BusMessage) -> Result<JobOutcome> {
        let job = LifecycleJob::decode(&message.payload)?;
        self.handle(job).await
    }

    /// Apply one job.
    pub async fn handle(&self, job: LifecycleJob) -> Result<JobOutcome> {
        match (job.object, job.multipart) {
            (Some(object), _) => self.handle_object(object, job.action, job.storage_class).await,
            (None, Some(upload)) if job.action == Action::AbortMultipartUpload => {
                self.abort_upload(upload).await
            }
            _ => {
                warn!("Dropping lifecycle job without a usable record: {:?}", job.action);
                Ok(JobOutcome::Skipped)
            }
        }
    }

    async fn handle_object(
        &self,
        object: Object,
        action: Action,
        target: Option<crate::meta::StorageClass>,
    ) -> Result<JobOutcome> {
        let Some(current) = self.reread(&object).await? else {
            return Ok(JobOutcome::Skipped);
        };

        match action {
            Action::Delete => {
                self.data.delete_object_version(&current).await?;
                info!(
                    "Expired {}/{}@{}",
                    current.bucket, current.name, current.version_id
                );
            }
            Action::DeleteMarker => {
                if current.delete_marker {
                    self.data.delete_object_version(&current).await?;
                    info!("Removed expired delete marker {}/{}", current.bucket, current.name);
                } else {
                    let bucket = self.data.meta().get_bucket(&current.bucket).await?;
                    self.data
                        .insert_delete_marker(&bucket, &current.name, &current.owner_id, Utc::now())
                        .await?;
                    info!("Inserted delete marker for {}/{}", current.bucket, current.name);
                }
            }
            Action::Transition => {
                let Some(target) = target else {
                    warn!(
                        "Transition job for {}/{} carries no storage class",
                        current.bucket, current.name
                    );
                    return Ok(JobOutcome::Skipped);
                };
                match self.data.transition_object(&current, target).await {
                    Ok(_) => {}
                    Err(e) if e.is_api(ApiErrorCode::PreconditionFailed) => {
                        debug!("{}/{} changed during transition", current.bucket, current.name);
                        return Ok(JobOutcome::Skipped);
                    }
                    Err(e) => return Err(e),
                }
            }
            Action::None | Action::AbortMultipartUpload => {
                debug!(
                    "Nothing to do for {:?} on {}/{}",
                    action, current.bucket, current.name
                );
                return Ok(JobOutcome::Skipped);
            }
        }
        Ok(JobOutcome::Applied)
    }

    /// The stored record if it still matches the scanned one.
    async fn reread(&self, object: &Object) -> Result<Option<Object>> {
        let current = match self
            .data
            .meta()
            .get_object(&object.bucket, &object.name, &object.version_id)
            .await
        {
            Ok(current) => current,
            Err(e) if e.is_api(ApiErrorCode::NoSuchKey) => {
                debug!("{}/{} is already gone", object.bucket, object.name);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let unchanged = current.last_modified == object.last_modified
            && current.etag == object.etag
            && current.storage_class == object.storage_class
            && current.backend_tuples() == object.backend_tuples();
        if !unchanged {
            debug!(
                "{}/{} changed since the scan, skipping",
                object.bucket, object.name
            );
            return Ok(None);
        }
        Ok(Some(current))
    }

    async fn abort_upload(&self, upload: Multipart) -> Result<JobOutcome> {
        match self
            .data
            .meta()
            .get_multipart(&upload.bucket, &upload.object, &upload.upload_id)
            .await
        {
            Ok(current) => {
                self.data.abort_multipart(&current).await?;
                Ok(JobOutcome::Applied)
            }
            Err(e) if e.is_api(ApiErrorCode::NoSuchUpload) => {
                debug!("Upload {} already finished", upload.upload_id);
                Ok(JobOutcome::Skipped)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MemoryKvStore, MemoryObjectStore, StripedCluster, StripedClusterConfig};
    use crate::domain::{Cluster, Pool};
    use crate::meta::{Bucket, MetaStore, StorageClass, VersioningStatus};
    use crate::storage::{ClusterSelector, ClusterWeight, RecycleQueue, RecycleQueueConfig, SelectorConfig};
    use std::collections::HashMap;
    use std::io::Cursor;

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

    async fn upload(data: &DataPath, bucket: &Bucket, name: &str) -> Object {
        data.meta().put_bucket(bucket).await.unwrap();
        let body = b"lifecycle payload".to_vec();
        data.upload_object(
            bucket,
            name,
            "o",
            &mut Cursor::new(body.clone()),
            Some(body.len() as u64),
            StorageClass::Standard,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_delete_job() {
        let data = data_path();
        let object = upload(&data, &Bucket::new("b", "o"), "k").await;
        let worker = LifecycleWorker::new(data.clone());

        let outcome = worker
            .handle(LifecycleJob::for_object(object, Action::Delete, None))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Applied);
        assert!(data.meta().get_latest_object("b", "k").await.is_err());
        assert_eq!(data.recycle().pending(), 1);
    }

    #[tokio::test]
    async fn test_changed_record_is_skipped() {
        let data = data_path();
        let bucket = Bucket::new("b", "o");
        let scanned = upload(&data, &bucket, "k").await;
        upload(&data, &bucket, "k").await;
        let worker = LifecycleWorker::new(data.clone());

        let outcome = worker
            .handle(LifecycleJob::for_object(scanned, Action::Delete, None))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Skipped);
        assert!(data.meta().get_latest_object("b", "k").await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_record_is_skipped() {
        let data = data_path();
        let object = upload(&data, &Bucket::new("b", "o"), "k").await;
        data.delete_object_version(&object).await.unwrap();
        let worker = LifecycleWorker::new(data);
        let outcome = worker
            .handle(LifecycleJob::for_object(object, Action::Delete, None))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_transition_job() {
        let data = data_path();
        let object = upload(&data, &Bucket::new("b", "o"), "k").await;
        let worker = LifecycleWorker::new(data.clone());

        let outcome = worker
            .handle(LifecycleJob::for_object(
                object,
                Action::Transition,
                Some(StorageClass::Glacier),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Applied);
        let moved = data.meta().get_latest_object("b", "k").await.unwrap();
        assert_eq!(moved.storage_class, StorageClass::Glacier);
        assert_eq!(moved.pool, Pool::Cold);

        let mut out = Vec::new();
        data.read_object_data(&moved, None, &mut out).await.unwrap();
        assert_eq!(out, b"lifecycle payload");
    }

    #[tokio::test]
    async fn test_delete_marker_job() {
        let data = data_path();
        let mut bucket = Bucket::new("b", "o");
        bucket.versioning = VersioningStatus::Enabled;
        let object = upload(&data, &bucket, "k").await;
        let worker = LifecycleWorker::new(data.clone());

        worker
            .handle(LifecycleJob::for_object(object, Action::DeleteMarker, None))
            .await
            .unwrap();
        let latest = data.meta().get_latest_object("b", "k").await.unwrap();
        assert!(latest.delete_marker);
        assert_eq!(data.meta().list_versions("b", "k").await.unwrap().len(), 2);

        // A marker job on the marker itself removes it.
        worker
            .handle(LifecycleJob::for_object(latest, Action::DeleteMarker, None))
            .await
            .unwrap();
        assert!(!data.meta().get_latest_object("b", "k").await.unwrap().delete_marker);
    }

    #[tokio::test]
    async fn test_abort_job() {
        let data = data_path();
        let bucket = Bucket::new("b", "o");
        data.meta().put_bucket(&bucket).await.unwrap();
        let upload = data
            .create_multipart(&bucket, "big", "o", StorageClass::Standard, Utc::now())
            .await
            .unwrap();
        let body = vec![7u8; 1024];
        data.upload_part(&upload, 1, &mut Cursor::new(body), 1024)
            .await
            .unwrap();
        let worker = LifecycleWorker::new(data.clone());

        let message = BusMessage {
            topic: "lifecycle".into(),
            key: "big".into(),
            partition: 0,
            payload: LifecycleJob::for_multipart(upload.clone()).encode().unwrap(),
        };
        assert_eq!(worker.handle_message(&message).await.unwrap(), JobOutcome::Applied);
        assert!(data
            .meta()
            .get_multipart("b", "big", &upload.upload_id)
            .await
            .is_err());
        assert_eq!(data.recycle().pending(), 1);

        assert_eq!(worker.handle_message(&message).await.unwrap(), JobOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_run_drains_partition() {
        let data = data_path();
        let object = upload(&data, &Bucket::new("b", "o"), "k").await;
        let worker = Arc::new(LifecycleWorker::new(data.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(BusMessage {
            topic: "lifecycle".into(),
            key: "k".into(),
            partition: 0,
            payload: LifecycleJob::for_object(object, Action::Delete, None)
                .encode()
                .unwrap(),
        })
        .unwrap();
        drop(tx);

        worker.run(0, rx, CancellationToken::new()).await;
        assert!(data.meta().get_latest_object("b", "k").await.is_err());
    }
}
