//! Domain Ports (Port/Adapter Pattern)
//!
//! Core abstractions the gateway depends on. Infrastructure adapters in
//! [`crate::adapters`] implement these traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                           │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                   │    │
//! │  │  Cluster │ RawObjectStore │ KvStore │ MessageBus    │    │
//! │  │  LockService │ ObjectReader                         │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                      │
//! │  StripedCluster │ DirectCluster │ MemoryKvStore │ ...       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::io::SeekFrom;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::{ApiErrorCode, Error, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// Logical pool within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pool {
    /// Small objects, stored whole.
    Small,
    /// Large and appendable objects, striped.
    Big,
    /// Archive storage classes.
    Cold,
}

impl Pool {
    /// All pools in a stable order.
    pub const ALL: [Pool; 3] = [Pool::Small, Pool::Big, Pool::Cold];

    /// Pool name as used on the backend and in configuration.
    pub fn name(&self) -> &'static str {
        match self {
            Pool::Small => "small",
            Pool::Big => "big",
            Pool::Cold => "cold",
        }
    }

    /// Parse a pool name.
    pub fn from_name(name: &str) -> Option<Pool> {
        Pool::ALL.into_iter().find(|p| p.name() == name)
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cluster capacity as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    /// Total capacity in KiB.
    pub kb: u64,
    /// Used capacity in KiB.
    pub kb_used: u64,
}

impl Usage {
    /// Used space as an integer percentage. An empty cluster reports 0.
    pub fn percent(&self) -> u8 {
        if self.kb == 0 {
            return 0;
        }
        let pct = self.kb_used.saturating_mul(100) / self.kb;
        pct.min(100) as u8
    }
}

/// Result of writing a blob to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    /// Backend object id.
    pub object_id: String,
    /// Bytes written by this call.
    pub size: u64,
}

/// Fully qualified backend blob address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendTuple {
    pub cluster_id: String,
    pub pool: Pool,
    pub object_id: String,
}

impl BackendTuple {
    pub fn new(cluster_id: impl Into<String>, pool: Pool, object_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            pool,
            object_id: object_id.into(),
        }
    }
}

impl fmt::Display for BackendTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster_id, self.pool, self.object_id)
    }
}

// =============================================================================
// Cluster Backend
// =============================================================================

/// Streaming reader over a stored blob.
///
/// `read` returns `Ok(0)` once the requested range is exhausted.
#[async_trait]
pub trait ObjectReader: Send {
    /// Read up to `buf.len()` bytes.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Reposition relative to the start of the requested range.
    ///
    /// `SeekFrom::End` is not supported.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;
}

/// Source stream handed to a backend.
pub type BodyReader<'a> = dyn AsyncRead + Unpin + Send + 'a;

/// A backend cluster holding blobs in named pools.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Cluster identity (fsid).
    fn id(&self) -> &str;

    /// Current capacity.
    async fn usage(&self) -> Result<Usage>;

    /// Write a new blob and return its backend id and size.
    async fn put(&self, pool: Pool, body: &mut BodyReader<'_>) -> Result<PutResult>;

    /// Append to `existing` at `offset`, or create a new appendable blob.
    async fn append(
        &self,
        pool: Pool,
        existing: Option<&str>,
        body: &mut BodyReader<'_>,
        offset: u64,
    ) -> Result<PutResult>;

    /// Open a reader for `length` bytes starting at `offset`. A zero
    /// length reads to the end.
    async fn get_reader(
        &self,
        pool: Pool,
        object_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn ObjectReader>>;

    /// Remove a blob. Removing a missing blob succeeds.
    async fn remove(&self, pool: Pool, object_id: &str) -> Result<()>;
}

/// Record store underlying a cluster backend.
#[async_trait]
pub trait RawObjectStore: Send + Sync {
    /// Store identity.
    fn fsid(&self) -> &str;

    /// Replace a record.
    async fn write_full(&self, pool: &str, name: &str, data: Bytes) -> Result<()>;

    /// Write into a record at `offset`, extending it as needed.
    async fn write_at(&self, pool: &str, name: &str, offset: u64, data: Bytes) -> Result<()>;

    /// Read up to `len` bytes at `offset`; short at the end of the record.
    async fn read_at(&self, pool: &str, name: &str, offset: u64, len: usize) -> Result<Bytes>;

    /// Record length, `None` if absent.
    async fn size(&self, pool: &str, name: &str) -> Result<Option<u64>>;

    /// Remove a record. Returns whether it existed.
    async fn remove(&self, pool: &str, name: &str) -> Result<bool>;

    /// Store capacity.
    async fn usage(&self) -> Result<Usage>;
}

// =============================================================================
// Metadata Store
// =============================================================================

/// Ordered key-value store holding gateway metadata.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &[u8]) -> Result<()>;

    /// Up to `limit` pairs with `start <= key < end`, in key order.
    async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

// =============================================================================
// Message Bus
// =============================================================================

/// Keyed publish to a partitioned topic.
///
/// Messages with the same key land on the same partition in publish order.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()>;

    /// Wait until published messages are handed off.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// A message as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub key: String,
    pub partition: usize,
    pub payload: Vec<u8>,
}

// =============================================================================
// Distributed Locks
// =============================================================================

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockLease {
    pub key: String,
    pub token: String,
}

/// Lease based distributed locks.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take `key` for `ttl`. `Ok(None)` means someone else holds it.
    async fn obtain(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>>;

    /// Extend a held lease. Returns false if the lease was lost.
    async fn refresh(&self, lease: &LockLease, ttl: Duration) -> Result<bool>;

    /// Release a held lease.
    async fn release(&self, lease: &LockLease) -> Result<()>;
}

/// Map a missing backend object onto the client-facing code.
pub fn not_found_as_no_such_key(err: Error) -> Error {
    match err {
        Error::ObjectNotFound(_) => Error::Api(ApiErrorCode::NoSuchKey),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_percent() {
        assert_eq!(Usage { kb: 0, kb_used: 0 }.percent(), 0);
        assert_eq!(Usage { kb: 1000, kb_used: 850 }.percent(), 85);
        assert_eq!(Usage { kb: 1000, kb_used: 859 }.percent(), 85);
        assert_eq!(Usage { kb: 10, kb_used: 20 }.percent(), 100);
    }

    #[test]
    fn test_pool_names() {
        for pool in Pool::ALL {
            assert_eq!(Pool::from_name(pool.name()), Some(pool));
        }
        assert_eq!(Pool::from_name("warm"), None);
    }

    #[test]
    fn test_backend_tuple_display() {
        let t = BackendTuple::new("c1", Pool::Big, "inst:7");
        assert_eq!(t.to_string(), "c1/big/inst:7");
    }
}
