//! In-memory ordered key-value store
//!
//! `BTreeMap` behind a read-write lock; range scans return keys in byte
//! order, matching an ordered distributed KV store.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::KvStore;
use crate::error::{Error, Result};

/// In-memory [`KvStore`].
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    fail_writes: AtomicBool,
    fail_next: AtomicU32,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until switched off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    fn check_writable(&self) -> Result<()> {
        let one_off = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if one_off || self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Metadata("write rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        self.map.write().insert(key.to_vec(), value);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.map.write().remove(key);
        Ok(())
    }

    async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if !end.is_empty() && start >= end {
            return Ok(Vec::new());
        }
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end.to_vec())
        };
        let map = self.map.read();
        Ok(map
            .range((Bound::Included(start.to_vec()), upper))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_is_ordered_and_bounded() {
        let kv = MemoryKvStore::new();
        for key in ["b", "a", "d", "c"] {
            kv.put(key.as_bytes(), key.as_bytes().to_vec()).await.unwrap();
        }
        let rows = kv.scan(b"a", b"d", 10).await.unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let rows = kv.scan(b"b", b"", 2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, b"b".to_vec());

        assert!(kv.scan(b"d", b"a", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let kv = MemoryKvStore::new();
        kv.set_fail_writes(true);
        assert!(kv.put(b"k", vec![]).await.is_err());
        kv.set_fail_writes(false);
        kv.put(b"k", vec![1]).await.unwrap();
        assert_eq!(kv.get(b"k").await.unwrap(), Some(vec![1]));
        kv.delete(b"k").await.unwrap();
        assert!(kv.is_empty());

        kv.fail_next_writes(1);
        assert!(kv.put(b"k", vec![]).await.is_err());
        kv.put(b"k", vec![2]).await.unwrap();
    }
}
