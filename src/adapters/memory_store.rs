//! In-memory record store
//!
//! Backs clusters in tests and standalone mode. Uses DashMap for lock-free
//! concurrent access, with failure injection switches for exercising error
//! paths.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::domain::{RawObjectStore, Usage};
use crate::error::{Error, Result};

/// In-memory [`RawObjectStore`].
pub struct MemoryObjectStore {
    fsid: String,
    records: DashMap<(String, String), Vec<u8>>,
    capacity_kb: AtomicU64,
    used_override_kb: AtomicU64,
    fail_writes: AtomicBool,
    fail_removes: AtomicU32,
    writes: AtomicU64,
    removes: AtomicU64,
}

impl MemoryObjectStore {
    /// Create a store with 1 TiB of nominal capacity.
    pub fn new(fsid: impl Into<String>) -> Self {
        Self {
            fsid: fsid.into(),
            records: DashMap::new(),
            capacity_kb: AtomicU64::new(1 << 30),
            used_override_kb: AtomicU64::new(u64::MAX),
            fail_writes: AtomicBool::new(false),
            fail_removes: AtomicU32::new(0),
            writes: AtomicU64::new(0),
            removes: AtomicU64::new(0),
        }
    }

    /// Pin reported usage.
    pub fn set_usage(&self, usage: Usage) {
        self.capacity_kb.store(usage.kb, Ordering::SeqCst);
        self.used_override_kb.store(usage.kb_used, Ordering::SeqCst);
    }

    /// Make every write fail until switched off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` removes fail.
    pub fn fail_next_removes(&self, n: u32) {
        self.fail_removes.store(n, Ordering::SeqCst);
    }

    /// Number of records in `pool`.
    pub fn record_count(&self, pool: &str) -> usize {
        self.records.iter().filter(|e| e.key().0 == pool).count()
    }

    /// Whether `name` exists in `pool`.
    pub fn contains(&self, pool: &str, name: &str) -> bool {
        self.records
            .contains_key(&(pool.to_string(), name.to_string()))
    }

    /// Total write calls served.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Total remove calls served.
    pub fn remove_count(&self) -> u64 {
        self.removes.load(Ordering::Relaxed)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Backend {
                cluster: self.fsid.clone(),
                reason: "write rejected".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RawObjectStore for MemoryObjectStore {
    fn fsid(&self) -> &str {
        &self.fsid
    }

    async fn write_full(&self, pool: &str, name: &str, data: Bytes) -> Result<()> {
        self.check_writable()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.records
            .insert((pool.to_string(), name.to_string()), data.to_vec());
        Ok(())
    }

    async fn write_at(&self, pool: &str, name: &str, offset: u64, data: Bytes) -> Result<()> {
        self.check_writable()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut record = self
            .records
            .entry((pool.to_string(), name.to_string()))
            .or_default();
        let offset = offset as usize;
        let end = offset + data.len();
        if record.len() < end {
            record.resize(end, 0);
        }
        record[offset..end].copy_from_slice(&data);
        Ok(())
    }

    async fn read_at(&self, pool: &str, name: &str, offset: u64, len: usize) -> Result<Bytes> {
        let record = self
            .records
            .get(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| Error::ObjectNotFound(format!("{}/{}", pool, name)))?;
        let start = (offset as usize).min(record.len());
        let end = start.saturating_add(len).min(record.len());
        Ok(Bytes::copy_from_slice(&record[start..end]))
    }

    async fn size(&self, pool: &str, name: &str) -> Result<Option<u64>> {
        Ok(self
            .records
            .get(&(pool.to_string(), name.to_string()))
            .map(|r| r.len() as u64))
    }

    async fn remove(&self, pool: &str, name: &str) -> Result<bool> {
        let failing = self
            .fail_removes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Backend {
                cluster: self.fsid.clone(),
                reason: "remove rejected".to_string(),
            });
        }
        self.removes.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .records
            .remove(&(pool.to_string(), name.to_string()))
            .is_some())
    }

    async fn usage(&self) -> Result<Usage> {
        let kb = self.capacity_kb.load(Ordering::SeqCst);
        let pinned = self.used_override_kb.load(Ordering::SeqCst);
        let kb_used = if pinned != u64::MAX {
            pinned
        } else {
            let bytes: u64 = self.records.iter().map(|r| r.value().len() as u64).sum();
            bytes.div_ceil(1024)
        };
        Ok(Usage { kb, kb_used })
    }
}
