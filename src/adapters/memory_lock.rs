//! In-memory lease lock service
//!
//! Single-process stand-in for a distributed lock service. Leases expire
//! after their TTL and are identified by a random token so a stale holder
//! cannot refresh or release someone else's lease.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::{LockLease, LockService};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Held {
    token: String,
    expires: Instant,
}

/// In-memory [`LockService`].
#[derive(Debug, Default)]
pub struct InMemoryLockService {
    locks: DashMap<String, Held>,
    unavailable: AtomicBool,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Whether `key` is currently held.
    pub fn is_held(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|h| h.expires > Instant::now())
            .unwrap_or(false)
    }

    /// Number of unexpired leases.
    pub fn held_count(&self) -> usize {
        let now = Instant::now();
        self.locks.iter().filter(|h| h.expires > now).count()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::LockService("lock service unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn obtain(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>> {
        self.check_available()?;
        let now = Instant::now();
        let token = uuid::Uuid::new_v4().to_string();
        let mut entry = self.locks.entry(key.to_string()).or_insert_with(|| Held {
            token: String::new(),
            expires: now,
        });
        if entry.expires > now {
            return Ok(None);
        }
        *entry = Held {
            token: token.clone(),
            expires: now + ttl,
        };
        Ok(Some(LockLease {
            key: key.to_string(),
            token,
        }))
    }

    async fn refresh(&self, lease: &LockLease, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        match self.locks.get_mut(&lease.key) {
            Some(mut held) if held.token == lease.token && held.expires > Instant::now() => {
                held.expires = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<()> {
        self.check_available()?;
        self.locks
            .remove_if(&lease.key, |_, held| held.token == lease.token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_obtain_is_exclusive() {
        let locks = InMemoryLockService::new();
        let lease = locks
            .obtain("k", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(locks.obtain("k", Duration::from_secs(60)).await.unwrap().is_none());
        locks.release(&lease).await.unwrap();
        assert!(locks.obtain("k", Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let locks = InMemoryLockService::new();
        let stale = locks
            .obtain("k", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fresh = locks.obtain("k", Duration::from_secs(60)).await.unwrap();
        assert!(fresh.is_some());
        assert!(!locks.refresh(&stale, Duration::from_secs(60)).await.unwrap());
        locks.release(&stale).await.unwrap();
        assert!(locks.is_held("k"));
    }

    #[tokio::test]
    async fn test_refresh_extends() {
        let locks = InMemoryLockService::new();
        let lease = locks
            .obtain("k", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(locks.refresh(&lease, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let locks = InMemoryLockService::new();
        locks.set_unavailable(true);
        assert_matches!(
            locks.obtain("k", Duration::from_secs(1)).await,
            Err(Error::LockService(_))
        );
    }
}
