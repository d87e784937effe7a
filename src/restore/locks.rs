//! Held-lock keeper
//!
//! Tracks the distributed locks this process holds, extends them on an
//! interval and releases them on shutdown. A lock service failure is
//! fatal: it cancels the process-wide fatal token once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::GatewayConfig;
use crate::domain::{LockLease, LockService};
use crate::error::Result;

/// Lease length in minutes.
pub const LOCK_MINUTES: u64 = 45;

/// Refresh interval in minutes.
pub const REFRESH_MINUTES: u64 = 30;

/// Configuration for the lock keeper
#[derive(Debug, Clone)]
pub struct LockKeeperConfig {
    /// Lease length
    pub ttl: Duration,

    /// How often held leases are extended
    pub refresh_interval: Duration,
}

impl Default for LockKeeperConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(LOCK_MINUTES * 60),
            refresh_interval: Duration::from_secs(REFRESH_MINUTES * 60),
        }
    }
}

impl LockKeeperConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.restore.lock_minutes * 60),
            refresh_interval: Duration::from_secs(config.restore.refresh_minutes * 60),
        }
    }
}

pub struct LockKeeper {
    service: Arc<dyn LockService>,
    config: LockKeeperConfig,
    held: Mutex<HashMap<String, LockLease>>,
    fatal: CancellationToken,
}

impl LockKeeper {
    pub fn new(
        service: Arc<dyn LockService>,
        config: LockKeeperConfig,
        fatal: CancellationToken,
    ) -> Self {
        Self {
            service,
            config,
            held: Mutex::new(HashMap::new()),
            fatal,
        }
    }

    fn raise_fatal(&self, context: &str, e: &crate::error::Error) {
        if !self.fatal.is_cancelled() {
            error!("Lock service failure while {}: {}", context, e);
            self.fatal.cancel();
        }
    }

    /// Take `key`. `Ok(None)` means another holder has it.
    pub async fn obtain(&self, key: &str) -> Result<Option<LockLease>> {
        match self.service.obtain(key, self.config.ttl).await {
            Ok(Some(lease)) => {
                debug!("Obtained lock {}", key);
                self.held.lock().insert(key.to_string(), lease.clone());
                Ok(Some(lease))
            }
            Ok(None) => {
                debug!("Lock {} is held elsewhere", key);
                Ok(None)
            }
            Err(e) => {
                self.raise_fatal("obtaining a lock", &e);
                Err(e)
            }
        }
    }

    /// Whether `key` is still held by this process.
    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains_key(key)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Release `key` if held.
    pub async fn release(&self, key: &str) {
        let Some(lease) = self.held.lock().remove(key) else {
            return;
        };
        match self.service.release(&lease).await {
            Ok(()) => debug!("Released lock {}", key),
            Err(e) => self.raise_fatal("releasing a lock", &e),
        }
    }

    /// Extend every held lease once. Lost leases are dropped from the set.
    /// Returns the number still held.
    pub async fn refresh_all(&self) -> usize {
        let leases: Vec<LockLease> = self.held.lock().values().cloned().collect();
        for lease in leases {
            match self.service.refresh(&lease, self.config.ttl).await {
                Ok(true) => debug!("Refreshed lock {}", lease.key),
                Ok(false) => {
                    warn!("Lost lock {}, abandoning its work", lease.key);
                    let mut held = self.held.lock();
                    if held.get(&lease.key) == Some(&lease) {
                        held.remove(&lease.key);
                    }
                }
                Err(e) => {
                    self.raise_fatal("refreshing locks", &e);
                    break;
                }
            }
        }
        self.held_count()
    }

    /// Extend held leases on the refresh interval until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run_refresher(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Starting lock refresher, ttl {:?}, every {:?}",
            self.config.ttl, self.config.refresh_interval
        );
        let mut tick = tokio::time::interval(self.config.refresh_interval);
        // The first tick fires immediately; nothing is held yet.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let held = self.refresh_all().await;
                    debug!("Lock refresh pass, {} held", held);
                }
            }
        }
        info!("Lock refresher stopped");
    }

    /// Release everything still held.
    pub async fn release_all(&self) {
        let keys: Vec<String> = self.held.lock().keys().cloned().collect();
        if !keys.is_empty() {
            info!("Releasing {} held locks", keys.len());
        }
        for key in keys {
            self.release(&key).await;
        }
    }
}
