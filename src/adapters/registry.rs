//! Backend registry
//!
//! Maps backend names used in configuration onto constructors, so new
//! cluster implementations plug in without touching the data path.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::info;

use super::direct::DirectCluster;
use super::fs_store::FsObjectStore;
use super::memory_store::MemoryObjectStore;
use super::striped::{StripedCluster, StripedClusterConfig};
use crate::config::ClusterConfig;
use crate::domain::Cluster;
use crate::error::{Error, Result};

/// Nominal capacity reported by file backed stores.
const FS_CAPACITY_KB: u64 = 1 << 30;

type BuildFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn Cluster>>> + Send>>;

/// Cluster constructor.
pub type ClusterFactory = Arc<dyn Fn(ClusterConfig, StripedClusterConfig) -> BuildFuture + Send + Sync>;

/// Registered backend constructors.
pub struct BackendRegistry {
    factories: HashMap<String, ClusterFactory>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("memory", Arc::new(memory_striped));
        registry.register("fs", Arc::new(fs_striped));
        registry.register("direct-memory", Arc::new(memory_direct));
        registry.register("direct-fs", Arc::new(fs_direct));
        registry
    }
}

fn memory_striped(cluster: ClusterConfig, striped: StripedClusterConfig) -> BuildFuture {
    Box::pin(async move {
        let store = Arc::new(MemoryObjectStore::new(cluster.id));
        Ok(Arc::new(StripedCluster::new(store, striped)) as Arc<dyn Cluster>)
    })
}

fn fs_striped(cluster: ClusterConfig, striped: StripedClusterConfig) -> BuildFuture {
    Box::pin(async move {
        let path = require_path(&cluster)?;
        let store = Arc::new(FsObjectStore::open(cluster.id, path, FS_CAPACITY_KB).await?);
        Ok(Arc::new(StripedCluster::new(store, striped)) as Arc<dyn Cluster>)
    })
}

fn memory_direct(cluster: ClusterConfig, striped: StripedClusterConfig) -> BuildFuture {
    Box::pin(async move {
        let store = Arc::new(MemoryObjectStore::new(cluster.id));
        Ok(Arc::new(DirectCluster::new(store, striped.layout.object_size)) as Arc<dyn Cluster>)
    })
}

fn fs_direct(cluster: ClusterConfig, striped: StripedClusterConfig) -> BuildFuture {
    Box::pin(async move {
        let path = require_path(&cluster)?;
        let store = Arc::new(FsObjectStore::open(cluster.id, path, FS_CAPACITY_KB).await?);
        Ok(Arc::new(DirectCluster::new(store, striped.layout.object_size)) as Arc<dyn Cluster>)
    })
}

fn require_path(cluster: &ClusterConfig) -> Result<std::path::PathBuf> {
    cluster.path.clone().ok_or_else(|| {
        Error::Config(format!("cluster {} ({}) needs a path", cluster.id, cluster.backend))
    })
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a constructor.
    pub fn register(&mut self, name: &str, factory: ClusterFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build one cluster.
    pub async fn build(
        &self,
        cluster: &ClusterConfig,
        striped: &StripedClusterConfig,
    ) -> Result<Arc<dyn Cluster>> {
        let factory = self.factories.get(&cluster.backend).ok_or_else(|| {
            Error::Config(format!(
                "unknown backend {:?} for cluster {}",
                cluster.backend, cluster.id
            ))
        })?;
        let built = factory(cluster.clone(), striped.clone()).await?;
        info!("Cluster {} ready ({})", cluster.id, cluster.backend);
        Ok(built)
    }

    /// Build every configured cluster, keyed by id.
    pub async fn build_all(
        &self,
        clusters: &[ClusterConfig],
        striped: &StripedClusterConfig,
    ) -> Result<HashMap<String, Arc<dyn Cluster>>> {
        let mut built = HashMap::with_capacity(clusters.len());
        for cluster in clusters {
            if built.contains_key(&cluster.id) {
                return Err(Error::Config(format!("duplicate cluster id {}", cluster.id)));
            }
            built.insert(cluster.id.clone(), self.build(cluster, striped).await?);
        }
        Ok(built)
    }
}
