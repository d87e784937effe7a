//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the
//! Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                             │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                          │ │
//! │  │  Cluster │ RawObjectStore │ KvStore │ MessageBus │ Locks   │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                      │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ StripedCluster │ DirectCluster │ MemoryObjectStore         │ │
//! │  │ FsObjectStore │ MemoryKvStore │ PartitionedBus             │ │
//! │  │ InMemoryLockService │ BackendRegistry                      │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use objgate::adapters::{MemoryObjectStore, StripedCluster, StripedClusterConfig};
//! use objgate::domain::{Cluster, Pool};
//!
//! let store = Arc::new(MemoryObjectStore::new("cluster-a"));
//! let cluster = StripedCluster::new(store, StripedClusterConfig::default());
//! let put = cluster.put(Pool::Big, &mut body).await?;
//! ```

mod direct;
mod fs_store;
pub mod layout;
mod memory_kv;
mod memory_lock;
mod memory_store;
mod message_bus;
mod registry;
mod striped;

pub use direct::DirectCluster;
pub use fs_store::FsObjectStore;
pub use layout::{StripeLayout, STRIPE_COUNT, STRIPE_OBJECT_SIZE, STRIPE_UNIT};
pub use memory_kv::MemoryKvStore;
pub use memory_lock::InMemoryLockService;
pub use memory_store::MemoryObjectStore;
pub use message_bus::{
    partition_for, CompositeMessageBus, InMemoryMessageCollector, LoggingMessageBus,
    PartitionedBus,
};
pub use registry::{BackendRegistry, ClusterFactory};
pub use striped::{StripedCluster, StripedClusterConfig};
