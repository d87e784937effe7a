//! objgate - S3 Object Gateway Core
//!
//! The storage side of an S3-compatible gateway: pluggable cluster
//! backends behind a weighted selector, an adaptive pipelined writer,
//! bucket lifecycle management, restore of archived objects and
//! asynchronous garbage collection of backend blobs.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!   requests ───▶ │  DataPath    │ ──pick──▶ ClusterSelector ──▶ Cluster (striped / direct)
//!                 └──────┬───────┘
//!                        │ records                      ▲ remove
//!                        ▼                              │
//!                    MetaStore ◀── scanner ──▶ bus ──▶ worker      RecycleQueue
//!                        ▲
//!                        └── restore orchestrator (locks, refresher)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Cluster backends, stores, bus and lock implementations
//! - [`circuit`] - Per-destination circuit breaker for outbound HTTP
//! - [`config`] - YAML configuration
//! - [`domain`] - Port traits and shared value types
//! - [`error`] - Error taxonomy and client-facing codes
//! - [`lifecycle`] - Lifecycle documents, evaluation, scanner and worker
//! - [`meta`] - Metadata records and their key layout
//! - [`metrics`] - Prometheus metrics
//! - [`restore`] - Restore of archived objects
//! - [`storage`] - Data path, selector, writer and recycle queue

pub mod adapters;
pub mod circuit;
pub mod config;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod meta;
pub mod metrics;
pub mod restore;
pub mod storage;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use lifecycle::{Lifecycle, LifecycleScanner, LifecycleWorker};
pub use restore::RestoreOrchestrator;
pub use storage::DataPath;
