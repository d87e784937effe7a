//! Domain Layer
//!
//! Port traits and value objects shared by the data path, lifecycle and
//! restore subsystems.
//!
//! # Usage
//!
//! ```ignore
//! use objgate::domain::ports::{Cluster, Pool};
//!
//! async fn store(cluster: &dyn Cluster, body: &mut BodyReader<'_>) -> Result<String> {
//!     let put = cluster.put(Pool::Big, body).await?;
//!     Ok(put.object_id)
//! }
//! ```

pub mod ports;

pub use ports::{
    not_found_as_no_such_key, BackendTuple, BodyReader, BusMessage, Cluster, KvStore, LockLease,
    LockService, MessageBus, ObjectReader, Pool, PutResult, RawObjectStore, Usage,
};
