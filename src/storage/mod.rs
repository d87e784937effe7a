//! Data Path
//!
//! Everything between a request body and the backend clusters.
//!
//! # Components
//!
//! - **Writer** (`writer.rs`): adaptive pipelined chunk writer used by
//!   striped backends.
//! - **Selector** (`selector.rs`): usage-aware weighted cluster choice and
//!   pool choice by size and storage class.
//! - **Reader** (`reader.rs`): range resolution and multipart composition.
//! - **Recycle** (`recycle.rs`): asynchronous removal of orphaned blobs,
//!   persisted across restarts through the GC table.
//! - **DataPath** (`datapath.rs`): put/append/get/delete/transition
//!   operations over the pieces above.

pub mod datapath;
pub mod reader;
pub mod recycle;
pub mod selector;
pub mod writer;

#[cfg(test)]
mod proptest;

pub use datapath::{check_integrity, object_record, CopiedData, DataPath, StoredData};
pub use reader::ByteRange;
pub use recycle::{RecycleItem, RecycleQueue, RecycleQueueConfig, MAX_TRY_TIMES};
pub use selector::{ClusterSelector, ClusterWeight, SelectorConfig, CLUSTER_MAX_USED_SPACE_PERCENT};
pub use writer::{
    ChunkSink, PipelinedWriter, WindowChange, WindowController, WriteOutcome, WriterConfig,
    AIO_CONCURRENT, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
