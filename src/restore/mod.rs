//! Archive Restore
//!
//! Restores archived objects into a hot pool on request and removes the
//! restored copy once its lifetime ends.
//!
//! - **Locks** (`locks.rs`): per-freezer distributed locks, refreshed in
//!   the background and released on shutdown.
//! - **Orchestrator** (`orchestrator.rs`): the restore and elimination
//!   passes over freezer records.

pub mod locks;
pub mod orchestrator;

pub use locks::{LockKeeper, LockKeeperConfig, LOCK_MINUTES, REFRESH_MINUTES};
pub use orchestrator::{
    lock_key, needs_elimination, OrchestratorConfig, PassStats, RestoreOrchestrator,
    RestoreOutcome, MAX_LIST_NUM,
};
