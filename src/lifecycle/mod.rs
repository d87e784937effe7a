//! Bucket Lifecycle
//!
//! Expiration, transition and multipart cleanup driven by per-bucket
//! lifecycle documents.
//!
//! # Components
//!
//! - **Model** (`model.rs`): the XML document, its parser, validator and
//!   marshaller.
//! - **Evaluator** (`evaluate.rs`): pure rule evaluation for current
//!   versions, non-current versions and incomplete uploads.
//! - **Job** (`job.rs`): the envelope published from scanner to worker.
//! - **Scanner** (`scanner.rs`): walks an assigned key range and publishes
//!   jobs keyed by object name.
//! - **Worker** (`worker.rs`): applies jobs from one bus partition through
//!   the data path.
//!
//! ```text
//! metadata ──range scan──▶ scanner ──publish(key)──▶ bus partition ──▶ worker ──▶ data path
//! ```

pub mod evaluate;
pub mod job;
pub mod model;
pub mod scanner;
pub mod worker;

#[cfg(test)]
mod proptest;

pub use evaluate::{
    compute_action, compute_action_for_abort, compute_action_for_noncurrent, Action, Decision,
    EvalContext, ObjectFacts,
};
pub use job::LifecycleJob;
pub use model::{common_prefix, Lifecycle, Rule, RuleSets, RuleStatus, MAX_RULES};
pub use scanner::{LifecycleScanner, ScanStats, ScannerConfig};
pub use worker::{JobOutcome, LifecycleWorker};
