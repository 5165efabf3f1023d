//! Workflow identity layer
//!
//! Workflow records, their SQLite persistence, and the per-workflow lock that
//! serialises token rotation against in-flight verification.

// Core workflow type definitions
pub mod types;

// SQLite persistence for workflows and the issued-token ledger
pub mod storage;

// Per-workflow read/write coordination
pub mod locks;

pub use locks::WorkflowLocks;
pub use storage::WorkflowStorage;
pub use types::Workflow;
