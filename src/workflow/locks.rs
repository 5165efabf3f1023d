//! Per-workflow coordination point
//!
//! Token verification holds a shared guard while it reads `rotated_at`; rotation
//! and issuance hold the exclusive guard while they write. A verify that observes
//! the old `rotated_at` therefore completes before the rotation becomes visible.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// One reader/writer lock per workflow id, created on first use
#[derive(Debug, Default)]
pub struct WorkflowLocks {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl WorkflowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, workflow_id: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Shared guard for readers of `rotated_at`
    pub async fn read(&self, workflow_id: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(workflow_id).await.read_owned().await
    }

    /// Exclusive guard for rotation and issuance
    pub async fn write(&self, workflow_id: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(workflow_id).await.write_owned().await
    }
}
