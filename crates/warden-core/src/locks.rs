//! Per-sandbox mutual exclusion.
//!
//! Every mutation of a sandbox record holds that sandbox's async mutex, which
//! serializes exec/destroy/expiry against each other without a global lock.
//! Entries are pruned once a sandbox reaches a terminal status so the map
//! does not grow with the audit trail.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

#[derive(Default)]
pub struct SandboxLocks {
    inner: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl SandboxLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `sandbox_id`; lock it with `.lock().await`. The outer map
    /// lock is held only for the lookup, never across an await point.
    pub fn handle(&self, sandbox_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.inner
            .lock()
            .entry(sandbox_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drops the entry unless another task still holds a handle. Called after
    /// a sandbox reaches a terminal status; a concurrent holder simply
    /// re-creates nothing and the entry dies with its last handle's next
    /// prune.
    pub fn prune(&self, sandbox_id: Uuid) {
        let mut map = self.inner.lock();
        if let Some(lock) = map.get(&sandbox_id) {
            if Arc::strong_count(lock) == 1 {
                map.remove(&sandbox_id);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
