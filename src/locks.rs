//! Per-resource mutual exclusion shared by scans, deployment runs, auto-fix
//! and rollback. Locks are created lazily and never block unrelated
//! resources. A slot is dropped from the table once its last holder and
//! waiter are gone, so the table only tracks ids that are in use.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::errors::{EngineError, Result};

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// Guard for one resource; released on drop
pub struct ResourceGuard {
    guard: Option<OwnedMutexGuard<()>>,
    resource_id: String,
    locks: Arc<LockTable>,
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard").field("resource_id", &self.resource_id).finish()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table's own handle left: nobody holds or waits on this slot.
        // The shard lock makes this check atomic with `slot()` cloning.
        self.locks.remove_if(&self.resource_id, |_, slot| Arc::strong_count(slot) == 1);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceLocks {
    locks: Arc<LockTable>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, resource_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(resource_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn wrap(&self, resource_id: &str, guard: OwnedMutexGuard<()>) -> ResourceGuard {
        ResourceGuard {
            guard: Some(guard),
            resource_id: resource_id.to_string(),
            locks: self.locks.clone(),
        }
    }

    /// Wait for exclusive access to `resource_id`
    pub async fn acquire(&self, resource_id: &str) -> ResourceGuard {
        let guard = self.slot(resource_id).lock_owned().await;
        self.wrap(resource_id, guard)
    }

    /// Exclusive access without waiting; `Conflict` if another operation holds it
    pub fn try_acquire(&self, resource_id: &str) -> Result<ResourceGuard> {
        match self.slot(resource_id).try_lock_owned() {
            Ok(guard) => Ok(self.wrap(resource_id, guard)),
            Err(_) => {
                Err(EngineError::conflict(resource_id, "another operation holds this resource"))
            }
        }
    }

    pub fn is_locked(&self, resource_id: &str) -> bool {
        self.locks.get(resource_id).map(|slot| slot.try_lock().is_err()).unwrap_or(false)
    }

    /// Number of ids with a live slot
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}
