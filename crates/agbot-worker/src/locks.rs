//! Agreement Lock Manager
//!
//! Per-agreement mutual exclusion. Handlers for the same agreement id are
//! strictly serialized; handlers for distinct ids run in parallel. The lock
//! itself is an async mutex because critical sections span store and
//! exchange awaits.
//!
//! Lock lifecycle: created on first use of an id, deleted only by the
//! top-level cancel-with-lock path after the cancel completes. Callers must
//! not hold the lock at the moment of deletion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

/// Map of agreement id to its mutual-exclusion primitive.
#[derive(Default)]
pub struct AgreementLockManager {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AgreementLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `agreement_id`, created on first use. The same id
    /// always yields the same lock instance until it is deleted.
    pub fn get_lock(&self, agreement_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        locks
            .entry(agreement_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drop the mapping for `agreement_id`. A later `get_lock` for the same
    /// id creates a fresh lock.
    pub fn delete_lock(&self, agreement_id: &str) {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        locks.remove(agreement_id);
    }

    /// Whether a lock currently exists for `agreement_id`.
    pub fn has_lock(&self, agreement_id: &str) -> bool {
        let locks = self.locks.lock().expect("lock map poisoned");
        locks.contains_key(agreement_id)
    }
}
