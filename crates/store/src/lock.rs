//! Per-row exclusive locking
//!
//! Non-blocking only: `try_lock` either hands back a guard or reports the
//! row as busy. There is no wait queue, callers that lose simply skip the
//! row and come back later.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Table of rows currently locked for maintenance
#[derive(Clone, Default)]
pub struct RowLockTable {
    locked: Arc<Mutex<HashSet<Vec<u8>>>>,
}

impl RowLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to lock a row, returning a guard that unlocks on drop
    pub fn try_lock(&self, row: &[u8]) -> Option<RowLockGuard> {
        let mut locked = self.locked.lock();
        if locked.contains(row) {
            return None;
        }
        locked.insert(row.to_vec());

        Some(RowLockGuard {
            table: Arc::clone(&self.locked),
            row: row.to_vec(),
        })
    }

    /// Check whether a row is currently locked
    pub fn is_locked(&self, row: &[u8]) -> bool {
        self.locked.lock().contains(row)
    }
}

/// RAII guard for one locked row
pub struct RowLockGuard {
    table: Arc<Mutex<HashSet<Vec<u8>>>>,
    row: Vec<u8>,
}

impl Drop for RowLockGuard {
    fn drop(&mut self) {
        self.table.lock().remove(&self.row);
    }
}
