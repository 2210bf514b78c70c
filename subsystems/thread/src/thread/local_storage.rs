//! # Thread-Local Storage
//!
//! Symbol-keyed locals for one thread. Each fiber hosted by the thread sees
//! its own table; the root fiber's table is the thread's plain locals.

use crate::value::{Symbol, Value};
use crate::FiberId;
use std::collections::BTreeMap;
use spin::RwLock;

/// Per-thread locals, partitioned by fiber
#[derive(Default)]
pub struct ThreadLocals {
    tables: RwLock<BTreeMap<FiberId, BTreeMap<Symbol, Value>>>,
}

impl ThreadLocals {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
        }
    }

    /// Look up a local
    pub fn get(&self, fiber: FiberId, key: &Symbol) -> Option<Value> {
        self.tables
            .read()
            .get(&fiber)
            .and_then(|table| table.get(key).cloned())
    }

    /// Insert or overwrite a local, returning the previous value
    pub fn set(&self, fiber: FiberId, key: Symbol, value: Value) -> Option<Value> {
        self.tables
            .write()
            .entry(fiber)
            .or_default()
            .insert(key, value)
    }

    /// Delete a local
    pub fn remove(&self, fiber: FiberId, key: &Symbol) -> Option<Value> {
        let mut tables = self.tables.write();
        let table = tables.get_mut(&fiber)?;
        let removed = table.remove(key);
        if table.is_empty() {
            tables.remove(&fiber);
        }
        removed
    }

    /// Snapshot of the keys visible to `fiber`
    pub fn keys(&self, fiber: FiberId) -> Vec<Symbol> {
        self.tables
            .read()
            .get(&fiber)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Existence test
    pub fn contains(&self, fiber: FiberId, key: &Symbol) -> bool {
        self.tables
            .read()
            .get(&fiber)
            .map(|table| table.contains_key(key))
            .unwrap_or(false)
    }

    /// Drop every local of a finished fiber
    pub fn drop_fiber(&self, fiber: FiberId) {
        self.tables.write().remove(&fiber);
    }

    /// Drop all locals
    pub fn clear(&self) {
        self.tables.write().clear();
    }

    /// Number of locals visible to `fiber`
    pub fn len(&self, fiber: FiberId) -> usize {
        self.tables
            .read()
            .get(&fiber)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Reset the lock after fork
    ///
    /// # Safety
    /// No live thread may hold the lock.
    pub(crate) unsafe fn reinit_after_fork(&self) {
        // SAFETY: guaranteed by the caller.
        unsafe { crate::sync::reset_spin_rwlock(&self.tables) };
    }
}

// =============================================================================
// TESTS
// =============================================================================
