//! # Recursion Tracking
//!
//! Objects currently being traversed by this thread (inspect, hash, ==).
//! A traversal that reaches an object already in the set is recursive.

use crate::value::ObjectId;
use std::collections::BTreeSet;
use spin::Mutex;

/// Set of objects on this thread's traversal stack
#[derive(Debug, Default)]
pub struct RecursionTracker {
    active: Mutex<BTreeSet<ObjectId>>,
}

impl RecursionTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            active: Mutex::new(BTreeSet::new()),
        }
    }

    /// Mark `object` as entered; returns `false` if it already was
    pub fn enter(&self, object: ObjectId) -> bool {
        self.active.lock().insert(object)
    }

    /// Mark `object` as left
    pub fn exit(&self, object: ObjectId) {
        self.active.lock().remove(&object);
    }

    /// Check if `object` is being traversed
    pub fn contains(&self, object: ObjectId) -> bool {
        self.active.lock().contains(&object)
    }

    /// Number of objects being traversed
    pub fn depth(&self) -> usize {
        self.active.lock().len()
    }

    /// Forget every entry
    pub fn clear(&self) {
        self.active.lock().clear();
    }

    /// Reset the lock after fork
    ///
    /// # Safety
    /// No live thread may hold the lock.
    pub(crate) unsafe fn reinit_after_fork(&self) {
        // SAFETY: guaranteed by the caller.
        unsafe { crate::sync::reset_spin_mutex(&self.active) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_exit() {
        let tracker = RecursionTracker::new();
        let a = ObjectId::of(&1u8);

        assert!(tracker.enter(a));
        assert!(!tracker.enter(a));
        assert!(tracker.contains(a));
        tracker.exit(a);
        assert!(!tracker.contains(a));
        assert_eq!(tracker.depth(), 0);
    }
}
