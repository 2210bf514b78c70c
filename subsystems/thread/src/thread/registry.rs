//! # Thread Registry
//!
//! Every live thread entity, keyed by id, plus the binding from native
//! threads back to entities used to resolve the current thread. The registry
//! has its own lock and never takes a thread's join lock.

use super::Thread;
use crate::{NativeThreadId, ThreadError, ThreadId, ThreadResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use spin::RwLock;

#[derive(Default)]
struct RegistryInner {
    /// All threads by ID
    threads: BTreeMap<ThreadId, Arc<Thread>>,
    /// Entity bound to each native thread
    natives: HashMap<NativeThreadId, ThreadId>,
}

/// Thread registry
#[derive(Default)]
pub struct ThreadRegistry {
    inner: RwLock<RegistryInner>,
}

impl ThreadRegistry {
    /// Create a new registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thread
    pub fn register(&self, thread: Arc<Thread>) -> ThreadResult<()> {
        let id = thread.id();
        let mut inner = self.inner.write();
        if inner.threads.contains_key(&id) {
            return Err(ThreadError::AlreadyRegistered);
        }
        inner.threads.insert(id, thread);
        Ok(())
    }

    /// Bind the native thread running `id`
    pub fn bind_native(&self, id: ThreadId, native: NativeThreadId) -> ThreadResult<()> {
        let mut inner = self.inner.write();
        if !inner.threads.contains_key(&id) {
            return Err(ThreadError::UnknownThread);
        }
        inner.natives.insert(native, id);
        Ok(())
    }

    /// Unregister a thread and its native binding
    pub fn unregister(&self, id: ThreadId) -> Option<Arc<Thread>> {
        let mut inner = self.inner.write();
        let thread = inner.threads.remove(&id)?;
        inner.natives.retain(|_, bound| *bound != id);
        Some(thread)
    }

    /// Get a thread by ID
    pub fn get(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.inner.read().threads.get(&id).cloned()
    }

    /// Get the thread bound to a native thread
    pub fn by_native(&self, native: NativeThreadId) -> Option<Arc<Thread>> {
        let inner = self.inner.read();
        inner
            .natives
            .get(&native)
            .and_then(|id| inner.threads.get(id))
            .cloned()
    }

    /// Like [`Self::by_native`], but `None` if the lock is held
    pub(crate) fn try_by_native(&self, native: NativeThreadId) -> Option<Option<Arc<Thread>>> {
        let inner = self.inner.try_read()?;
        Some(
            inner
                .natives
                .get(&native)
                .and_then(|id| inner.threads.get(id))
                .cloned(),
        )
    }

    /// Point-in-time copy of every registered thread, ordered by id
    pub fn snapshot(&self) -> Vec<Arc<Thread>> {
        self.inner.read().threads.values().cloned().collect()
    }

    /// Get thread count
    pub fn count(&self) -> usize {
        self.inner.read().threads.len()
    }

    /// Check if a thread is registered
    pub fn contains(&self, id: ThreadId) -> bool {
        self.inner.read().threads.contains_key(&id)
    }

    /// Iterate over a snapshot of all threads
    ///
    /// The registry lock is not held while `f` runs.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Thread>),
    {
        for thread in self.snapshot() {
            f(&thread);
        }
    }

    /// Drop every thread except `keep`, returning the removed ones
    pub(crate) fn retain_only(&self, keep: ThreadId) -> Vec<Arc<Thread>> {
        let mut inner = self.inner.write();
        let all = core::mem::take(&mut inner.threads);
        let mut removed = Vec::new();
        for (id, thread) in all {
            if id == keep {
                inner.threads.insert(id, thread);
            } else {
                removed.push(thread);
            }
        }
        inner.natives.retain(|_, bound| *bound == keep);
        removed
    }

    /// Reset the registry lock after fork
    ///
    /// # Safety
    /// No live thread may hold the lock.
    pub(crate) unsafe fn reinit_after_fork(&self) {
        // SAFETY: guaranteed by the caller.
        unsafe { crate::sync::reset_spin_rwlock(&self.inner) };
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(raw: u64) -> Arc<Thread> {
        Arc::new(Thread::new(ThreadId::new(raw), None))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ThreadRegistry::new();
        registry.register(entity(2)).unwrap();
        registry.register(entity(3)).unwrap();

        assert_eq!(registry.count(), 2);
        assert!(registry.contains(ThreadId::new(2)));
        assert_eq!(registry.get(ThreadId::new(3)).unwrap().id(), ThreadId::new(3));
        assert_eq!(
            registry.register(entity(2)),
            Err(ThreadError::AlreadyRegistered)
        );
    }

    #[test]
    fn test_native_binding() {
        let registry = ThreadRegistry::new();
        let native = std::thread::current().id();

        assert_eq!(
            registry.bind_native(ThreadId::new(2), native),
            Err(ThreadError::UnknownThread)
        );
        registry.register(entity(2)).unwrap();
        registry.bind_native(ThreadId::new(2), native).unwrap();
        assert_eq!(registry.by_native(native).unwrap().id(), ThreadId::new(2));

        registry.unregister(ThreadId::new(2)).unwrap();
        assert!(registry.by_native(native).is_none());
    }

    #[test]
    fn test_snapshot_is_not_live() {
        let registry = ThreadRegistry::new();
        registry.register(entity(2)).unwrap();
        let snapshot = registry.snapshot();
        registry.unregister(ThreadId::new(2));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_retain_only() {
        let registry = ThreadRegistry::new();
        for raw in 1..=4 {
            registry.register(entity(raw)).unwrap();
        }

        let removed = registry.retain_only(ThreadId::new(1));
        assert_eq!(removed.len(), 3);
        assert_eq!(registry.count(), 1);
        assert!(registry.contains(ThreadId::new(1)));
    }

    #[test]
    fn test_reinit_after_fork() {
        let registry = ThreadRegistry::new();
        core::mem::forget(registry.inner.write());
        unsafe { registry.reinit_after_fork() };
        registry.register(entity(2)).unwrap();
        assert_eq!(registry.count(), 1);
    }
}
