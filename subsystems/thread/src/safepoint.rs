//! # Collector Handshake
//!
//! Every running thread is a mutator. A collector that needs every thread's
//! native context to hold still calls [`Safepoints::stop_world`]; mutators
//! park at their next safe point, and threads blocked in a safe region
//! (sleep, join) already count as parked. Dropping the [`WorldStopped`]
//! guard resumes everyone.

use crate::sync;
use crate::ThreadId;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

#[derive(Debug, Default)]
struct SafepointState {
    /// Registered mutators
    mutators: BTreeSet<ThreadId>,
    /// Parked mutators, with safe region nesting depth
    parked: BTreeMap<ThreadId, usize>,
}

impl SafepointState {
    fn park(&mut self, id: ThreadId) {
        *self.parked.entry(id).or_insert(0) += 1;
    }

    fn unpark(&mut self, id: ThreadId) {
        if let Some(depth) = self.parked.get_mut(&id) {
            *depth -= 1;
            if *depth == 0 {
                self.parked.remove(&id);
            }
        }
    }

    fn all_parked(&self, caller: Option<ThreadId>) -> bool {
        self.mutators
            .iter()
            .all(|id| Some(*id) == caller || self.parked.contains_key(id))
    }
}

/// Safe point coordination between mutators and a collector
#[derive(Debug, Default)]
pub struct Safepoints {
    requested: AtomicBool,
    state: Mutex<SafepointState>,
    changed: Condvar,
}

impl Safepoints {
    /// Create an idle handshake
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a collector has requested a stop
    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Number of registered mutators
    pub fn mutator_count(&self) -> usize {
        self.state.lock().mutators.len()
    }

    /// Register a mutator, waiting out a stop in progress
    pub fn register(&self, id: ThreadId) {
        let mut state = self.state.lock();
        while self.is_stop_requested() {
            self.changed.wait(&mut state);
        }
        state.mutators.insert(id);
    }

    /// Remove a mutator
    pub fn unregister(&self, id: ThreadId) {
        let mut state = self.state.lock();
        state.mutators.remove(&id);
        state.parked.remove(&id);
        self.changed.notify_all();
    }

    /// Safe point: park while a stop is requested
    pub fn poll(&self, id: ThreadId) {
        if !self.is_stop_requested() {
            return;
        }

        let mut state = self.state.lock();
        if !self.is_stop_requested() {
            return;
        }
        log::trace!("Thread {} parking at safe point", id);
        state.park(id);
        self.changed.notify_all();
        while self.is_stop_requested() {
            self.changed.wait(&mut state);
        }
        state.unpark(id);
    }

    /// Enter a safe region for the lifetime of the guard
    pub fn safe_region(&self, id: ThreadId) -> SafeRegion<'_> {
        let mut state = self.state.lock();
        state.park(id);
        self.changed.notify_all();
        SafeRegion {
            safepoints: self,
            id,
        }
    }

    /// Stop every mutator except `caller`
    ///
    /// Returns `None` if they did not all park before `timeout`.
    pub fn stop_world(
        &self,
        caller: Option<ThreadId>,
        timeout: Duration,
    ) -> Option<WorldStopped<'_>> {
        let deadline = sync::deadline_after(timeout);
        let mut state = self.state.lock();

        // One collector at a time
        while self.is_stop_requested() {
            if wait(&self.changed, &mut state, deadline) {
                return None;
            }
        }
        self.requested.store(true, Ordering::Release);

        loop {
            if state.all_parked(caller) {
                log::debug!("World stopped with {} mutators", state.mutators.len());
                return Some(WorldStopped { safepoints: self });
            }
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                log::warn!("Stopping the world timed out after {:?}", timeout);
                self.requested.store(false, Ordering::Release);
                self.changed.notify_all();
                return None;
            }
            wait(&self.changed, &mut state, deadline);
        }
    }

    fn resume(&self) {
        let _state = self.state.lock();
        self.requested.store(false, Ordering::Release);
        self.changed.notify_all();
        log::debug!("World resumed");
    }

    /// Keep only `survivor` after fork
    ///
    /// # Safety
    /// No live thread may hold the lock.
    pub(crate) unsafe fn reinit_after_fork(&self, survivor: ThreadId) {
        if self.state.is_locked() {
            // SAFETY: the holder no longer exists in this process.
            unsafe { self.state.force_unlock() };
        }
        self.requested.store(false, Ordering::Release);
        let mut state = self.state.lock();
        state.mutators.retain(|id| *id == survivor);
        state.parked.clear();
    }
}

/// Wait on `cond` until `deadline`; returns `true` on timeout
fn wait(
    cond: &Condvar,
    state: &mut MutexGuard<'_, SafepointState>,
    deadline: Option<Instant>,
) -> bool {
    match deadline {
        Some(deadline) => cond.wait_until(state, deadline).timed_out(),
        None => {
            cond.wait(state);
            false
        }
    }
}

/// Marks a thread as parked while it blocks
pub struct SafeRegion<'a> {
    safepoints: &'a Safepoints,
    id: ThreadId,
}

impl Drop for SafeRegion<'_> {
    fn drop(&mut self) {
        let safepoints = self.safepoints;
        let mut state = safepoints.state.lock();
        while safepoints.is_stop_requested() {
            safepoints.changed.wait(&mut state);
        }
        state.unpark(self.id);
    }
}

/// Held by a collector while every mutator is parked
#[must_use = "the world resumes as soon as the guard is dropped"]
pub struct WorldStopped<'a> {
    safepoints: &'a Safepoints,
}

impl Drop for WorldStopped<'_> {
    fn drop(&mut self) {
        self.safepoints.resume();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_stop_without_mutators() {
        let safepoints = Safepoints::new();
        let stopped = safepoints.stop_world(None, TIMEOUT);
        assert!(stopped.is_some());
        assert!(safepoints.is_stop_requested());
        drop(stopped);
        assert!(!safepoints.is_stop_requested());
    }

    #[test]
    fn test_caller_is_excluded() {
        let safepoints = Safepoints::new();
        let me = ThreadId::new(1);
        safepoints.register(me);
        assert!(safepoints.stop_world(Some(me), TIMEOUT).is_some());
    }

    #[test]
    fn test_unresponsive_mutator_times_out() {
        let safepoints = Safepoints::new();
        safepoints.register(ThreadId::new(2));
        assert!(safepoints
            .stop_world(None, Duration::from_millis(20))
            .is_none());
        assert!(!safepoints.is_stop_requested());
    }

    #[test]
    fn test_huge_timeout_stops() {
        let safepoints = Safepoints::new();
        let id = ThreadId::new(2);
        safepoints.register(id);
        let _region = safepoints.safe_region(id);
        assert!(safepoints.stop_world(None, Duration::MAX).is_some());
    }

    #[test]
    fn test_safe_region_counts_as_parked() {
        let safepoints = Safepoints::new();
        let id = ThreadId::new(2);
        safepoints.register(id);

        let region = safepoints.safe_region(id);
        let nested = safepoints.safe_region(id);
        drop(nested);
        let stopped = safepoints.stop_world(None, TIMEOUT);
        assert!(stopped.is_some());
        drop(stopped);
        drop(region);
    }

    #[test]
    fn test_mutators_park_at_poll() {
        let safepoints = Arc::new(Safepoints::new());
        let passes = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let workers: Vec<_> = (2..5)
            .map(|raw| {
                let id = ThreadId::new(raw);
                safepoints.register(id);
                let safepoints = safepoints.clone();
                let passes = passes.clone();
                let done = done.clone();
                thread::spawn(move || {
                    while !done.load(Ordering::Acquire) {
                        safepoints.poll(id);
                        passes.fetch_add(1, Ordering::Relaxed);
                    }
                    safepoints.unregister(id);
                })
            })
            .collect();

        {
            let _stopped = safepoints.stop_world(None, TIMEOUT).unwrap();
            let frozen = passes.load(Ordering::Relaxed);
            thread::sleep(Duration::from_millis(20));
            assert_eq!(passes.load(Ordering::Relaxed), frozen);
        }

        done.store(true, Ordering::Release);
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(safepoints.mutator_count(), 0);
    }

    #[test]
    fn test_reinit_after_fork() {
        let safepoints = Safepoints::new();
        safepoints.register(ThreadId::new(1));
        safepoints.register(ThreadId::new(2));
        core::mem::forget(safepoints.state.lock());

        unsafe { safepoints.reinit_after_fork(ThreadId::new(1)) };
        assert_eq!(safepoints.mutator_count(), 1);
    }
}
