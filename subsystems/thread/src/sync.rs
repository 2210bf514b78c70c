//! # Synchronization Primitives
//!
//! Lock types owned by a Thread Entity:
//! - [`InitLock`]: spin lock guarding the bind-to-native-thread transition
//! - [`JoinLatch`]: mutex + condition, broadcast once when the thread finishes
//! - [`Parker`]: mutex + condition used by `sleep` and `wakeup`
//!
//! A forked child only keeps the forking thread. Any of these locks may still
//! be marked as held by a sibling that no longer exists, so each one can be
//! reset in place after fork.

use core::time::Duration;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

/// Deadline `timeout` from now
///
/// `None` when the deadline is past what `Instant` can represent; callers
/// treat that as waiting forever.
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Spin lock guarding the transition from allocated to bound
#[derive(Debug, Default)]
pub struct InitLock {
    lock: spin::Mutex<()>,
}

impl InitLock {
    /// Create an unlocked init lock
    pub const fn new() -> Self {
        Self {
            lock: spin::Mutex::new(()),
        }
    }

    /// Acquire the lock, spinning until it is free
    pub fn lock(&self) -> spin::MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Check if the lock is held
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Reset the lock after fork
    ///
    /// # Safety
    /// No live thread may hold the lock.
    pub unsafe fn reinit_after_fork(&self) {
        if self.lock.is_locked() {
            // SAFETY: the holder no longer exists in this process.
            unsafe { self.lock.force_unlock() };
        }
    }
}

/// Durable completion signal
///
/// Completion is broadcast once. Waiters that arrive after completion return
/// immediately.
#[derive(Debug, Default)]
pub struct JoinLatch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl JoinLatch {
    /// Create an incomplete latch
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Mark complete and wake every waiter
    ///
    /// Returns `false` if the latch was already complete.
    pub fn complete(&self) -> bool {
        let mut done = self.done.lock();
        if *done {
            return false;
        }
        *done = true;
        self.cond.notify_all();
        true
    }

    /// Check completion without blocking
    pub fn is_complete(&self) -> bool {
        *self.done.lock()
    }

    /// Wait for completion, at most `timeout` (`None` waits forever)
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.wait_until(timeout.and_then(deadline_after))
    }

    /// Wait for completion until `deadline` (`None` waits forever)
    pub fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut done = self.done.lock();
        match deadline {
            None => {
                while !*done {
                    self.cond.wait(&mut done);
                }
            }
            Some(deadline) => {
                while !*done {
                    if self.cond.wait_until(&mut done, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        *done
    }

    /// Reset the lock after fork, keeping the completion state
    ///
    /// # Safety
    /// No live thread may hold the lock.
    pub unsafe fn reinit_after_fork(&self) {
        if self.done.is_locked() {
            // SAFETY: the holder no longer exists in this process.
            unsafe { self.done.force_unlock() };
        }
    }
}

/// Sleep/wakeup rendezvous for one thread
#[derive(Debug, Default)]
pub struct Parker {
    token: Mutex<bool>,
    cond: Condvar,
}

impl Parker {
    /// Create a parker with no pending wakeup
    pub fn new() -> Self {
        Self {
            token: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, bool> {
        self.token.lock()
    }

    /// Block on the parker; returns `true` if the deadline passed
    pub(crate) fn wait(&self, token: &mut MutexGuard<'_, bool>, deadline: Option<Instant>) -> bool {
        match deadline {
            None => {
                self.cond.wait(token);
                false
            }
            Some(deadline) => self.cond.wait_until(token, deadline).timed_out(),
        }
    }

    /// Wake the parked thread so it re-checks its interrupts
    pub fn notify(&self) {
        let _token = self.token.lock();
        self.cond.notify_all();
    }

    pub(crate) fn notify_locked(&self) {
        self.cond.notify_all();
    }

    /// Reset the lock after fork, dropping any pending wakeup
    ///
    /// # Safety
    /// No live thread may hold the lock.
    pub unsafe fn reinit_after_fork(&self) {
        if self.token.is_locked() {
            // SAFETY: the holder no longer exists in this process.
            unsafe { self.token.force_unlock() };
        }
        *self.token.lock() = false;
    }
}

/// Release a spin mutex held by a thread that vanished in fork
///
/// # Safety
/// No live thread may hold the lock.
pub(crate) unsafe fn reset_spin_mutex<T>(lock: &spin::Mutex<T>) {
    if lock.is_locked() {
        // SAFETY: guaranteed by the caller.
        unsafe { lock.force_unlock() };
    }
}

/// Release a spin rwlock held by threads that vanished in fork
///
/// # Safety
/// No live thread may hold the lock.
pub(crate) unsafe fn reset_spin_rwlock<T>(lock: &spin::RwLock<T>) {
    if lock.writer_count() > 0 {
        // SAFETY: guaranteed by the caller.
        unsafe { lock.force_write_unlock() };
    }
    while lock.reader_count() > 0 {
        // SAFETY: guaranteed by the caller.
        unsafe { lock.force_read_decrement() };
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_latch_is_durable() {
        let latch = JoinLatch::new();
        assert!(!latch.is_complete());
        assert!(latch.complete());
        assert!(!latch.complete());
        assert!(latch.wait(None));
        assert!(latch.wait(Some(Duration::ZERO)));
    }

    #[test]
    fn test_deadline_after_saturates() {
        assert!(deadline_after(Duration::from_millis(10)).is_some());
        assert!(deadline_after(Duration::MAX).is_none());
    }

    #[test]
    fn test_latch_huge_timeout_waits() {
        let latch = Arc::new(JoinLatch::new());
        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.wait(Some(Duration::MAX)))
        };
        latch.complete();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_latch_timeout() {
        let latch = JoinLatch::new();
        assert!(!latch.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_latch_wakes_all_waiters() {
        let latch = Arc::new(JoinLatch::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let latch = latch.clone();
                thread::spawn(move || latch.wait(None))
            })
            .collect();

        latch.complete();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }

    #[test]
    fn test_init_lock_reinit() {
        let lock = InitLock::new();
        let guard = lock.lock();
        assert!(lock.is_locked());
        core::mem::forget(guard);

        unsafe { lock.reinit_after_fork() };
        assert!(!lock.is_locked());
        drop(lock.lock());
    }

    #[test]
    fn test_latch_reinit_keeps_state() {
        let latch = JoinLatch::new();
        latch.complete();
        core::mem::forget(latch.done.lock());

        unsafe { latch.reinit_after_fork() };
        assert!(latch.is_complete());
    }

    #[test]
    fn test_parker_reinit_clears_token() {
        let parker = Parker::new();
        *parker.lock() = true;
        core::mem::forget(parker.lock());

        unsafe { parker.reinit_after_fork() };
        assert!(!*parker.lock());
    }

    #[test]
    fn test_reset_spin_rwlock() {
        let lock = spin::RwLock::new(5);
        core::mem::forget(lock.read());
        core::mem::forget(lock.read());
        unsafe { reset_spin_rwlock(&lock) };
        assert_eq!(*lock.write(), 5);

        core::mem::forget(lock.write());
        unsafe { reset_spin_rwlock(&lock) };
        assert_eq!(*lock.read(), 5);
    }
}
