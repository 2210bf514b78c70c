//! # Thread Structure
//!
//! The Thread Entity: identity, flags, the link to its native thread and the
//! per-thread stores. Other threads only ever act on a thread through the
//! methods here.

use super::local_storage::ThreadLocals;
use super::recursion::RecursionTracker;
use super::{ThreadFlags, ThreadState};
use crate::context::{ContextSnapshot, NativeContext};
use crate::scheduler::{NativeHandle, Priority};
use crate::sync::{self, InitLock, JoinLatch, Parker};
use crate::value::{Block, Exception, ObjectId, Symbol, Termination, Unwind, Value};
use crate::{FiberId, ThreadError, ThreadId, ThreadResult};
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Opaque per-thread random number generator
///
/// Each thread owns its own generator so sequences never interleave.
pub trait Randomizer: Send {
    /// Next random word
    fn next_u64(&mut self) -> u64;

    /// Restart the sequence from `seed`
    fn reseed(&mut self, seed: u64);
}

/// Thread Entity
pub struct Thread {
    /// Unique identifier
    id: ThreadId,
    /// Process the native thread runs in
    pid: AtomicU32,
    /// Current state
    state: AtomicU32,
    /// Flags
    flags: spin::RwLock<ThreadFlags>,
    /// Priority hint
    priority: spin::RwLock<Priority>,
    /// Requested native stack size
    stack_size: Option<usize>,

    /// Arguments passed to the block
    args: spin::RwLock<Vec<Value>>,
    /// Callable run by the native thread
    block: spin::RwLock<Option<Block>>,
    /// Grouping tag
    group: spin::RwLock<Option<Value>>,
    /// Debugger rendezvous handle
    control_channel: spin::RwLock<Option<Value>>,
    /// Attached debugger (non-owning)
    debugger_thread: spin::RwLock<Option<ThreadId>>,

    /// Recorded value or exception
    terminal: spin::RwLock<Option<Termination>>,
    /// Exceptions waiting for the next safe point
    interrupts: spin::Mutex<VecDeque<Exception>>,

    locals: ThreadLocals,
    active_fiber: AtomicU64,
    recursive_objects: RecursionTracker,
    randomizer: spin::Mutex<Option<Box<dyn Randomizer>>>,

    /// Interpreter state, present while the native thread runs
    native_context: spin::RwLock<Option<Arc<NativeContext>>>,
    native_handle: spin::Mutex<Option<NativeHandle>>,

    init_lock: InitLock,
    join_latch: JoinLatch,
    parker: Parker,
}

impl Thread {
    /// Create a new, unstarted thread entity
    pub fn new(id: ThreadId, stack_size: Option<usize>) -> Self {
        Self {
            id,
            pid: AtomicU32::new(0),
            state: AtomicU32::new(ThreadState::Allocated.as_u32()),
            flags: spin::RwLock::new(ThreadFlags::empty()),
            priority: spin::RwLock::new(Priority::DEFAULT),
            stack_size,
            args: spin::RwLock::new(Vec::new()),
            block: spin::RwLock::new(None),
            group: spin::RwLock::new(None),
            control_channel: spin::RwLock::new(None),
            debugger_thread: spin::RwLock::new(None),
            terminal: spin::RwLock::new(None),
            interrupts: spin::Mutex::new(VecDeque::new()),
            locals: ThreadLocals::new(),
            active_fiber: AtomicU64::new(FiberId::ROOT.as_u64()),
            recursive_objects: RecursionTracker::new(),
            randomizer: spin::Mutex::new(None),
            native_context: spin::RwLock::new(None),
            native_handle: spin::Mutex::new(None),
            init_lock: InitLock::new(),
            join_latch: JoinLatch::new(),
            parker: Parker::new(),
        }
    }

    /// Get thread ID
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Process id recorded when the thread was started
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub(crate) fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Release);
    }

    /// Get current state
    pub fn state(&self) -> ThreadState {
        let val = self.state.load(Ordering::SeqCst);
        ThreadState::from_u32(val).unwrap_or(ThreadState::Stale)
    }

    /// Move to `next` if the state machine allows it
    pub(crate) fn transition(&self, next: ThreadState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let allowed = ThreadState::from_u32(current)
                .map(|state| state.can_transition_to(next))
                .unwrap_or(false);
            if !allowed {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next.as_u32(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Get flags
    pub fn flags(&self) -> ThreadFlags {
        *self.flags.read()
    }

    pub(crate) fn set_flag(&self, flag: ThreadFlags) {
        self.flags.write().insert(flag);
    }

    pub(crate) fn clear_flag(&self, flag: ThreadFlags) {
        self.flags.write().remove(flag);
    }

    /// True from a successful start until the native thread stops
    pub fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    /// Check if the entity was ever bound to a native thread
    pub fn is_initialized(&self) -> bool {
        self.flags().contains(ThreadFlags::INITIALIZED)
    }

    /// Check if the thread is parked in `sleep`
    pub fn is_sleeping(&self) -> bool {
        self.flags().contains(ThreadFlags::SLEEPING)
    }

    /// Check if collector handshakes are deferred
    pub fn is_critical(&self) -> bool {
        self.flags().contains(ThreadFlags::CRITICAL)
    }

    /// Check if this is the adopted main thread
    pub fn is_main(&self) -> bool {
        self.flags().contains(ThreadFlags::MAIN)
    }

    /// Check if fork recovery discarded this entity
    pub fn is_stale(&self) -> bool {
        self.state() == ThreadState::Stale
    }

    /// Get priority
    pub fn priority(&self) -> Priority {
        *self.priority.read()
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        *self.priority.write() = priority;
    }

    /// Requested stack size (`None` for the configured default)
    pub fn stack_size(&self) -> Option<usize> {
        self.stack_size
    }

    /// Arguments the thread was started with
    pub fn args(&self) -> Vec<Value> {
        self.args.read().clone()
    }

    /// Callable the thread was started with
    pub fn block(&self) -> Option<Block> {
        self.block.read().clone()
    }

    pub(crate) fn set_call(&self, args: Vec<Value>, block: Option<Block>) {
        *self.args.write() = args;
        *self.block.write() = block;
    }

    /// Grouping tag
    pub fn group(&self) -> Option<Value> {
        self.group.read().clone()
    }

    /// Set the grouping tag
    pub fn set_group(&self, group: Option<Value>) {
        *self.group.write() = group;
    }

    /// Debugger rendezvous handle
    pub fn control_channel(&self) -> Option<Value> {
        self.control_channel.read().clone()
    }

    /// Attach or detach a debugger rendezvous handle
    pub fn set_control_channel(&self, channel: Option<Value>) {
        *self.control_channel.write() = channel;
    }

    /// Identifier of the attached debugger thread
    pub fn debugger_thread(&self) -> Option<ThreadId> {
        *self.debugger_thread.read()
    }

    /// Record the attached debugger thread
    pub fn set_debugger_thread(&self, debugger: Option<ThreadId>) {
        *self.debugger_thread.write() = debugger;
    }

    // =========================================================================
    // Outcome
    // =========================================================================

    /// How the thread ended, once it has
    pub fn termination(&self) -> Option<Termination> {
        self.terminal.read().clone()
    }

    /// Value returned by the block
    pub fn value(&self) -> Option<Value> {
        self.terminal.read().as_ref().and_then(|t| t.value().cloned())
    }

    /// Exception that terminated the block
    pub fn exception(&self) -> Option<Exception> {
        self.terminal.read().as_ref().and_then(|t| t.exception().cloned())
    }

    /// Record termination and leave the alive window
    ///
    /// Returns `false` if a termination was already recorded.
    pub(crate) fn stopped(&self, termination: Termination) -> bool {
        if self.is_stale() {
            return false;
        }
        {
            let mut terminal = self.terminal.write();
            if terminal.is_some() {
                return false;
            }
            *terminal = Some(termination);
        }
        self.clear_flag(ThreadFlags::SLEEPING);
        self.transition(ThreadState::Terminated)
    }

    /// Release native resources and release joiners
    ///
    /// Returns `false` if the entity was already finalized, is still alive,
    /// or was discarded by fork recovery.
    pub(crate) fn finalize_instance(&self) -> bool {
        if !self.transition(ThreadState::Finalized) {
            return false;
        }

        *self.native_context.write() = None;
        drop(self.native_handle.lock().take());
        self.randomizer.lock().take();
        self.recursive_objects.clear();
        self.interrupts.lock().clear();

        self.join_latch.complete();
        true
    }

    /// Wait until the thread is finalized (`None` waits forever)
    pub fn wait_terminated(&self, deadline: Option<Instant>) -> bool {
        self.join_latch.wait_until(deadline)
    }

    /// Check if joiners have been released
    pub fn is_finalized(&self) -> bool {
        self.join_latch.is_complete()
    }

    // =========================================================================
    // Interrupts
    // =========================================================================

    /// Deliver an exception to be raised at the thread's next safe point
    pub fn raise(&self, exception: Exception) -> ThreadResult<&Self> {
        match self.state() {
            ThreadState::Stale => return Err(ThreadError::Stale),
            state if state.is_terminated() => return Ok(self),
            _ => {}
        }
        log::debug!("Raising {} in thread {}", exception, self.id);
        self.interrupts.lock().push_back(exception);
        self.parker.notify();
        Ok(self)
    }

    /// Request termination at the thread's next safe point
    pub fn kill(&self) -> ThreadResult<&Self> {
        match self.state() {
            ThreadState::Stale => return Err(ThreadError::Stale),
            state if state.is_terminated() => return Ok(self),
            _ => {}
        }
        log::debug!("Kill requested for thread {}", self.id);
        self.set_flag(ThreadFlags::KILL_PENDING);
        self.parker.notify();
        Ok(self)
    }

    /// Wake the thread if it is sleeping
    pub fn wakeup(&self) -> ThreadResult<&Self> {
        match self.state() {
            ThreadState::Stale => return Err(ThreadError::Stale),
            state if !state.is_alive() => return Err(ThreadError::NotAlive),
            _ => {}
        }

        let mut token = self.parker.lock();
        if self.is_sleeping() {
            log::trace!("Waking thread {}", self.id);
            *token = true;
            self.clear_flag(ThreadFlags::SLEEPING);
            self.parker.notify_locked();
        }
        Ok(self)
    }

    /// Check if a kill or raise is waiting
    pub fn has_pending_interrupt(&self) -> bool {
        self.flags().contains(ThreadFlags::KILL_PENDING) || !self.interrupts.lock().is_empty()
    }

    /// Take the next interrupt to honor: kill first, then queued raises
    ///
    /// A kill stays pending so every later safe point unwinds again.
    pub(crate) fn take_interrupt(&self) -> Option<Unwind> {
        if self.flags().contains(ThreadFlags::KILL_PENDING) {
            return Some(Unwind::Kill);
        }
        self.interrupts.lock().pop_front().map(Unwind::Raise)
    }

    /// Park until woken, interrupted or `deadline`; returns `true` if woken
    pub(crate) fn sleep_until(&self, deadline: Option<Instant>) -> bool {
        let mut token = self.parker.lock();
        *token = false;
        self.set_flag(ThreadFlags::SLEEPING);

        let woken = loop {
            if *token {
                break true;
            }
            if self.has_pending_interrupt() {
                break false;
            }
            if self.parker.wait(&mut token, deadline) {
                break *token;
            }
        };

        *token = false;
        self.clear_flag(ThreadFlags::SLEEPING);
        woken
    }

    // =========================================================================
    // Locals
    // =========================================================================

    /// Fiber the thread is currently running
    pub fn active_fiber(&self) -> FiberId {
        FiberId::new(self.active_fiber.load(Ordering::Acquire))
    }

    pub(crate) fn set_active_fiber(&self, fiber: FiberId) -> FiberId {
        FiberId::new(self.active_fiber.swap(fiber.as_u64(), Ordering::AcqRel))
    }

    /// Look up a local of the active fiber
    pub fn locals_aref(&self, key: &Symbol) -> Option<Value> {
        self.locals.get(self.active_fiber(), key)
    }

    /// Set a local of the active fiber
    pub fn locals_store(&self, key: Symbol, value: Value) -> Value {
        self.locals.set(self.active_fiber(), key, value.clone());
        value
    }

    /// Remove a local of the active fiber
    pub fn locals_remove(&self, key: &Symbol) -> Option<Value> {
        self.locals.remove(self.active_fiber(), key)
    }

    /// Keys of the active fiber's locals
    pub fn locals_keys(&self) -> Vec<Symbol> {
        self.locals.keys(self.active_fiber())
    }

    /// Check for a local of the active fiber
    pub fn locals_has_key(&self, key: &Symbol) -> bool {
        self.locals.contains(self.active_fiber(), key)
    }

    /// Direct access to every fiber's locals
    pub fn locals(&self) -> &ThreadLocals {
        &self.locals
    }

    // =========================================================================
    // Per-thread resources
    // =========================================================================

    /// Run `f` unless `object` is already being traversed on this thread
    pub fn detect_recursion<R>(&self, object: ObjectId, f: impl FnOnce() -> R) -> Option<R> {
        struct Exit<'a> {
            tracker: &'a RecursionTracker,
            object: ObjectId,
        }

        impl Drop for Exit<'_> {
            fn drop(&mut self) {
                self.tracker.exit(self.object);
            }
        }

        if !self.recursive_objects.enter(object) {
            return None;
        }
        let _exit = Exit {
            tracker: &self.recursive_objects,
            object,
        };
        Some(f())
    }

    /// Objects currently being traversed
    pub fn recursive_objects(&self) -> &RecursionTracker {
        &self.recursive_objects
    }

    /// Install the thread's random number generator
    pub fn install_randomizer(&self, randomizer: Box<dyn Randomizer>) {
        *self.randomizer.lock() = Some(randomizer);
    }

    /// Use the thread's random number generator, if installed
    pub fn with_randomizer<R>(&self, f: impl FnOnce(&mut dyn Randomizer) -> R) -> Option<R> {
        self.randomizer.lock().as_mut().map(|rng| f(rng.as_mut()))
    }

    // =========================================================================
    // Native link
    // =========================================================================

    /// Interpreter state, while the native thread runs
    pub fn native_context(&self) -> Option<Arc<NativeContext>> {
        self.native_context.read().clone()
    }

    pub(crate) fn set_native_context(&self, context: Option<Arc<NativeContext>>) {
        *self.native_context.write() = context;
    }

    pub(crate) fn set_native_handle(&self, handle: NativeHandle) {
        *self.native_handle.lock() = Some(handle);
    }

    pub(crate) fn init_lock(&self) -> &InitLock {
        &self.init_lock
    }

    /// Snapshot of the thread's execution context
    pub fn context(&self) -> Option<ContextSnapshot> {
        self.native_context()
            .map(|native| native.snapshot(self.active_fiber(), self.is_sleeping()))
    }

    /// Backtrace lines, innermost frame first
    pub fn mri_backtrace(&self) -> Vec<String> {
        self.context()
            .map(|snapshot| snapshot.backtrace())
            .unwrap_or_default()
    }

    // =========================================================================
    // Fork recovery
    // =========================================================================

    /// Release every lock of an entity untouched by the fork
    ///
    /// # Safety
    /// No live thread may hold any of the entity's locks.
    pub(crate) unsafe fn reset_locks(&self) {
        // SAFETY: the caller guarantees no live thread holds any of them.
        unsafe {
            self.init_lock.reinit_after_fork();
            self.join_latch.reinit_after_fork();
            self.parker.reinit_after_fork();
            sync::reset_spin_rwlock(&self.flags);
            sync::reset_spin_rwlock(&self.priority);
            sync::reset_spin_rwlock(&self.args);
            sync::reset_spin_rwlock(&self.block);
            sync::reset_spin_rwlock(&self.group);
            sync::reset_spin_rwlock(&self.control_channel);
            sync::reset_spin_rwlock(&self.debugger_thread);
            sync::reset_spin_rwlock(&self.terminal);
            sync::reset_spin_mutex(&self.interrupts);
            sync::reset_spin_mutex(&self.randomizer);
            sync::reset_spin_rwlock(&self.native_context);
            sync::reset_spin_mutex(&self.native_handle);
            self.locals.reinit_after_fork();
            self.recursive_objects.reinit_after_fork();
        }
    }

    /// Mark an entity whose native thread did not survive fork
    ///
    /// # Safety
    /// Must run in a forked child before any other thread operation.
    pub(crate) unsafe fn discard_after_fork(&self) {
        // SAFETY: forwarded from the caller.
        unsafe { self.reset_locks() };

        self.state.store(ThreadState::Stale.as_u32(), Ordering::SeqCst);
        self.clear_flag(ThreadFlags::SLEEPING);
        self.native_context.write().take();
        if let Some(handle) = self.native_handle.lock().take() {
            handle.forget();
        }
        self.interrupts.lock().clear();
        self.join_latch.complete();
    }

    /// Reset the surviving entity in a forked child
    ///
    /// # Safety
    /// Must run in a forked child before any other thread operation.
    pub(crate) unsafe fn reinit_after_fork(&self, pid: u32) {
        // SAFETY: forwarded from the caller.
        unsafe { self.reset_locks() };

        self.set_pid(pid);
        self.clear_flag(ThreadFlags::SLEEPING);
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("flags", &self.flags())
            .field("priority", &self.priority())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn thread() -> Thread {
        Thread::new(ThreadId::new(2), None)
    }

    #[test]
    fn test_new_thread_defaults() {
        let t = thread();
        assert_eq!(t.state(), ThreadState::Allocated);
        assert!(!t.is_alive());
        assert!(!t.is_initialized());
        assert_eq!(t.priority(), Priority::DEFAULT);
        assert!(t.value().is_none());
        assert!(t.exception().is_none());
        assert!(t.native_context().is_none());
        assert_eq!(t.active_fiber(), FiberId::ROOT);
    }

    #[test]
    fn test_transition_rules() {
        let t = thread();
        assert!(!t.transition(ThreadState::Running));
        assert!(t.transition(ThreadState::Started));
        assert!(t.transition(ThreadState::Running));
        assert!(t.is_alive());
        assert!(!t.transition(ThreadState::Started));
    }

    #[test]
    fn test_stopped_records_once() {
        let t = thread();
        t.transition(ThreadState::Started);
        t.transition(ThreadState::Running);

        let exc = Exception::new("E", "first");
        assert!(t.stopped(Termination::Raised(exc.clone())));
        assert!(!t.stopped(Termination::Returned(Value::new(1i64))));
        assert_eq!(t.exception(), Some(exc));
        assert!(t.value().is_none());
        assert!(!t.is_alive());
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let t = thread();
        assert!(t.finalize_instance());
        assert!(!t.finalize_instance());
        assert!(t.is_finalized());
        assert!(t.wait_terminated(None));
    }

    #[test]
    fn test_running_thread_is_not_finalized() {
        let t = thread();
        t.transition(ThreadState::Started);
        assert!(!t.finalize_instance());
        assert!(!t.is_finalized());
    }

    #[test]
    fn test_interrupt_order() {
        let t = thread();
        let exc = Exception::new("E", "queued");
        t.raise(exc.clone()).unwrap();
        assert!(t.has_pending_interrupt());
        assert_eq!(t.take_interrupt(), Some(Unwind::Raise(exc)));
        assert_eq!(t.take_interrupt(), None);

        t.raise(Exception::new("E", "later")).unwrap();
        t.kill().unwrap();
        assert_eq!(t.take_interrupt(), Some(Unwind::Kill));
        assert_eq!(t.take_interrupt(), Some(Unwind::Kill));
    }

    #[test]
    fn test_interrupts_on_dead_thread() {
        let t = thread();
        t.finalize_instance();
        t.kill().unwrap();
        t.raise(Exception::new("E", "late")).unwrap();
        assert!(!t.has_pending_interrupt());
        assert_eq!(t.wakeup().err(), Some(ThreadError::NotAlive));
    }

    #[test]
    fn test_sleep_times_out() {
        let t = thread();
        let woken = t.sleep_until(Some(Instant::now() + Duration::from_millis(10)));
        assert!(!woken);
        assert!(!t.is_sleeping());
    }

    #[test]
    fn test_wakeup_releases_sleeper() {
        let t = Arc::new(thread());
        t.transition(ThreadState::Started);

        let sleeper = {
            let t = t.clone();
            std::thread::spawn(move || t.sleep_until(None))
        };
        while !t.is_sleeping() {
            std::thread::yield_now();
        }
        t.wakeup().unwrap();
        assert!(sleeper.join().unwrap());
    }

    #[test]
    fn test_locals_follow_active_fiber() {
        let t = thread();
        let key = Symbol::new("k");
        t.locals_store(key.clone(), Value::new(1i64));

        let previous = t.set_active_fiber(FiberId::new(3));
        assert_eq!(previous, FiberId::ROOT);
        assert!(!t.locals_has_key(&key));
        assert!(t.locals_keys().is_empty());

        t.set_active_fiber(FiberId::ROOT);
        assert!(t.locals_has_key(&key));
        assert!(t.locals_remove(&key).is_some());
        assert!(t.locals_aref(&key).is_none());
    }

    #[test]
    fn test_detect_recursion() {
        let t = thread();
        let obj = ObjectId::of(&t);

        let nested = t.detect_recursion(obj, || t.detect_recursion(obj, || 1));
        assert_eq!(nested, Some(None));
        assert_eq!(t.detect_recursion(obj, || 2), Some(2));
    }

    struct Counter(u64);

    impl Randomizer for Counter {
        fn next_u64(&mut self) -> u64 {
            self.0 += 1;
            self.0
        }

        fn reseed(&mut self, seed: u64) {
            self.0 = seed;
        }
    }

    #[test]
    fn test_randomizer_slot() {
        let t = thread();
        assert_eq!(t.with_randomizer(|rng| rng.next_u64()), None);

        t.install_randomizer(Box::new(Counter(0)));
        assert_eq!(t.with_randomizer(|rng| rng.next_u64()), Some(1));
        t.with_randomizer(|rng| rng.reseed(10));
        assert_eq!(t.with_randomizer(|rng| rng.next_u64()), Some(11));
    }

    #[test]
    fn test_discard_after_fork() {
        let t = thread();
        t.transition(ThreadState::Started);
        core::mem::forget(t.flags.write());

        unsafe { t.discard_after_fork() };
        assert!(t.is_stale());
        assert!(t.is_finalized());
        assert_eq!(t.kill().err(), Some(ThreadError::Stale));
    }
}
