//! # Registry and Scheduler Hooks
//!
//! Current-thread resolution, listing, yield, priority, join and the
//! collector-facing enumeration.

use crate::config::ThreadConfig;
use crate::context::{ExecutionContext, NativeContext};
use crate::lifecycle::ThreadManager;
use crate::safepoint::{Safepoints, WorldStopped};
use crate::scheduler::{NativeScheduler, Priority};
use crate::sync;
use crate::thread::{Thread, ThreadRegistry, ThreadState};
use crate::{ThreadError, ThreadResult};
use core::time::Duration;
use std::sync::Arc;

impl ThreadManager {
    /// Subsystem configuration
    pub fn config(&self) -> &ThreadConfig {
        &self.shared.config
    }

    /// Registry of live threads
    pub fn registry(&self) -> &ThreadRegistry {
        &self.shared.registry
    }

    /// Collector handshake
    pub fn safepoints(&self) -> &Safepoints {
        &self.shared.safepoints
    }

    /// Host scheduler
    pub fn scheduler(&self) -> &Arc<dyn NativeScheduler> {
        &self.shared.scheduler
    }

    /// The main thread
    pub fn main_thread(&self) -> Arc<Thread> {
        self.shared.main.read().clone()
    }

    /// Entity bound to the calling native thread
    pub fn current(&self) -> ThreadResult<Arc<Thread>> {
        self.shared
            .registry
            .by_native(std::thread::current().id())
            .ok_or(ThreadError::UnknownThread)
    }

    /// Execution context of the calling thread
    pub fn context(&self) -> ThreadResult<ExecutionContext> {
        let thread = self.current()?;
        let native = thread.native_context().ok_or(ThreadError::UnknownThread)?;
        Ok(ExecutionContext::new(thread, native, self.clone()))
    }

    /// Yield the rest of the calling thread's quantum
    pub fn pass(&self) {
        self.shared.scheduler.yield_now();
    }

    /// Snapshot of every live thread, main thread included
    pub fn list(&self) -> Vec<Arc<Thread>> {
        self.shared
            .registry
            .snapshot()
            .into_iter()
            .filter(|thread| thread.is_alive())
            .collect()
    }

    /// Get the priority of `thread`
    pub fn get_priority(&self, thread: &Thread) -> Priority {
        thread.priority()
    }

    /// Set the priority of `thread` under the configured policy
    pub fn set_priority(&self, thread: &Thread, value: i32) -> ThreadResult<Priority> {
        if thread.is_stale() {
            return Err(ThreadError::Stale);
        }
        let priority = Priority::with_policy(value, self.shared.config.priority_policy)
            .map_err(|err| {
                log::warn!("Rejected priority for thread {}: {}", thread.id(), err);
                err
            })?;

        thread.set_priority(priority);
        if thread.is_alive() {
            self.shared.scheduler.apply_priority(thread.id(), priority);
        }
        Ok(priority)
    }

    /// Block until `thread` finishes or `timeout` elapses
    ///
    /// Returns `None` on timeout. When the caller is itself a registered
    /// thread it counts as parked for collectors while it waits.
    pub fn join(
        &self,
        thread: &Arc<Thread>,
        timeout: Option<Duration>,
    ) -> ThreadResult<Option<Arc<Thread>>> {
        self.validate_join(thread)?;

        let deadline = timeout.and_then(sync::deadline_after);
        let region = self
            .current()
            .ok()
            .map(|me| self.shared.safepoints.safe_region(me.id()));
        let done = thread.wait_terminated(deadline);
        drop(region);

        Ok(done.then(|| thread.clone()))
    }

    /// Reject joins that can never complete
    pub fn validate_join(&self, thread: &Thread) -> ThreadResult<()> {
        if thread.is_stale() {
            return Err(ThreadError::Stale);
        }
        if !thread.is_initialized() {
            return Err(if thread.state() == ThreadState::Finalized {
                ThreadError::Finalized
            } else {
                ThreadError::NotStarted
            });
        }
        let native = thread.native_context().map(|native| native.native());
        if native == Some(std::thread::current().id()) {
            log::warn!("Thread {} tried to join itself", thread.id());
            return Err(ThreadError::JoinSelf);
        }
        Ok(())
    }

    /// Resolve the debugger attached to `thread`
    pub fn debugger_of(&self, thread: &Thread) -> Option<Arc<Thread>> {
        thread
            .debugger_thread()
            .and_then(|id| self.shared.registry.get(id))
    }

    /// Visit the native context of every live thread
    ///
    /// No registry lock is held while `f` runs.
    pub fn for_each_native_context<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Thread>, &Arc<NativeContext>),
    {
        self.shared.registry.for_each(|thread| {
            if let Some(native) = thread.native_context() {
                f(thread, &native);
            }
        });
    }

    /// Park every other mutator for a collection
    ///
    /// Returns `None` if some thread did not reach a safe point in time.
    pub fn stop_world(&self, timeout: Duration) -> Option<WorldStopped<'_>> {
        let caller = self.current().ok().map(|thread| thread.id());
        self.shared.safepoints.stop_world(caller, timeout)
    }
}
