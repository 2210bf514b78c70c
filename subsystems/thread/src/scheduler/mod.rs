//! # Scheduler Framework
//!
//! The thread subsystem does not schedule anything itself. Spawning native
//! threads, yielding and priority hints go through a [`NativeScheduler`], so
//! the embedding runtime decides how entities map onto the host.

pub mod native;
pub mod priority;

pub use native::StdScheduler;
pub use priority::Priority;

use crate::{ThreadId, ThreadResult};
use core::fmt;
use std::thread::JoinHandle;

/// Entry function handed to a new native thread
pub type NativeEntry = Box<dyn FnOnce() + Send + 'static>;

/// Parameters for spawning a native thread
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Thread entity being bound
    pub thread: ThreadId,
    /// Native thread name
    pub name: String,
    /// Stack size (`None` for the platform default)
    pub stack_size: Option<usize>,
    /// Initial priority hint
    pub priority: Priority,
}

impl SpawnRequest {
    /// Create a new spawn request
    pub fn new(thread: ThreadId, name: impl Into<String>) -> Self {
        Self {
            thread,
            name: name.into(),
            stack_size: None,
            priority: Priority::DEFAULT,
        }
    }

    /// Set the stack size
    pub fn with_stack_size(mut self, stack_size: Option<usize>) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Set the priority hint
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Handle to a spawned native thread
pub struct NativeHandle {
    join: Option<JoinHandle<()>>,
}

impl NativeHandle {
    /// Wrap a std join handle
    pub fn new(join: JoinHandle<()>) -> Self {
        Self { join: Some(join) }
    }

    /// Handle for a native thread that cannot be joined
    pub fn detached() -> Self {
        Self { join: None }
    }

    /// Check if the native thread has exited
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(JoinHandle::is_finished).unwrap_or(false)
    }

    /// Drop the handle without detaching, for threads that vanished in fork
    pub(crate) fn forget(self) {
        core::mem::forget(self);
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("joinable", &self.join.is_some())
            .finish()
    }
}

/// Host threading collaborator
///
/// `spawn` must run `entry` on a new native thread, never inline: the entry
/// waits on the entity's init lock, which the caller of `spawn` holds.
pub trait NativeScheduler: Send + Sync {
    /// Get the scheduler name
    fn name(&self) -> &'static str;

    /// Spawn a native thread running `entry`
    fn spawn(&self, request: SpawnRequest, entry: NativeEntry) -> ThreadResult<NativeHandle>;

    /// Give up the rest of the calling thread's quantum
    fn yield_now(&self);

    /// Forward a priority hint to the host
    fn apply_priority(&self, thread: ThreadId, priority: Priority) {
        let _ = (thread, priority);
    }
}
