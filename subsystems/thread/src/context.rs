//! # Execution Context
//!
//! [`NativeContext`] is the per-thread interpreter state a collector has to
//! find for every live thread. [`ExecutionContext`] is the handle a thread
//! body runs with; its `checkpoint` is the safe point where kills, raises and
//! collector stops are honored.

use crate::lifecycle::ThreadManager;
use crate::sync;
use crate::thread::{Thread, ThreadFlags};
use crate::value::Unwind;
use crate::{FiberId, NativeThreadId, ThreadId};
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::sync::Arc;
use std::time::Instant;

/// One activation record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Method or block name
    pub label: String,
    /// Source file
    pub file: String,
    /// Current line
    pub line: u32,
}

impl Frame {
    /// Create a frame
    pub fn new(label: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            label: label.into(),
            file: file.into(),
            line,
        }
    }
}

/// Interpreter state owned by one running native thread
#[derive(Debug)]
pub struct NativeContext {
    thread: ThreadId,
    native: NativeThreadId,
    frames: spin::Mutex<Vec<Frame>>,
    checkpoints: AtomicU64,
}

impl NativeContext {
    /// Create the context for `thread` running on `native`
    pub fn new(thread: ThreadId, native: NativeThreadId) -> Self {
        Self {
            thread,
            native,
            frames: spin::Mutex::new(Vec::new()),
            checkpoints: AtomicU64::new(0),
        }
    }

    /// Owning thread entity
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Native thread the context runs on
    pub fn native(&self) -> NativeThreadId {
        self.native
    }

    /// Copy of the frame stack, outermost first
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    /// Current stack depth
    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    /// Safe points passed so far
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    fn push_frame(&self, frame: Frame) {
        self.frames.lock().push(frame);
    }

    fn pop_frame(&self) {
        self.frames.lock().pop();
    }

    fn set_line(&self, line: u32) {
        if let Some(frame) = self.frames.lock().last_mut() {
            frame.line = line;
        }
    }

    /// Point-in-time view of the context
    pub fn snapshot(&self, fiber: FiberId, sleeping: bool) -> ContextSnapshot {
        ContextSnapshot {
            thread: self.thread,
            frames: self.frames(),
            fiber,
            sleeping,
        }
    }
}

/// Copy of a thread's execution context
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    /// Thread the snapshot was taken from
    pub thread: ThreadId,
    /// Frames, outermost first
    pub frames: Vec<Frame>,
    /// Fiber active at the time
    pub fiber: FiberId,
    /// Whether the thread was sleeping
    pub sleeping: bool,
}

impl ContextSnapshot {
    /// Backtrace lines, innermost first
    pub fn backtrace(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|frame| format!("{}:{}:in `{}'", frame.file, frame.line, frame.label))
            .collect()
    }
}

/// Pops its frame when dropped
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct FrameGuard<'a> {
    native: &'a NativeContext,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.native.pop_frame();
    }
}

/// Handle passed to a running thread body
pub struct ExecutionContext {
    thread: Arc<Thread>,
    native: Arc<NativeContext>,
    manager: ThreadManager,
}

impl ExecutionContext {
    pub(crate) fn new(thread: Arc<Thread>, native: Arc<NativeContext>, manager: ThreadManager) -> Self {
        Self {
            thread,
            native,
            manager,
        }
    }

    /// Entity of the running thread
    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    /// Get thread ID
    pub fn id(&self) -> ThreadId {
        self.thread.id()
    }

    /// Manager the thread belongs to
    pub fn manager(&self) -> &ThreadManager {
        &self.manager
    }

    /// Interpreter state of the running thread
    pub fn native(&self) -> &Arc<NativeContext> {
        &self.native
    }

    /// Safe point
    ///
    /// Parks while a collector has stopped the world (unless critical), then
    /// unwinds for a pending kill or raise.
    pub fn checkpoint(&self) -> Result<(), Unwind> {
        self.native.checkpoints.fetch_add(1, Ordering::Relaxed);
        if !self.thread.is_critical() {
            self.manager.safepoints().poll(self.thread.id());
        }
        match self.thread.take_interrupt() {
            Some(unwind) => {
                log::debug!("Thread {} unwinding at safe point: {:?}", self.id(), unwind);
                Err(unwind)
            }
            None => Ok(()),
        }
    }

    /// Sleep until woken, interrupted or `timeout`; returns `true` if woken
    pub fn sleep(&self, timeout: Option<Duration>) -> Result<bool, Unwind> {
        let deadline = timeout.and_then(sync::deadline_after);
        let woken = {
            let _region = self.manager.safepoints().safe_region(self.thread.id());
            self.thread.sleep_until(deadline)
        };
        self.checkpoint()?;
        Ok(woken)
    }

    /// Join `target` while staying interruptible
    ///
    /// Returns `None` if `timeout` elapsed first.
    pub fn join(
        &self,
        target: &Arc<Thread>,
        timeout: Option<Duration>,
    ) -> Result<Option<Arc<Thread>>, Unwind> {
        self.manager.validate_join(target)?;

        let deadline = timeout.and_then(sync::deadline_after);
        let slice = self.manager.config().join_poll_interval;
        loop {
            let done = {
                let _region = self.manager.safepoints().safe_region(self.thread.id());
                let until = match (deadline, sync::deadline_after(slice)) {
                    (Some(deadline), Some(next)) => Some(deadline.min(next)),
                    (deadline, next) => deadline.or(next),
                };
                target.wait_terminated(until)
            };
            if done {
                return Ok(Some(target.clone()));
            }

            self.checkpoint()?;
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return Ok(None);
            }
        }
    }

    /// Push a frame for the duration of the guard
    pub fn enter_frame(&self, label: &str, file: &str, line: u32) -> FrameGuard<'_> {
        self.native.push_frame(Frame::new(label, file, line));
        FrameGuard {
            native: &self.native,
        }
    }

    /// Update the line of the innermost frame
    pub fn set_line(&self, line: u32) {
        self.native.set_line(line);
    }

    /// Defer collector handshakes while `critical` is set
    pub fn set_critical(&self, critical: bool) {
        if critical {
            self.thread.set_flag(ThreadFlags::CRITICAL);
        } else {
            self.thread.clear_flag(ThreadFlags::CRITICAL);
        }
    }

    /// Make `fiber` the active fiber, returning the previous one
    pub fn switch_fiber(&self, fiber: FiberId) -> FiberId {
        self.thread.set_active_fiber(fiber)
    }

    /// Yield, then pass a safe point
    pub fn pass(&self) -> Result<(), Unwind> {
        self.manager.pass();
        self.checkpoint()
    }
}

// =============================================================================
// TESTS
// =============================================================================
