//! # Lifecycle Controller
//!
//! Creation, native thread spawn, the run trampoline, stop/finalize and fork
//! recovery. Registry queries and the rest of the primitive surface live in
//! [`crate::hooks`].
//!
//! ## Lifecycle
//!
//! ```text
//! create ──► Allocated ──start──► Started ──run──► Running ──stopped──► Terminated
//!                │                                                         │
//!                └──────────────── finalize ──► Finalized ◄── finalize ────┘
//! ```

use crate::config::ThreadConfig;
use crate::context::{ExecutionContext, NativeContext};
use crate::safepoint::Safepoints;
use crate::scheduler::{NativeScheduler, Priority, SpawnRequest, StdScheduler};
use crate::sync;
use crate::thread::{Thread, ThreadFlags, ThreadRegistry, ThreadState};
use crate::value::{Block, Exception, Termination, Unwind, Value};
use crate::{ThreadError, ThreadId, ThreadResult};
use core::sync::atomic::{AtomicU64, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Per-thread creation options
#[derive(Debug, Clone, Default)]
pub struct ThreadOptions {
    /// Stack size overriding the configured default
    pub stack_size: Option<usize>,
    /// Initial priority
    pub priority: Priority,
    /// Grouping tag
    pub group: Option<Value>,
}

impl ThreadOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stack size
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Set the initial priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the grouping tag
    pub fn with_group(mut self, group: Value) -> Self {
        self.group = Some(group);
        self
    }
}

pub(crate) struct Shared {
    pub(crate) config: ThreadConfig,
    pub(crate) scheduler: Arc<dyn NativeScheduler>,
    pub(crate) registry: ThreadRegistry,
    pub(crate) safepoints: Safepoints,
    next_id: AtomicU64,
    pub(crate) main: spin::RwLock<Arc<Thread>>,
    /// Every entity created here, registered or not
    created: spin::Mutex<Vec<Weak<Thread>>>,
}

/// Handle to one thread subsystem instance
///
/// Cheap to clone; every clone refers to the same registry.
#[derive(Clone)]
pub struct ThreadManager {
    pub(crate) shared: Arc<Shared>,
}

impl ThreadManager {
    /// Create a manager backed by `std::thread`
    ///
    /// The calling native thread is adopted as the main thread.
    pub fn new(config: ThreadConfig) -> Self {
        Self::with_scheduler(config, Arc::new(StdScheduler))
    }

    /// Create a manager with a custom scheduler
    pub fn with_scheduler(config: ThreadConfig, scheduler: Arc<dyn NativeScheduler>) -> Self {
        let main = Arc::new(Thread::new(ThreadId::main(), config.stack_size));
        main.set_flag(ThreadFlags::INITIALIZED | ThreadFlags::MAIN);
        main.set_pid(std::process::id());
        main.transition(ThreadState::Started);
        main.transition(ThreadState::Running);

        let native = std::thread::current().id();
        main.set_native_context(Some(Arc::new(NativeContext::new(main.id(), native))));

        let registry = ThreadRegistry::new();
        let safepoints = Safepoints::new();
        // Fresh registry: neither call can fail
        let _ = registry.register(main.clone());
        let _ = registry.bind_native(main.id(), native);
        safepoints.register(main.id());

        log::info!(
            "Thread manager created: scheduler={}, main thread {}",
            scheduler.name(),
            main.id()
        );

        Self {
            shared: Arc::new(Shared {
                config,
                scheduler,
                registry,
                safepoints,
                next_id: AtomicU64::new(ThreadId::main().as_u64() + 1),
                main: spin::RwLock::new(main),
                created: spin::Mutex::new(Vec::new()),
            }),
        }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Allocate a thread entity without starting it
    pub fn create(&self, args: Vec<Value>, block: Option<Block>) -> Arc<Thread> {
        self.create_with(args, block, ThreadOptions::default())
    }

    /// Allocate a thread entity with explicit options
    pub fn create_with(
        &self,
        args: Vec<Value>,
        block: Option<Block>,
        options: ThreadOptions,
    ) -> Arc<Thread> {
        let id = ThreadId::new(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let thread = Thread::new(id, options.stack_size);
        thread.set_call(args, block);
        thread.set_priority(options.priority);
        thread.set_group(options.group);

        let thread = Arc::new(thread);
        let mut created = self.shared.created.lock();
        created.retain(|weak| weak.strong_count() > 0);
        created.push(Arc::downgrade(&thread));
        drop(created);

        log::debug!("Created thread {}", id);
        thread
    }

    /// Create and start a thread in one step
    pub fn spawn(&self, args: Vec<Value>, block: Block) -> ThreadResult<Arc<Thread>> {
        let thread = self.create(args, Some(block));
        self.start(&thread, None, None)?;
        Ok(thread)
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Bind `thread` to a new native thread and run its block
    ///
    /// `args` and `block` replace the ones given at creation when present.
    /// On spawn failure the entity stays unstarted and may be started again.
    pub fn start(
        &self,
        thread: &Arc<Thread>,
        args: Option<Vec<Value>>,
        block: Option<Block>,
    ) -> ThreadResult<()> {
        let _init = thread.init_lock().lock();

        match thread.state() {
            ThreadState::Allocated => {}
            ThreadState::Stale => return Err(ThreadError::Stale),
            ThreadState::Finalized if !thread.is_initialized() => {
                return Err(ThreadError::Finalized)
            }
            _ => {
                log::warn!("Thread {} started twice", thread.id());
                return Err(ThreadError::AlreadyStarted);
            }
        }

        let args = args.unwrap_or_else(|| thread.args());
        let block = block.or_else(|| thread.block());
        if block.is_none() {
            return Err(ThreadError::MissingBlock);
        }
        thread.set_call(args, block);

        self.shared.registry.register(thread.clone())?;

        let config = &self.shared.config;
        let request = SpawnRequest::new(thread.id(), config.thread_name(thread.id()))
            .with_stack_size(config.bounded_stack_size(thread.stack_size()))
            .with_priority(thread.priority());

        let manager = self.clone();
        let entry = thread.clone();
        match self
            .shared
            .scheduler
            .spawn(request, Box::new(move || manager.run(entry)))
        {
            Ok(handle) => {
                thread.set_native_handle(handle);
                thread.set_pid(std::process::id());
                thread.set_flag(ThreadFlags::INITIALIZED);
                thread.transition(ThreadState::Started);
                log::debug!("Started thread {}", thread.id());
                Ok(())
            }
            Err(err) => {
                self.shared.registry.unregister(thread.id());
                Err(err)
            }
        }
    }

    // =========================================================================
    // Run trampoline
    // =========================================================================

    fn run(&self, thread: Arc<Thread>) {
        // Wait for `start` to finish binding
        drop(thread.init_lock().lock());
        if thread.state() != ThreadState::Started {
            return;
        }

        let native = Arc::new(NativeContext::new(thread.id(), std::thread::current().id()));
        if let Err(err) = self.shared.registry.bind_native(thread.id(), native.native()) {
            log::warn!("Thread {} could not bind native thread: {}", thread.id(), err);
        }
        thread.set_native_context(Some(native.clone()));
        self.shared.safepoints.register(thread.id());
        thread.transition(ThreadState::Running);

        let ctx = ExecutionContext::new(thread.clone(), native, self.clone());
        let args = thread.args();
        let result = match thread.block() {
            Some(block) => panic::catch_unwind(AssertUnwindSafe(|| {
                ctx.checkpoint()?;
                block(&ctx, args.as_slice())
            }))
            .unwrap_or_else(|payload| Err(Unwind::Raise(Exception::from_panic(payload)))),
            None => Err(ThreadError::MissingBlock.into()),
        };
        drop(ctx);

        self.stop(&thread, Termination::from(result));
    }

    fn stop(&self, thread: &Arc<Thread>, termination: Termination) {
        match &termination {
            Termination::Returned(_) => log::debug!("Thread {} returned", thread.id()),
            Termination::Raised(exc) => log::debug!("Thread {} raised {}", thread.id(), exc),
            Termination::Killed => log::debug!("Thread {} killed", thread.id()),
        }

        thread.stopped(termination);
        self.shared.safepoints.unregister(thread.id());
        self.finalize(thread);
    }

    // =========================================================================
    // Finalize
    // =========================================================================

    /// Release native resources, deregister and release joiners
    ///
    /// Idempotent. Returns `false` if the thread is still running, was
    /// discarded by fork recovery, or was already finalized.
    pub fn finalize(&self, thread: &Arc<Thread>) -> bool {
        let _init = thread.init_lock().lock();
        if thread.is_alive() || thread.is_stale() {
            return false;
        }

        if thread.state() != ThreadState::Finalized {
            self.shared.registry.unregister(thread.id());
        }
        let finalized = thread.finalize_instance();
        if finalized {
            log::debug!("Finalized thread {}", thread.id());
        }
        finalized
    }

    // =========================================================================
    // Fork recovery
    // =========================================================================

    /// Recover in a forked child
    ///
    /// Resets every lock inherited from the parent, keeps the entity bound to
    /// the calling native thread, and marks every other registered entity
    /// stale. Unregistered entities caught mid start or finalize are marked
    /// stale too; the rest stay usable. The survivor becomes the main thread.
    ///
    /// Nothing is reset if the calling thread is not bound to an entity.
    ///
    /// # Safety
    /// Must be called in the child immediately after fork, before any other
    /// thread operation, while the calling thread is the only one running
    /// code of this manager.
    pub unsafe fn after_fork(&self) -> ThreadResult<Arc<Thread>> {
        let shared = &self.shared;
        let native = std::thread::current().id();

        let survivor = match shared.registry.try_by_native(native) {
            Some(found) => found,
            None => {
                // SAFETY: the writer was lost in the fork.
                unsafe { shared.registry.reinit_after_fork() };
                shared.registry.by_native(native)
            }
        }
        .ok_or(ThreadError::UnknownThread)?;

        // SAFETY: only the calling thread survived the fork.
        unsafe {
            shared.registry.reinit_after_fork();
            shared.safepoints.reinit_after_fork(survivor.id());
        }

        let stale = shared.registry.retain_only(survivor.id());
        for thread in &stale {
            // SAFETY: the native thread behind `thread` no longer exists.
            unsafe { thread.discard_after_fork() };
        }

        // SAFETY: as above.
        unsafe { sync::reset_spin_mutex(&shared.created) };
        let entities: Vec<Arc<Thread>> = {
            let mut created = shared.created.lock();
            created.retain(|weak| weak.strong_count() > 0);
            created.iter().filter_map(Weak::upgrade).collect()
        };
        let mut interrupted = 0;
        for thread in &entities {
            if thread.id() == survivor.id() || thread.is_stale() {
                continue;
            }
            if thread.init_lock().is_locked() {
                // SAFETY: the holder was lost mid start or finalize.
                unsafe { thread.discard_after_fork() };
                interrupted += 1;
            } else {
                // SAFETY: as above.
                unsafe { thread.reset_locks() };
            }
        }

        // SAFETY: as above.
        unsafe {
            survivor.reinit_after_fork(std::process::id());
            sync::reset_spin_rwlock(&shared.main);
        }
        survivor.set_flag(ThreadFlags::MAIN);
        let previous = core::mem::replace(&mut *shared.main.write(), survivor.clone());
        if previous.id() != survivor.id() {
            previous.clear_flag(ThreadFlags::MAIN);
        }

        log::info!(
            "Fork recovery kept thread {}, discarded {}",
            survivor.id(),
            stale.len() + interrupted
        );
        Ok(survivor)
    }
}

// =============================================================================
// TESTS
// =============================================================================
