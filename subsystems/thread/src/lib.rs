//! # Strand Thread Subsystem
//!
//! The thread subsystem manages:
//! - Thread entities and their lifecycle
//! - Binding entities to native threads through a pluggable scheduler
//! - Fiber-aware thread-local storage
//! - The registry of live threads
//! - Collector handshakes at safe points
//! - Recovery of lock state after a process fork
//!
//! ## Key Principle
//!
//! Other threads only interact with a thread through its [`Thread`] entity
//! (join, kill, wakeup, raise, locals). Native threads are never touched
//! directly, and every operation goes through an explicit [`ThreadManager`]
//! handle rather than ambient global state.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod hooks;
pub mod lifecycle;
pub mod safepoint;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod value;


pub use config::{PriorityPolicy, ThreadConfig};
pub use context::{ContextSnapshot, ExecutionContext, Frame, FrameGuard, NativeContext};
pub use lifecycle::{ThreadManager, ThreadOptions};
pub use safepoint::{SafeRegion, Safepoints, WorldStopped};
pub use scheduler::{NativeHandle, NativeScheduler, Priority, SpawnRequest, StdScheduler};
pub use thread::{Randomizer, Thread, ThreadFlags, ThreadRegistry, ThreadState};
pub use value::{block, Block, Exception, ObjectId, Symbol, Termination, Unwind, Value};

use core::fmt;

/// Native thread identifier as reported by the host
pub type NativeThreadId = std::thread::ThreadId;

/// Unique identifier for thread entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Identifier of the thread that created the manager
    pub const fn main() -> Self {
        Self(1)
    }

    /// Wrap a raw identifier
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier for a fiber running inside a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(u64);

impl FiberId {
    /// The fiber every thread starts on
    pub const ROOT: Self = Self(0);

    /// Wrap a raw identifier
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for FiberId {
    fn default() -> Self {
        Self::ROOT
    }
}

/// Thread subsystem result type
pub type ThreadResult<T> = Result<T, ThreadError>;

/// Thread subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadError {
    /// A thread tried to join itself
    JoinSelf,
    /// The entity is already bound to a native thread
    AlreadyStarted,
    /// The entity was never started
    NotStarted,
    /// The entity was finalized before it was started
    Finalized,
    /// The entity was discarded by fork recovery
    Stale,
    /// No callable was supplied to run on the thread
    MissingBlock,
    /// The native thread could not be spawned
    SpawnFailed {
        /// Error reported by the host
        kind: std::io::ErrorKind,
    },
    /// Priority outside of the accepted range
    PriorityOutOfRange {
        /// The rejected value
        requested: i32,
    },
    /// The thread is no longer alive
    NotAlive,
    /// The calling native thread is not bound to any entity
    UnknownThread,
    /// An entity with the same identity is already registered
    AlreadyRegistered,
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JoinSelf => write!(f, "thread tried to join itself"),
            Self::AlreadyStarted => write!(f, "thread already started"),
            Self::NotStarted => write!(f, "thread not started"),
            Self::Finalized => write!(f, "thread finalized before start"),
            Self::Stale => write!(f, "thread does not exist after fork"),
            Self::MissingBlock => write!(f, "must be called with a block"),
            Self::SpawnFailed { kind } => write!(f, "could not spawn native thread: {}", kind),
            Self::PriorityOutOfRange { requested } => write!(
                f,
                "priority {} outside of {}..={}",
                requested,
                Priority::MIN.value(),
                Priority::MAX.value()
            ),
            Self::NotAlive => write!(f, "killed thread"),
            Self::UnknownThread => write!(f, "native thread is not bound to a thread entity"),
            Self::AlreadyRegistered => write!(f, "thread already registered"),
        }
    }
}

impl std::error::Error for ThreadError {}

static_assertions::assert_impl_all!(Thread: Send, Sync);
static_assertions::assert_impl_all!(NativeContext: Send, Sync);
static_assertions::assert_impl_all!(ThreadManager: Send, Sync, Clone);
static_assertions::assert_impl_all!(ThreadError: Send, Sync, Copy);
static_assertions::const_assert!(scheduler::priority::PRIORITY_MIN < scheduler::priority::PRIORITY_MAX);
