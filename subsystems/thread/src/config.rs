//! # Thread Subsystem Configuration

use crate::ThreadId;
use core::time::Duration;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        const PLATFORM_STACK_SIZE: usize = 4 * 1024 * 1024;
    } else {
        const PLATFORM_STACK_SIZE: usize = 1024 * 1024;
    }
}

/// What `set_priority` does with a value outside the accepted range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityPolicy {
    /// Clamp to the nearest bound
    Clamp,
    /// Reject with `ThreadError::PriorityOutOfRange`
    Reject,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        PriorityPolicy::Clamp
    }
}

/// Configuration for the thread subsystem
#[derive(Debug, Clone)]
pub struct ThreadConfig {
    /// Native stack size for new threads (`None` uses the platform default)
    pub stack_size: Option<usize>,
    /// Lower bound applied to any requested stack size
    pub min_stack_size: usize,
    /// Handling of out-of-range priorities
    pub priority_policy: PriorityPolicy,
    /// Slice length for managed joins, so interrupts are seen while blocked
    pub join_poll_interval: Duration,
    /// Prefix for native thread names
    pub name_prefix: String,
}

impl ThreadConfig {
    /// Default native stack size
    pub const DEFAULT_STACK_SIZE: usize = PLATFORM_STACK_SIZE;
    /// Smallest stack a thread may be given: 64 KiB
    pub const MIN_STACK_SIZE: usize = 64 * 1024;
    /// Default join slice: 10ms
    pub const DEFAULT_JOIN_POLL: Duration = Duration::from_millis(10);

    /// Create default configuration
    pub fn new() -> Self {
        Self {
            stack_size: Some(Self::DEFAULT_STACK_SIZE),
            min_stack_size: Self::MIN_STACK_SIZE,
            priority_policy: PriorityPolicy::Clamp,
            join_poll_interval: Self::DEFAULT_JOIN_POLL,
            name_prefix: String::from("strand"),
        }
    }

    /// Create a configuration with small stacks (useful for many short threads)
    pub fn small_stacks() -> Self {
        Self {
            stack_size: Some(Self::MIN_STACK_SIZE * 4),
            ..Self::new()
        }
    }

    /// Create a configuration that leaves stack sizing to the host
    pub fn platform_stacks() -> Self {
        Self {
            stack_size: None,
            ..Self::new()
        }
    }

    /// Create a configuration that rejects out-of-range priorities
    pub fn strict() -> Self {
        Self {
            priority_policy: PriorityPolicy::Reject,
            ..Self::new()
        }
    }

    /// Resolve the stack size for a thread, honoring the lower bound
    pub fn bounded_stack_size(&self, requested: Option<usize>) -> Option<usize> {
        requested
            .or(self.stack_size)
            .map(|size| size.max(self.min_stack_size))
    }

    /// Native thread name for an entity
    pub fn thread_name(&self, id: ThreadId) -> String {
        format!("{}-{}", self.name_prefix, id.as_u64())
    }
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
