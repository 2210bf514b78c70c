//! # Thread States
//!
//! Thread state machine definition.

/// Thread state (unit-only for atomic storage)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadState {
    /// Entity allocated, no native thread bound
    Allocated = 0,
    /// Native thread spawned, entry not yet running
    Started = 1,
    /// Native thread is running the block
    Running = 2,
    /// Block finished, value or exception recorded
    Terminated = 3,
    /// Native resources released (terminal)
    Finalized = 4,
    /// Discarded by fork recovery (terminal)
    Stale = 5,
}

impl ThreadState {
    /// Convert from u32
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Allocated),
            1 => Some(Self::Started),
            2 => Some(Self::Running),
            3 => Some(Self::Terminated),
            4 => Some(Self::Finalized),
            5 => Some(Self::Stale),
            _ => None,
        }
    }

    /// Convert to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Check if a native thread is bound and has not finished
    pub fn is_alive(&self) -> bool {
        matches!(self, ThreadState::Started | ThreadState::Running)
    }

    /// Check if the thread has finished running
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            ThreadState::Terminated | ThreadState::Finalized | ThreadState::Stale
        )
    }

    /// Valid transitions from this state
    pub fn valid_transitions(&self) -> &[ThreadState] {
        match self {
            ThreadState::Allocated => &[
                ThreadState::Started,
                ThreadState::Finalized,
                ThreadState::Stale,
            ],
            ThreadState::Started => &[ThreadState::Running, ThreadState::Stale],
            ThreadState::Running => &[ThreadState::Terminated, ThreadState::Stale],
            ThreadState::Terminated => &[ThreadState::Finalized, ThreadState::Stale],
            ThreadState::Finalized => &[],
            ThreadState::Stale => &[],
        }
    }

    /// Check if moving to `next` is allowed
    pub fn can_transition_to(&self, next: ThreadState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl Default for ThreadState {
    fn default() -> Self {
        ThreadState::Allocated
    }
}

pub mod flags {
    //! Thread flag bits
    use bitflags::bitflags;

    bitflags! {
        /// Thread flags
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct ThreadFlags: u32 {
            /// Bound to a native thread
            const INITIALIZED = 1 << 0;
            /// Parked in `sleep`, eligible for wakeup
            const SLEEPING = 1 << 1;
            /// Collector handshakes are deferred
            const CRITICAL = 1 << 2;
            /// Termination requested, honored at the next safe point
            const KILL_PENDING = 1 << 3;
            /// Entity adopted from the thread that built the manager
            const MAIN = 1 << 4;
        }
    }
}

pub use flags::ThreadFlags;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for raw in 0..6 {
            let state = ThreadState::from_u32(raw).unwrap();
            assert_eq!(state.as_u32(), raw);
        }
        assert_eq!(ThreadState::from_u32(6), None);
    }

    #[test]
    fn test_alive_window() {
        assert!(!ThreadState::Allocated.is_alive());
        assert!(ThreadState::Started.is_alive());
        assert!(ThreadState::Running.is_alive());
        assert!(!ThreadState::Terminated.is_alive());
        assert!(ThreadState::Terminated.is_terminated());
        assert!(!ThreadState::Allocated.is_terminated());
    }

    #[test]
    fn test_no_restart() {
        for state in [ThreadState::Terminated, ThreadState::Finalized, ThreadState::Stale] {
            assert!(!state.can_transition_to(ThreadState::Started));
            assert!(!state.can_transition_to(ThreadState::Running));
        }
        assert!(ThreadState::Finalized.valid_transitions().is_empty());
    }

    #[test]
    fn test_unstarted_finalize() {
        assert!(ThreadState::Allocated.can_transition_to(ThreadState::Finalized));
        assert!(!ThreadState::Running.can_transition_to(ThreadState::Finalized));
    }
}
