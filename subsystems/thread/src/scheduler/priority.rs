//! # Priority Management
//!
//! Thread priority is an opaque scheduling hint. Higher is more important;
//! nothing in the subsystem depends on it for correctness.

use crate::config::PriorityPolicy;
use crate::{ThreadError, ThreadResult};
use core::fmt;

/// Lowest accepted priority
pub const PRIORITY_MIN: i32 = -3;
/// Highest accepted priority
pub const PRIORITY_MAX: i32 = 3;

/// Thread priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(i32);

impl Priority {
    /// Minimum priority (lowest)
    pub const MIN: Self = Self(PRIORITY_MIN);

    /// Maximum priority (highest)
    pub const MAX: Self = Self(PRIORITY_MAX);

    /// Default priority
    pub const DEFAULT: Self = Self(0);

    /// Create a priority, clamping into range
    pub const fn new(value: i32) -> Self {
        Self(if value < PRIORITY_MIN {
            PRIORITY_MIN
        } else if value > PRIORITY_MAX {
            PRIORITY_MAX
        } else {
            value
        })
    }

    /// Create a priority, rejecting out-of-range values
    pub fn try_new(value: i32) -> ThreadResult<Self> {
        if Self::in_range(value) {
            Ok(Self(value))
        } else {
            Err(ThreadError::PriorityOutOfRange { requested: value })
        }
    }

    /// Create a priority according to `policy`
    pub fn with_policy(value: i32, policy: PriorityPolicy) -> ThreadResult<Self> {
        match policy {
            PriorityPolicy::Clamp => Ok(Self::new(value)),
            PriorityPolicy::Reject => Self::try_new(value),
        }
    }

    /// Check if a raw value is accepted without clamping
    pub fn in_range(value: i32) -> bool {
        (PRIORITY_MIN..=PRIORITY_MAX).contains(&value)
    }

    /// Get the raw value
    pub fn value(self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_clamping() {
        assert_eq!(Priority::new(100), Priority::MAX);
        assert_eq!(Priority::new(-100), Priority::MIN);
        assert_eq!(Priority::new(2).value(), 2);
    }

    #[test]
    fn test_priority_rejection() {
        assert_eq!(Priority::try_new(1), Ok(Priority::new(1)));
        assert_eq!(
            Priority::try_new(4),
            Err(ThreadError::PriorityOutOfRange { requested: 4 })
        );
    }

    #[test]
    fn test_priority_policy() {
        assert_eq!(Priority::with_policy(9, PriorityPolicy::Clamp), Ok(Priority::MAX));
        assert!(Priority::with_policy(9, PriorityPolicy::Reject).is_err());
        assert_eq!(Priority::with_policy(-3, PriorityPolicy::Reject), Ok(Priority::MIN));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::MAX > Priority::DEFAULT);
        assert!(Priority::MIN < Priority::DEFAULT);
        assert_eq!(Priority::default(), Priority::DEFAULT);
    }
}
