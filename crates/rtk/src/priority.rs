//! Task priorities.
//!
//! Larger values are more urgent. Priority 0 is reserved for the idle
//! processor state and is never a valid task priority.

use core::fmt;

/// Highest priority level any scheduler instance can be configured with.
pub const PRIORITY_LEVELS: u8 = 64;

/// Task priority. Meaningful only relative to a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Priority(pub u8);

impl Priority {
    pub const IDLE: Priority = Priority(0);
    pub const MAX: Priority = Priority(PRIORITY_LEVELS - 1);

    pub fn get(self) -> u8 {
        self.0
    }

    /// Valid task priority for an instance whose maximum is `max`.
    pub fn is_valid_for(self, max: Priority) -> bool {
        self.0 != 0 && self <= max
    }

    pub(crate) fn urgency(self) -> Urgency {
        Urgency(u64::from(self.0))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Total order used to pick between tasks. Static priorities occupy the
/// bottom of the range; EDF jobs with a deadline sit above every static
/// priority and the earliest deadline is the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub(crate) struct Urgency(pub(crate) u64);

const DEADLINE_CLASS: u64 = 1 << 62;

impl Urgency {
    pub(crate) fn deadline(deadline: u64) -> Self {
        let deadline = deadline.min(DEADLINE_CLASS - 1);
        Self(DEADLINE_CLASS + (DEADLINE_CLASS - 1 - deadline))
    }

    /// Priority level within the fixed-priority range.
    pub(crate) fn level(self) -> u8 {
        self.0.min(u64::from(Priority::MAX.0)) as u8
    }
}
