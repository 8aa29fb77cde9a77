//! Watchdog timers driven by the clock tick.
//!
//! Armed watchdogs are kept ordered by expiry tick and insertion sequence, so
//! watchdogs expiring on the same tick fire in the order they were armed.

use std::collections::BTreeMap;

use crate::object::{PeriodId, TaskId};

/// Identity of an armed watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct WatchdogKey {
    expire: u64,
    seq: u64,
}

impl WatchdogKey {
    pub(crate) fn expire(&self) -> u64 {
        self.expire
    }
}

/// What to do when a watchdog fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchdogEvent {
    /// End the wait with sequence number `wait` of `task`.
    WaitTimeout { task: TaskId, wait: u64 },
    /// The current period of a rate-monotonic period ends.
    PeriodEnd { period: PeriodId },
}

#[derive(Debug, Default)]
pub(crate) struct TimerWheel {
    now: u64,
    seq: u64,
    armed: BTreeMap<WatchdogKey, WatchdogEvent>,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Current tick count.
    pub(crate) fn now(&self) -> u64 {
        self.now
    }

    /// Arms a watchdog `ticks` ticks from now.
    pub(crate) fn insert(&mut self, ticks: u64, event: WatchdogEvent) -> WatchdogKey {
        self.insert_at(self.now.saturating_add(ticks.max(1)), event)
    }

    /// Arms a watchdog at an absolute tick, at the earliest on the next tick.
    pub(crate) fn insert_at(&mut self, expire: u64, event: WatchdogEvent) -> WatchdogKey {
        self.seq += 1;
        let key = WatchdogKey {
            expire: expire.max(self.now + 1),
            seq: self.seq,
        };
        self.armed.insert(key, event);
        key
    }

    /// Disarms a watchdog. Returns `false` when it already fired or was removed.
    pub(crate) fn remove(&mut self, key: WatchdogKey) -> bool {
        self.armed.remove(&key).is_some()
    }

    pub(crate) fn is_armed(&self, key: WatchdogKey) -> bool {
        self.armed.contains_key(&key)
    }

    pub(crate) fn remaining(&self, key: WatchdogKey) -> Option<u64> {
        self.is_armed(key).then(|| key.expire - self.now)
    }

    /// Advances time by one tick and returns the expired watchdogs in firing
    /// order. They are disarmed before they are returned.
    pub(crate) fn tick(&mut self) -> Vec<(WatchdogKey, WatchdogEvent)> {
        self.now += 1;
        let mut expired = Vec::new();
        while let Some(entry) = self.armed.first_entry() {
            if entry.key().expire > self.now {
                break;
            }
            let key = *entry.key();
            expired.push((key, entry.remove()));
        }
        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.armed.len()
    }
}
