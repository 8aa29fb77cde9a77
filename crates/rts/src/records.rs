//! Canonical record identifiers shared across the workspace.

/// Task life-cycle record identifiers.
pub mod task {
    /// Task created (dormant).
    pub const CREATE: u8 = 1;
    /// Task started.
    pub const START: u8 = 2;
    /// Task restarted.
    pub const RESTART: u8 = 3;
    /// Task terminated and turned into a zombie.
    pub const DELETE: u8 = 4;
    /// Task suspended.
    pub const SUSPEND: u8 = 5;
    /// Task resumed.
    pub const RESUME: u8 = 6;
    /// Life change deferred by thread-life protection.
    pub const DEFER: u8 = 7;
    /// Real priority changed.
    pub const PRIORITY: u8 = 8;
    /// Zombie storage reclaimed.
    pub const RECLAIM: u8 = 9;
}

/// Thread queue record identifiers.
pub mod tq {
    /// Task enqueued on a wait queue.
    pub const ENQUEUE: u8 = 20;
    /// Task released by the queue owner.
    pub const DEQUEUE: u8 = 21;
    /// Task extracted by a timeout.
    pub const TIMEOUT: u8 = 22;
    /// Task extracted by cancellation (delete, flush).
    pub const EXTRACT: u8 = 23;
}

/// Watchdog record identifiers.
pub mod watchdog {
    /// Watchdog armed.
    pub const ARM: u8 = 32;
    /// Watchdog disarmed before expiry.
    pub const DISARM: u8 = 33;
    /// Watchdog expired.
    pub const FIRE: u8 = 34;
}

/// Lock hand-over record identifiers.
pub mod mutex {
    /// Mutex obtained.
    pub const OBTAIN: u8 = 40;
    /// Mutex released.
    pub const RELEASE: u8 = 41;
    /// Ownership handed to a waiter.
    pub const HANDOVER: u8 = 42;
}

/// Scheduler related record identifiers.
pub mod sched {
    /// Thread dispatch disabled on a processor.
    pub const LOCK: u8 = 50;
    /// Thread dispatch enabled again.
    pub const UNLOCK: u8 = 51;
    /// Context switch to a new heir.
    pub const NEXT: u8 = 52;
    /// Processor has nothing to run.
    pub const IDLE: u8 = 53;
    /// Lock owner runs on a helping processor.
    pub const HELP: u8 = 54;
}

/// Fatal error record.
pub const FATAL: u8 = 70;
