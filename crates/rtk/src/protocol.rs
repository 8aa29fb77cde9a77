//! Locking protocols and the effective priority they produce.
//!
//! The effective priority of a task is never stored as a delta; it is
//! recomputed from the real priority and whatever currently raises it:
//!
//! * waiters of owned [`Protocol::Inherit`] mutexes homed on the same
//!   instance,
//! * the ceiling applied when an owned [`Protocol::Ceiling`] or
//!   [`Protocol::MrsP`] mutex was acquired,
//! * the MrsP ceiling while spinning as an MrsP waiter,
//! * the raise a more urgent deleter applied.
//!
//! Releasing a lock therefore reverts exactly what the lock contributed.

use crate::config::SchedulerPolicy;
use crate::kernel::State;
use crate::object::{SemaphoreId, TaskId};
use crate::priority::{Priority, Urgency};
use crate::scheduler::SchedulerId;
use crate::semaphore::Variant;
use crate::status::{Result, Status};
use crate::task::WaitObject;

/// Locking protocol of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Protocol {
    /// Plain ownership, no priority adjustment.
    None,
    /// The owner inherits the priority of its most urgent waiter.
    Inherit,
    /// The owner runs at the ceiling of the mutex (one instance).
    Ceiling,
    /// Multiprocessor resource sharing: per-instance ceilings, FIFO waiters
    /// that keep their processor and let the owner run on it.
    MrsP,
}

impl Protocol {
    pub fn inherits(&self) -> bool {
        matches!(self, Protocol::Inherit)
    }

    pub fn uses_ceiling(&self) -> bool {
        matches!(self, Protocol::Ceiling | Protocol::MrsP)
    }
}

impl State {
    /// Recomputes priority and urgency of `task`. Returns whether they changed.
    pub(crate) fn recompute_priority(&mut self, task: TaskId) -> bool {
        let Some((priority, urgency)) = self.compute_priority(task) else {
            return false;
        };
        let Some(tcb) = self.tasks.get_mut(task) else {
            return false;
        };
        let changed = tcb.priority != priority || tcb.urgency != urgency;
        tcb.priority = priority;
        tcb.urgency = urgency;
        changed
    }

    fn compute_priority(&self, task: TaskId) -> Option<(Priority, Urgency)> {
        let tcb = self.tasks.get(task)?;
        let instance = self.schedulers.get(tcb.home.index())?;

        let mut priority = tcb.real_priority;
        let mut urgency = match (instance.policy, tcb.deadline) {
            (SchedulerPolicy::Edf, Some(deadline)) => Urgency::deadline(deadline),
            _ => tcb.real_priority.urgency(),
        };
        let mut raise = |p: Priority, u: Urgency| {
            priority = priority.max(p);
            urgency = urgency.max(u);
        };

        if let Some(boost) = tcb.boost {
            raise(boost, boost.urgency());
        }

        for id in &tcb.owned {
            let Some(semaphore) = self.semaphores.get(*id) else {
                continue;
            };
            let Variant::Mutex(mutex) = &semaphore.variant else {
                continue;
            };
            match mutex.protocol {
                Protocol::None => {}
                Protocol::Inherit => {
                    for waiter in semaphore.queue.tasks() {
                        if let Some(w) = self.tasks.get(waiter).filter(|w| w.home == tcb.home) {
                            raise(w.priority, w.urgency);
                        }
                    }
                }
                Protocol::Ceiling | Protocol::MrsP => {
                    if let Some(applied) = mutex.applied {
                        raise(applied, applied.urgency());
                    }
                }
            }
        }

        if tcb.wait.sticky {
            if let Some(WaitObject::Semaphore(id)) = tcb.wait.object {
                if let Some(ceiling) = self.ceiling_for(id, tcb.home) {
                    raise(ceiling, ceiling.urgency());
                }
            }
        }

        Some((priority, urgency))
    }

    /// Ceiling of a ceiling-protocol mutex for one instance.
    pub(crate) fn ceiling_for(&self, id: SemaphoreId, scheduler: SchedulerId) -> Option<Priority> {
        match &self.semaphores.get(id)?.variant {
            Variant::Mutex(mutex) if mutex.protocol.uses_ceiling() => mutex
                .ceilings
                .get(scheduler.index())
                .copied()
                .flatten(),
            _ => None,
        }
    }

    /// Rejects acquisition by a task more urgent than the ceiling.
    pub(crate) fn check_ceiling(&self, id: SemaphoreId, task: TaskId) -> Result<()> {
        let tcb = self.tasks.get(task).ok_or(Status::InvalidId)?;
        let semaphore = self.semaphores.get(id).ok_or(Status::InvalidId)?;
        let Some(protocol) = semaphore.protocol() else {
            return Ok(());
        };
        match protocol {
            Protocol::Ceiling | Protocol::MrsP => match self.ceiling_for(id, tcb.home) {
                Some(ceiling) if tcb.priority > ceiling => Err(Status::InvalidPriority),
                Some(_) => Ok(()),
                // No ceiling is defined for the task's home instance.
                None => Err(Status::NotDefined),
            },
            Protocol::None | Protocol::Inherit => Ok(()),
        }
    }

    /// Whether `caller` waiting for something `owner` holds closes a cycle.
    pub(crate) fn would_deadlock(&self, caller: TaskId, owner: TaskId) -> bool {
        let mut current = owner;
        for _ in 0..=self.tasks.len() {
            if current == caller {
                return true;
            }
            let Some(tcb) = self.tasks.get(current) else {
                return false;
            };
            current = match tcb.wait.object {
                Some(WaitObject::Semaphore(id)) => {
                    match self.semaphores.get(id).and_then(|s| s.owner()) {
                        Some(next) => next,
                        None => return false,
                    }
                }
                Some(WaitObject::Join(target)) => target,
                _ => return false,
            };
        }
        true
    }
}
