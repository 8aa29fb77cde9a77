//! Barrier manager.

use bitflags::bitflags;

use crate::context::Caller;
use crate::kernel::State;
use crate::object::{BarrierId, TaskId};
use crate::status::{Result, Status};
use crate::task::{WaitObject, WaitValue};
use crate::threadq::{Discipline, ThreadQueue, Timeout};

bitflags! {
    /// Creation attributes. Without a release bit the barrier is manual.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BarrierAttributes: u32 {
        /// The arrival that completes the count releases everyone.
        const AUTOMATIC_RELEASE = 1 << 0;
        const MANUAL_RELEASE = 1 << 1;
        /// Priority wait discipline.
        const PRIORITY = 1 << 2;
    }
}

impl BarrierAttributes {
    pub const FIFO: BarrierAttributes = BarrierAttributes::empty();
}

/// Observable state of a barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierInfo {
    pub name: String,
    pub automatic: bool,
    pub maximum: u32,
    pub waiters: Vec<TaskId>,
}

pub(crate) struct Barrier {
    name: String,
    automatic: bool,
    maximum: u32,
    pub(crate) queue: ThreadQueue,
}

impl State {
    pub(crate) fn barrier_create(
        &mut self,
        caller: Caller,
        name: &str,
        attributes: BarrierAttributes,
        maximum: u32,
    ) -> Result<BarrierId> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        if name.is_empty() {
            return Err(Status::InvalidName);
        }
        if attributes.contains(BarrierAttributes::AUTOMATIC_RELEASE | BarrierAttributes::MANUAL_RELEASE) {
            return Err(Status::NotDefined);
        }
        let automatic = attributes.contains(BarrierAttributes::AUTOMATIC_RELEASE);
        if automatic && maximum == 0 {
            return Err(Status::InvalidNumber);
        }
        let discipline = if attributes.contains(BarrierAttributes::PRIORITY) {
            Discipline::Priority
        } else {
            Discipline::Fifo
        };
        let id = self.barriers.insert_with(|_| Barrier {
            name: name.to_string(),
            automatic,
            maximum,
            queue: ThreadQueue::new(discipline),
        })?;
        log::debug!("created barrier {id} {name:?}");
        Ok(id)
    }

    pub(crate) fn barrier_ident(&self, name: &str) -> Result<BarrierId> {
        self.barriers
            .ids()
            .into_iter()
            .find(|id| self.barriers.get(*id).is_some_and(|b| b.name == name))
            .ok_or(Status::InvalidName)
    }

    pub(crate) fn barrier_info(&self, id: BarrierId) -> Result<BarrierInfo> {
        let barrier = self.barriers.get(id).ok_or(Status::InvalidId)?;
        Ok(BarrierInfo {
            name: barrier.name.clone(),
            automatic: barrier.automatic,
            maximum: barrier.maximum,
            waiters: barrier.queue.tasks().collect(),
        })
    }

    pub(crate) fn barrier_wait(&mut self, caller: Caller, id: BarrierId, timeout: Timeout) -> Result<()> {
        let object = WaitObject::Barrier(id);
        if let Some(outcome) = self.resume_outcome(caller, object) {
            return outcome.map(drop);
        }
        self.ensure_not_blocked(caller)?;
        let barrier = self.barriers.get(id).ok_or(Status::InvalidId)?;
        let arrivals = barrier.queue.len() as u64 + 1;
        if barrier.automatic && arrivals >= u64::from(barrier.maximum) {
            self.release_all(object);
            return Ok(());
        }
        self.wait_for(caller, object, timeout, false)
    }

    /// Releases every waiter. Returns how many were released.
    pub(crate) fn barrier_release(&mut self, id: BarrierId) -> Result<usize> {
        if !self.barriers.contains(id) {
            return Err(Status::InvalidId);
        }
        Ok(self.release_all(WaitObject::Barrier(id)))
    }

    /// Releases at most `count` waiters in queue order.
    pub(crate) fn barrier_release_n(&mut self, id: BarrierId, count: usize) -> Result<usize> {
        if !self.barriers.contains(id) {
            return Err(Status::InvalidId);
        }
        let object = WaitObject::Barrier(id);
        let mut released = 0;
        while released < count && self.dequeue_first(object, Ok(WaitValue::Unit)).is_some() {
            released += 1;
        }
        Ok(released)
    }

    fn release_all(&mut self, object: WaitObject) -> usize {
        let mut released = 0;
        while self.dequeue_first(object, Ok(WaitValue::Unit)).is_some() {
            released += 1;
        }
        released
    }

    pub(crate) fn barrier_delete(&mut self, caller: Caller, id: BarrierId) -> Result<()> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        if !self.barriers.contains(id) {
            return Err(Status::InvalidId);
        }
        self.flush_waiters(WaitObject::Barrier(id), Status::ObjectWasDeleted);
        self.barriers.remove(id);
        log::debug!("deleted barrier {id}");
        Ok(())
    }
}

#[cfg(test)]
impl State {
    /// Manual barrier used as a plain wait queue in unit tests.
    pub(crate) fn test_barrier(&mut self, discipline: Discipline) -> WaitObject {
        let attributes = match discipline {
            Discipline::Fifo => BarrierAttributes::MANUAL_RELEASE,
            Discipline::Priority => BarrierAttributes::MANUAL_RELEASE | BarrierAttributes::PRIORITY,
        };
        let id = self
            .barrier_create(Caller::Init, "test", attributes, 0)
            .expect("test barrier");
        WaitObject::Barrier(id)
    }
}
