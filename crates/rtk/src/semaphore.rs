//! Semaphore manager: counting semaphores, simple binary semaphores and
//! mutexes with a locking protocol.

use bitflags::bitflags;
use rts::records::mutex;

use crate::context::Caller;
use crate::kernel::State;
use crate::object::{SemaphoreId, TaskId};
use crate::priority::Priority;
use crate::protocol::Protocol;
use crate::scheduler::SchedulerId;
use crate::status::{Result, Status};
use crate::task::{WaitObject, WaitValue};
use crate::threadq::{Discipline, ThreadQueue, Timeout};

bitflags! {
    /// Creation attributes. The empty set is a FIFO counting semaphore.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct SemaphoreAttributes: u32 {
        /// Priority wait discipline.
        const PRIORITY = 1 << 0;
        /// Binary semaphore with ownership: a mutex.
        const BINARY = 1 << 1;
        /// Binary semaphore without ownership.
        const SIMPLE_BINARY = 1 << 2;
        const INHERIT_PRIORITY = 1 << 3;
        const PRIORITY_CEILING = 1 << 4;
        const MULTIPROCESSOR_RESOURCE_SHARING = 1 << 5;
    }
}

impl SemaphoreAttributes {
    pub const FIFO: SemaphoreAttributes = SemaphoreAttributes::empty();
    pub const COUNTING: SemaphoreAttributes = SemaphoreAttributes::empty();

    fn classify(self) -> Result<SemaphoreKind> {
        let binary = self.contains(Self::BINARY);
        if binary && self.contains(Self::SIMPLE_BINARY) {
            return Err(Status::NotDefined);
        }
        let protocols = [
            (Self::INHERIT_PRIORITY, Protocol::Inherit),
            (Self::PRIORITY_CEILING, Protocol::Ceiling),
            (Self::MULTIPROCESSOR_RESOURCE_SHARING, Protocol::MrsP),
        ];
        let mut selected = protocols.iter().filter(|(flag, _)| self.contains(*flag));
        let protocol = selected.next().map(|(_, p)| *p);
        if selected.next().is_some() {
            return Err(Status::NotDefined);
        }
        match protocol {
            Some(_) if !binary || !self.contains(Self::PRIORITY) => Err(Status::NotDefined),
            Some(protocol) => Ok(SemaphoreKind::Mutex(protocol)),
            None if binary => Ok(SemaphoreKind::Mutex(Protocol::None)),
            None if self.contains(Self::SIMPLE_BINARY) => Ok(SemaphoreKind::SimpleBinary),
            None => Ok(SemaphoreKind::Counting),
        }
    }

    fn discipline(self) -> Discipline {
        if self.contains(Self::PRIORITY) {
            Discipline::Priority
        } else {
            Discipline::Fifo
        }
    }
}

/// Class of a semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemaphoreKind {
    Counting,
    SimpleBinary,
    Mutex(Protocol),
}

/// Observable state of a semaphore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreInfo {
    pub name: String,
    pub kind: SemaphoreKind,
    pub discipline: Discipline,
    /// Available units; 0 or 1 for mutexes.
    pub count: u32,
    pub owner: Option<TaskId>,
    pub nest: u32,
    pub waiters: Vec<TaskId>,
}

pub(crate) struct MutexState {
    pub(crate) protocol: Protocol,
    pub(crate) owner: Option<TaskId>,
    pub(crate) nest: u32,
    /// Per-instance ceilings; only the creating instance has one under
    /// [`Protocol::Ceiling`].
    pub(crate) ceilings: Vec<Option<Priority>>,
    /// Ceiling in effect for the current owner, fixed at acquisition.
    pub(crate) applied: Option<Priority>,
}

pub(crate) enum Variant {
    Counting { count: u32 },
    Simple { count: u32 },
    Mutex(MutexState),
}

pub(crate) struct Semaphore {
    pub(crate) name: String,
    pub(crate) variant: Variant,
    pub(crate) queue: ThreadQueue,
}

impl Semaphore {
    pub(crate) fn owner(&self) -> Option<TaskId> {
        match &self.variant {
            Variant::Mutex(mutex) => mutex.owner,
            _ => None,
        }
    }

    pub(crate) fn protocol(&self) -> Option<Protocol> {
        match &self.variant {
            Variant::Mutex(mutex) => Some(mutex.protocol),
            _ => None,
        }
    }

    fn mutex_mut(&mut self) -> Option<&mut MutexState> {
        match &mut self.variant {
            Variant::Mutex(mutex) => Some(mutex),
            _ => None,
        }
    }

    fn info(&self) -> SemaphoreInfo {
        let (kind, count, owner, nest) = match &self.variant {
            Variant::Counting { count } => (SemaphoreKind::Counting, *count, None, 0),
            Variant::Simple { count } => (SemaphoreKind::SimpleBinary, *count, None, 0),
            Variant::Mutex(mutex) => (
                SemaphoreKind::Mutex(mutex.protocol),
                u32::from(mutex.owner.is_none()),
                mutex.owner,
                mutex.nest,
            ),
        };
        SemaphoreInfo {
            name: self.name.clone(),
            kind,
            discipline: self.queue.discipline(),
            count,
            owner,
            nest,
            waiters: self.queue.tasks().collect(),
        }
    }
}

impl State {
    pub(crate) fn semaphore_create(
        &mut self,
        caller: Caller,
        name: &str,
        count: u32,
        attributes: SemaphoreAttributes,
        ceiling: Priority,
    ) -> Result<SemaphoreId> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        if name.is_empty() {
            return Err(Status::InvalidName);
        }
        let kind = attributes.classify()?;
        if kind != SemaphoreKind::Counting && count > 1 {
            return Err(Status::InvalidNumber);
        }
        let home = self.caller_home(caller);

        let mut ceilings = vec![None; self.schedulers.len()];
        let mut owner = None;
        if let SemaphoreKind::Mutex(protocol) = kind {
            if protocol.uses_ceiling() && !ceiling.is_valid_for(self.instance(home)?.max_priority) {
                return Err(Status::InvalidPriority);
            }
            match protocol {
                Protocol::Ceiling => ceilings[home.index()] = Some(ceiling),
                Protocol::MrsP => {
                    for (slot, instance) in ceilings.iter_mut().zip(&self.schedulers) {
                        *slot = Some(ceiling.min(instance.max_priority));
                    }
                }
                Protocol::None | Protocol::Inherit => {}
            }
            if count == 0 {
                if protocol == Protocol::MrsP {
                    return Err(Status::InvalidNumber);
                }
                let task = caller.task().ok_or(Status::IncorrectState)?;
                let creator = self.tasks.get(task).ok_or(Status::InvalidId)?;
                if protocol == Protocol::Ceiling && creator.priority > ceiling {
                    return Err(Status::InvalidPriority);
                }
                owner = Some(task);
            }
        }

        let variant = match kind {
            SemaphoreKind::Counting => Variant::Counting { count },
            SemaphoreKind::SimpleBinary => Variant::Simple { count },
            SemaphoreKind::Mutex(protocol) => Variant::Mutex(MutexState {
                protocol,
                owner: None,
                nest: 0,
                ceilings,
                applied: None,
            }),
        };
        let id = self.semaphores.insert_with(|_| Semaphore {
            name: name.to_string(),
            variant,
            queue: ThreadQueue::new(attributes.discipline()),
        })?;
        if let Some(task) = owner {
            self.acquire(id, task);
        }
        log::debug!("created semaphore {id} {name:?} as {kind:?}");
        Ok(id)
    }

    pub(crate) fn semaphore_ident(&self, name: &str) -> Result<SemaphoreId> {
        self.semaphores
            .ids()
            .into_iter()
            .find(|id| self.semaphores.get(*id).is_some_and(|s| s.name == name))
            .ok_or(Status::InvalidName)
    }

    pub(crate) fn semaphore_info(&self, id: SemaphoreId) -> Result<SemaphoreInfo> {
        self.semaphores
            .get(id)
            .map(Semaphore::info)
            .ok_or(Status::InvalidId)
    }

    pub(crate) fn semaphore_obtain(&mut self, caller: Caller, id: SemaphoreId, timeout: Timeout) -> Result<()> {
        let object = WaitObject::Semaphore(id);
        if let Some(outcome) = self.resume_outcome(caller, object) {
            return outcome.map(drop);
        }
        self.ensure_not_blocked(caller)?;
        let semaphore = self.semaphores.get_mut(id).ok_or(Status::InvalidId)?;

        let mutex = match &mut semaphore.variant {
            Variant::Counting { count } | Variant::Simple { count } => {
                if *count > 0 {
                    *count -= 1;
                    return Ok(());
                }
                return self.wait_for(caller, object, timeout, false);
            }
            Variant::Mutex(mutex) => mutex,
        };
        let task = match caller {
            Caller::Task { id, .. } => id,
            Caller::Isr { .. } => return Err(Status::CalledFromIsr),
            Caller::Init => return Err(Status::IncorrectState),
        };
        let protocol = mutex.protocol;
        match mutex.owner {
            None => {
                self.check_ceiling(id, task)?;
                self.acquire(id, task);
                Ok(())
            }
            Some(owner) if owner == task => {
                if protocol == Protocol::MrsP {
                    return Err(Status::Unsatisfied);
                }
                mutex.nest += 1;
                Ok(())
            }
            Some(owner) => {
                if timeout == Timeout::NoWait {
                    return Err(Status::Unsatisfied);
                }
                self.check_ceiling(id, task)?;
                if self.would_deadlock(task, owner) {
                    return Err(Status::IncorrectState);
                }
                self.wait_for(caller, object, timeout, protocol == Protocol::MrsP)
            }
        }
    }

    /// Makes `task` the owner of an unowned mutex.
    fn acquire(&mut self, id: SemaphoreId, task: TaskId) {
        let home = self.tasks.get(task).map(|t| t.home);
        let applied = home.and_then(|home| self.ceiling_for(id, home));
        if let Some(mutex) = self.semaphores.get_mut(id).and_then(Semaphore::mutex_mut) {
            mutex.owner = Some(task);
            mutex.nest = 1;
            mutex.applied = applied;
        }
        if let Some(tcb) = self.tasks.get_mut(task) {
            tcb.owned.push(id);
        }
        self.update_task(task);
        self.trace_pair(mutex::OBTAIN, task, id.object_id().raw());
    }

    pub(crate) fn semaphore_release(&mut self, caller: Caller, id: SemaphoreId) -> Result<()> {
        let object = WaitObject::Semaphore(id);
        let semaphore = self.semaphores.get_mut(id).ok_or(Status::InvalidId)?;
        match &mut semaphore.variant {
            Variant::Counting { count } => {
                if semaphore.queue.is_empty() {
                    *count = count.checked_add(1).ok_or(Status::Unsatisfied)?;
                } else {
                    self.dequeue_first(object, Ok(WaitValue::Unit));
                }
                Ok(())
            }
            Variant::Simple { count } => {
                if semaphore.queue.is_empty() {
                    *count = 1;
                } else {
                    self.dequeue_first(object, Ok(WaitValue::Unit));
                }
                Ok(())
            }
            Variant::Mutex(mutex) => {
                let task = caller.task().ok_or(Status::NotOwnerOfResource)?;
                if mutex.owner != Some(task) {
                    return Err(Status::NotOwnerOfResource);
                }
                if mutex.nest > 1 {
                    mutex.nest -= 1;
                    return Ok(());
                }
                if mutex.protocol == Protocol::MrsP && self.last_mrsp(task) != Some(id) {
                    return Err(Status::IncorrectState);
                }
                self.surrender(id, task);
                Ok(())
            }
        }
    }

    /// Most recently obtained MrsP mutex of `task`.
    fn last_mrsp(&self, task: TaskId) -> Option<SemaphoreId> {
        let tcb = self.tasks.get(task)?;
        tcb.owned.iter().rev().copied().find(|id| {
            self.semaphores.get(*id).and_then(Semaphore::protocol) == Some(Protocol::MrsP)
        })
    }

    /// Gives up ownership and hands the mutex to the next waiter.
    pub(crate) fn surrender(&mut self, id: SemaphoreId, owner: TaskId) {
        if let Some(tcb) = self.tasks.get_mut(owner) {
            tcb.owned.retain(|owned| *owned != id);
        }
        if let Some(mutex) = self.semaphores.get_mut(id).and_then(Semaphore::mutex_mut) {
            mutex.owner = None;
            mutex.nest = 0;
            mutex.applied = None;
        }
        self.update_task(owner);
        self.trace_pair(mutex::RELEASE, owner, id.object_id().raw());

        let object = WaitObject::Semaphore(id);
        if let Some(next) = self.first_waiter(object) {
            let home = self.tasks.get(next).map(|t| t.home);
            let applied = home.and_then(|home| self.ceiling_for(id, home));
            if let Some(mutex) = self.semaphores.get_mut(id).and_then(Semaphore::mutex_mut) {
                mutex.owner = Some(next);
                mutex.nest = 1;
                mutex.applied = applied;
            }
            if let Some(tcb) = self.tasks.get_mut(next) {
                tcb.owned.push(id);
            }
            self.unblock(next, Ok(WaitValue::Unit));
            self.trace_pair(mutex::HANDOVER, next, id.object_id().raw());
        }
    }

    pub(crate) fn semaphore_flush(&mut self, _caller: Caller, id: SemaphoreId) -> Result<usize> {
        let semaphore = self.semaphores.get(id).ok_or(Status::InvalidId)?;
        if semaphore.protocol() == Some(Protocol::MrsP) {
            return Err(Status::NotDefined);
        }
        Ok(self.flush_waiters(WaitObject::Semaphore(id), Status::Unsatisfied))
    }

    pub(crate) fn semaphore_delete(&mut self, caller: Caller, id: SemaphoreId) -> Result<()> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        let semaphore = self.semaphores.get(id).ok_or(Status::InvalidId)?;
        if semaphore.owner().is_some() {
            return Err(Status::ResourceInUse);
        }
        self.flush_waiters(WaitObject::Semaphore(id), Status::ObjectWasDeleted);
        self.semaphores.remove(id);
        log::debug!("deleted semaphore {id}");
        Ok(())
    }

    /// Reads and optionally changes the ceiling of a mutex for one instance.
    /// The current owner keeps the ceiling it acquired with until it releases.
    pub(crate) fn semaphore_set_priority(
        &mut self,
        id: SemaphoreId,
        scheduler: SchedulerId,
        new: Option<Priority>,
    ) -> Result<Priority> {
        let max = self.instance(scheduler)?.max_priority;
        let semaphore = self.semaphores.get_mut(id).ok_or(Status::InvalidId)?;
        if let Some(priority) = new {
            if !priority.is_valid_for(max) {
                return Err(Status::InvalidPriority);
            }
        }
        let mutex = semaphore
            .mutex_mut()
            .filter(|m| m.protocol.uses_ceiling())
            .ok_or(Status::NotDefined)?;
        let slot = mutex
            .ceilings
            .get_mut(scheduler.index())
            .ok_or(Status::InvalidId)?;
        let old = slot.ok_or(Status::NotDefined)?;
        if let Some(priority) = new {
            *slot = Some(priority);
        }
        Ok(old)
    }

    /// Home instance of the calling task, or the first instance.
    pub(crate) fn caller_home(&self, caller: Caller) -> SchedulerId {
        caller
            .task()
            .and_then(|task| self.tasks.get(task))
            .map(|tcb| tcb.home)
            .unwrap_or(SchedulerId(0))
    }
}
