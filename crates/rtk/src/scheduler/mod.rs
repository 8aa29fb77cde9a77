//! SMP scheduler: scheduler instances, processors and ready membership.
//!
//! Each online processor belongs to exactly one scheduler instance. A task has
//! a home instance whose ready structure it joins while it is schedulable;
//! [`smp`] turns the ready structures into one heir per processor.

use core::fmt;

use rts::records::sched;

use crate::config::{SchedulerConfig, SchedulerPolicy};
use crate::context::Caller;
use crate::cpuset::{CpuIndex, CpuSet};
use crate::kernel::State;
use crate::object::TaskId;
use crate::priority::Priority;
use crate::status::{Result, Status};
use crate::task::{ReadyKey, WaitObject};

mod ready;
pub(crate) mod smp;

pub(crate) use ready::ReadyQueue;

/// Index of a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SchedulerId(pub(crate) u8);

impl SchedulerId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scheduler#{}", self.0)
    }
}

pub(crate) struct SchedulerInstance {
    pub(crate) name: String,
    pub(crate) policy: SchedulerPolicy,
    /// Online processors owned by this instance.
    pub(crate) processors: CpuSet,
    pub(crate) max_priority: Priority,
    pub(crate) ready: ReadyQueue,
}

impl SchedulerInstance {
    pub(crate) fn new(config: &SchedulerConfig) -> Self {
        Self {
            name: config.name.clone(),
            policy: config.policy,
            processors: config.processors,
            max_priority: config.max_priority,
            ready: ReadyQueue::new(config.policy),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Processor {
    /// Owning instance; `None` while offline.
    pub(crate) scheduler: Option<SchedulerId>,
    /// Task the last dispatch switched to.
    pub(crate) executing: Option<TaskId>,
    /// Task the last allocation picked.
    pub(crate) heir: Option<TaskId>,
}

impl State {
    pub(crate) fn instance(&self, id: SchedulerId) -> Result<&SchedulerInstance> {
        self.schedulers.get(id.index()).ok_or(Status::InvalidId)
    }

    /// Recomputes the priority of `task`, refreshes its ready membership and
    /// carries a change along the chain of inheritance mutex owners.
    pub(crate) fn update_task(&mut self, task: TaskId) {
        let mut next = Some(task);
        let mut budget = self.tasks.len() + 1;
        while let Some(task) = next.take() {
            if budget == 0 {
                break;
            }
            budget -= 1;
            let changed = self.recompute_priority(task);
            self.sync_ready(task);
            if changed {
                next = self.inheritance_owner(task);
            }
        }
    }

    /// Owner of the inheritance mutex `task` waits for.
    fn inheritance_owner(&self, task: TaskId) -> Option<TaskId> {
        let tcb = self.tasks.get(task)?;
        match tcb.wait.object {
            Some(WaitObject::Semaphore(id)) => {
                let semaphore = self.semaphores.get(id)?;
                semaphore
                    .protocol()
                    .filter(|p| p.inherits())
                    .and_then(|_| semaphore.owner())
            }
            _ => None,
        }
    }

    /// Puts `task` into or takes it out of its home ready structure according
    /// to its state and urgency.
    pub(crate) fn sync_ready(&mut self, task: TaskId) {
        let Some(tcb) = self.tasks.get(task) else {
            return;
        };
        let wanted = tcb.is_schedulable();
        let current = tcb.ready;
        let urgency = tcb.urgency;
        let home = tcb.home.index();

        match current {
            Some(key) if wanted && key.urgency == urgency => {}
            Some(key) => {
                self.schedulers[home].ready.remove(task, key);
                if let Some(tcb) = self.tasks.get_mut(task) {
                    tcb.ready = None;
                }
                if wanted {
                    self.make_ready(task);
                }
            }
            None if wanted => self.make_ready(task),
            None => {}
        }
    }

    fn make_ready(&mut self, task: TaskId) {
        let seq = self.next_seq();
        let Some(tcb) = self.tasks.get_mut(task) else {
            return;
        };
        let key = ReadyKey {
            urgency: tcb.urgency,
            seq,
        };
        tcb.ready = Some(key);
        let home = tcb.home.index();
        self.schedulers[home].ready.insert(task, key);
    }

    /// Moves `task` behind the other ready tasks of its urgency.
    pub(crate) fn requeue(&mut self, task: TaskId) {
        let Some(tcb) = self.tasks.get_mut(task) else {
            return;
        };
        let Some(key) = tcb.ready.take() else {
            return;
        };
        let home = tcb.home.index();
        self.schedulers[home].ready.remove(task, key);
        self.make_ready(task);
    }

    /// Takes `task` out of its home instance's ready structure so the home
    /// can change.
    pub(crate) fn leave_ready(&mut self, task: TaskId) {
        let Some(tcb) = self.tasks.get_mut(task) else {
            return;
        };
        if let Some(key) = tcb.ready.take() {
            let home = tcb.home.index();
            self.schedulers[home].ready.remove(task, key);
        }
    }

    pub(crate) fn scheduler_ident(&self, name: &str) -> Result<SchedulerId> {
        self.schedulers
            .iter()
            .position(|s| s.name == name)
            .map(|index| SchedulerId(index as u8))
            .ok_or(Status::InvalidName)
    }

    pub(crate) fn scheduler_of_processor(&self, cpu: CpuIndex) -> Result<SchedulerId> {
        let processor = self.processors.get(cpu).ok_or(Status::InvalidName)?;
        processor.scheduler.ok_or(Status::IncorrectState)
    }

    pub(crate) fn scheduler_processors(&self, id: SchedulerId) -> Result<CpuSet> {
        Ok(self.instance(id)?.processors)
    }

    pub(crate) fn scheduler_max_priority(&self, id: SchedulerId) -> Result<Priority> {
        Ok(self.instance(id)?.max_priority)
    }

    pub(crate) fn add_processor(&mut self, caller: Caller, id: SchedulerId, cpu: CpuIndex) -> Result<()> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        self.instance(id)?;
        let processor = self.processors.get_mut(cpu).ok_or(Status::InvalidNumber)?;
        if processor.scheduler.is_some() {
            return Err(Status::ResourceInUse);
        }
        processor.scheduler = Some(id);
        self.schedulers[id.index()].processors.insert(cpu);
        log::debug!("processor {cpu} added to {id}");
        Ok(())
    }

    pub(crate) fn remove_processor(&mut self, caller: Caller, id: SchedulerId, cpu: CpuIndex) -> Result<()> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        let instance = self.instance(id)?;
        if !instance.processors.contains(cpu) {
            return Err(Status::InvalidNumber);
        }
        let last = instance.processors.count() == 1;
        let homed = self
            .tasks
            .iter()
            .any(|t| t.home == id && !t.is_zombie());
        if last && homed {
            return Err(Status::ResourceInUse);
        }
        let busy = self.tasks.iter().any(|t| t.running_on == Some(cpu));
        if busy || caller.cpu() == Some(cpu) {
            return Err(Status::ResourceInUse);
        }
        self.schedulers[id.index()].processors.remove(cpu);
        let processor = &mut self.processors[cpu];
        processor.scheduler = None;
        processor.executing = None;
        processor.heir = None;
        self.trace_raw(sched::IDLE, vec![cpu as u8]);
        log::debug!("processor {cpu} removed from {id}");
        Ok(())
    }
}
