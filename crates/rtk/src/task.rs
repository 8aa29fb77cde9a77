//! Task control blocks and the task-facing value types.

use bitflags::bitflags;

use crate::context::Context;
use crate::cpuset::{CpuIndex, CpuSet};
use crate::object::{BarrierId, MessageQueueId, PeriodId, SemaphoreId, TaskId};
use crate::priority::{Priority, Urgency};
use crate::scheduler::SchedulerId;
use crate::signal::SignalState;
use crate::status::Status;
use crate::threadq::{Discipline, ThreadQueue};
use crate::watchdog::WatchdogKey;

bitflags! {
    /// Current state of a task. Empty means ready (or executing).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct TaskState: u32 {
        const DORMANT = 1 << 0;
        const SUSPENDED = 1 << 1;
        const BLOCKED = 1 << 2;
        const ZOMBIE = 1 << 3;
    }
}

bitflags! {
    /// Thread-life state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct LifeState: u32 {
        /// Life changes requested by others are deferred.
        const PROTECTED = 1 << 0;
        const RESTARTING = 1 << 1;
        const TERMINATING = 1 << 2;
    }
}

bitflags! {
    /// Execution mode. The defaults (preemptible, no timeslicing, ASR
    /// enabled, interrupt level 0) are the zero bits, so a default and a
    /// non-default option given together yield the non-default one.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Mode: u32 {
        const INTERRUPT_LEVEL = 0x00FF;
        const NO_PREEMPT = 0x0100;
        const TIMESLICE = 0x0200;
        const NO_ASR = 0x0400;
    }
}

impl Mode {
    pub const PREEMPT: Mode = Mode::empty();
    pub const NO_TIMESLICE: Mode = Mode::empty();
    pub const ASR: Mode = Mode::empty();
    pub const DEFAULT: Mode = Mode::empty();

    pub fn interrupt_level(level: u8) -> Mode {
        Mode::from_bits_retain(u32::from(level))
    }

    pub fn level(self) -> u8 {
        (self.bits() & Self::INTERRUPT_LEVEL.bits()) as u8
    }

    pub fn is_preemptible(self) -> bool {
        !self.contains(Mode::NO_PREEMPT)
    }

    pub fn asr_enabled(self) -> bool {
        !self.contains(Mode::NO_ASR)
    }

    pub(crate) fn apply(self, new: Mode, mask: ModeMask) -> Mode {
        let mask = Mode::from_bits_retain(mask.bits());
        (self & !mask) | (new & mask)
    }
}

bitflags! {
    /// Selects which fields of [`Mode`] a mode change touches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModeMask: u32 {
        const INTERRUPT = 0x00FF;
        const PREEMPT = 0x0100;
        const TIMESLICE = 0x0200;
        const ASR = 0x0400;
        const ALL = 0x07FF;
    }
}

/// What a task body asks the dispatcher to do after one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    /// Stay ready; the next dispatch runs another step.
    Continue,
    /// Give the processor to the next ready task of equal priority.
    Yield,
    /// A directive returned [`Status::WouldBlock`].
    Blocked,
    /// Terminate the task, as if it deleted itself.
    Exit,
}

/// Entry point of a task, run one step per dispatch.
pub type TaskBody = Box<dyn FnMut(&mut Context<'_>) -> TaskAction + Send>;

/// Parameters of a new task.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub name: String,
    pub priority: Priority,
    /// Home scheduler; defaults to the creator's, or the first instance.
    pub scheduler: Option<SchedulerId>,
    pub affinity: Option<CpuSet>,
    pub modes: Mode,
}

impl TaskConfig {
    pub fn new(name: impl Into<String>, priority: Priority) -> Self {
        Self {
            name: name.into(),
            priority,
            scheduler: None,
            affinity: None,
            modes: Mode::DEFAULT,
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerId) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_affinity(mut self, affinity: CpuSet) -> Self {
        self.affinity = Some(affinity);
        self
    }

    pub fn with_modes(mut self, modes: Mode) -> Self {
        self.modes = modes;
        self
    }
}

/// Object a blocked task waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitObject {
    Semaphore(SemaphoreId),
    Barrier(BarrierId),
    MessageQueue(MessageQueueId),
    /// Waiting for another task to finish terminating.
    Join(TaskId),
    /// Waiting for the end of the current period.
    Period(PeriodId),
    Sleep,
}

impl WaitObject {
    /// Whether the wait goes through a thread queue.
    pub fn is_enqueued(&self) -> bool {
        !matches!(self, WaitObject::Period(_) | WaitObject::Sleep)
    }
}

/// Blocking state as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedState {
    Ready,
    Enqueued(WaitObject),
    Plain(WaitObject),
}

/// Value delivered to a task when its wait completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WaitValue {
    Unit,
    Message(Vec<u8>),
}

pub(crate) type WaitOutcome = Result<WaitValue, Status>;

#[derive(Default)]
pub(crate) struct WaitRecord {
    /// Set while blocked.
    pub(crate) object: Option<WaitObject>,
    /// MrsP waiters keep their processor while they wait.
    pub(crate) sticky: bool,
    pub(crate) timer: Option<WatchdogKey>,
    /// Incremented per wait so that a late watchdog can recognize that the
    /// wait it belongs to is over.
    pub(crate) seq: u64,
    /// Enqueue order within the thread queue.
    pub(crate) queue_seq: u64,
    /// Outcome of the last finished wait, consumed by the repeated directive.
    pub(crate) outcome: Option<(WaitObject, WaitOutcome)>,
}

/// Position of a task inside its scheduler's ready structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadyKey {
    pub(crate) urgency: Urgency,
    pub(crate) seq: u64,
}

pub(crate) struct Tcb {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) state: TaskState,
    pub(crate) life: LifeState,
    pub(crate) initial_priority: Priority,
    pub(crate) initial_modes: Mode,
    pub(crate) real_priority: Priority,
    /// Effective static priority in the home instance.
    pub(crate) priority: Priority,
    pub(crate) urgency: Urgency,
    pub(crate) home: SchedulerId,
    pub(crate) affinity: CpuSet,
    /// Absolute deadline of the current job on an EDF instance.
    pub(crate) deadline: Option<u64>,
    /// Raise applied by a more urgent deleter.
    pub(crate) boost: Option<Priority>,
    /// Mutexes in acquisition order.
    pub(crate) owned: Vec<SemaphoreId>,
    pub(crate) modes: Mode,
    pub(crate) body: Option<TaskBody>,
    pub(crate) argument: usize,
    pub(crate) iteration: u64,
    /// Processor currently running a step of this task.
    pub(crate) running_on: Option<CpuIndex>,
    /// Processor this task is allocated to.
    pub(crate) cpu: Option<CpuIndex>,
    /// Allocated on a processor of another instance to help waiters.
    pub(crate) helping: Option<SchedulerId>,
    pub(crate) wait: WaitRecord,
    /// Tasks waiting for this one to finish terminating.
    pub(crate) join: ThreadQueue,
    pub(crate) dispatch_disable: u32,
    pub(crate) timeslice: u32,
    pub(crate) signals: SignalState,
    pub(crate) ready: Option<ReadyKey>,
}

impl Tcb {
    pub(crate) fn new(id: TaskId, config: &TaskConfig, home: SchedulerId, affinity: CpuSet) -> Self {
        Self {
            id,
            name: config.name.clone(),
            state: TaskState::DORMANT,
            life: LifeState::empty(),
            initial_priority: config.priority,
            initial_modes: config.modes,
            real_priority: config.priority,
            priority: config.priority,
            urgency: config.priority.urgency(),
            home,
            affinity,
            deadline: None,
            boost: None,
            owned: Vec::new(),
            modes: config.modes,
            body: None,
            argument: 0,
            iteration: 0,
            running_on: None,
            cpu: None,
            helping: None,
            wait: WaitRecord::default(),
            join: ThreadQueue::new(Discipline::Fifo),
            dispatch_disable: 0,
            timeslice: 0,
            signals: SignalState::default(),
            ready: None,
        }
    }

    pub(crate) fn is_dormant(&self) -> bool {
        self.state.contains(TaskState::DORMANT)
    }

    pub(crate) fn is_zombie(&self) -> bool {
        self.state.contains(TaskState::ZOMBIE)
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.state.contains(TaskState::BLOCKED)
    }

    /// Member of its instance's ready structure: able to use a processor.
    /// MrsP waiters stay members while they spin.
    pub(crate) fn is_schedulable(&self) -> bool {
        !self
            .state
            .intersects(TaskState::DORMANT | TaskState::SUSPENDED | TaskState::ZOMBIE)
            && (!self.is_blocked() || self.wait.sticky)
    }

    /// Runs body steps when allocated.
    pub(crate) fn is_runnable(&self) -> bool {
        self.is_schedulable() && !self.is_blocked()
    }

    /// Whether life changes requested by others must wait.
    pub(crate) fn is_protected(&self) -> bool {
        self.life.contains(LifeState::PROTECTED)
    }

    pub(crate) fn blocked_state(&self) -> BlockedState {
        match self.wait.object {
            None => BlockedState::Ready,
            Some(object) if object.is_enqueued() => BlockedState::Enqueued(object),
            Some(object) => BlockedState::Plain(object),
        }
    }

    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            life: self.life,
            real_priority: self.real_priority,
            priority: self.priority,
            scheduler: self.home,
            affinity: self.affinity,
            modes: self.modes,
            blocked: self.blocked_state(),
            timer_active: self.wait.timer.is_some(),
            iteration: self.iteration,
            argument: self.argument,
            cpu: self.cpu,
            helping: self.helping,
            owned: self.owned.clone(),
            dispatch_disable_level: self.dispatch_disable,
            deadline: self.deadline,
        }
    }
}

/// Copy of the observable state of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub life: LifeState,
    pub real_priority: Priority,
    pub priority: Priority,
    pub scheduler: SchedulerId,
    pub affinity: CpuSet,
    pub modes: Mode,
    pub blocked: BlockedState,
    pub timer_active: bool,
    pub iteration: u64,
    pub argument: usize,
    pub cpu: Option<CpuIndex>,
    /// Instance whose processor runs this task on behalf of a waiter.
    pub helping: Option<SchedulerId>,
    pub owned: Vec<SemaphoreId>,
    pub dispatch_disable_level: u32,
    pub deadline: Option<u64>,
}

impl TaskSnapshot {
    pub fn is_dormant(&self) -> bool {
        self.state.contains(TaskState::DORMANT)
    }

    pub fn is_suspended(&self) -> bool {
        self.state.contains(TaskState::SUSPENDED)
    }

    pub fn is_zombie(&self) -> bool {
        self.state.contains(TaskState::ZOMBIE)
    }

    pub fn is_terminating(&self) -> bool {
        self.life.contains(LifeState::TERMINATING)
    }

    pub fn is_restarting(&self) -> bool {
        self.life.contains(LifeState::RESTARTING)
    }

    pub fn is_protected(&self) -> bool {
        self.life.contains(LifeState::PROTECTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_default_mode_wins() {
        assert_eq!(Mode::PREEMPT | Mode::NO_PREEMPT, Mode::NO_PREEMPT);
        assert_eq!(Mode::NO_TIMESLICE | Mode::TIMESLICE, Mode::TIMESLICE);
        assert_eq!(Mode::ASR | Mode::NO_ASR, Mode::NO_ASR);
        assert_eq!((Mode::interrupt_level(0) | Mode::interrupt_level(3)).level(), 3);
    }

    #[test]
    fn mask_limits_the_change() {
        let current = Mode::TIMESLICE | Mode::NO_ASR;
        let changed = current.apply(Mode::NO_PREEMPT, ModeMask::PREEMPT | ModeMask::ASR);
        assert_eq!(changed, Mode::TIMESLICE | Mode::NO_PREEMPT);
        assert!(!changed.is_preemptible());
        assert!(changed.asr_enabled());
    }

    #[test]
    fn plain_and_enqueued_waits() {
        assert!(!WaitObject::Sleep.is_enqueued());
        assert!(!WaitObject::Period(period_id()).is_enqueued());
    }

    fn period_id() -> PeriodId {
        let mut arena: crate::object::Arena<PeriodId, ()> = crate::object::Arena::new(1);
        arena.insert_with(|_| ()).expect("period id")
    }
}
