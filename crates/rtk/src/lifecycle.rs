//! Task manager and the life-cycle engine.
//!
//! Life changes (termination and restart) requested against a task that
//! cannot take them right away are recorded in its [`LifeState`] and carried
//! out at the next safe point: when the task drops thread-life protection,
//! when its current step ends, or when it is dispatched next.
//!
//! Deletion by another task:
//!
//! ```text
//! dormant            -> zombie now, delete extensions only
//! protected          -> TERMINATING, deferred until protection drops
//! mid-step elsewhere -> TERMINATING, caller joins until the step ends
//! otherwise          -> leave queue, disarm watchdog, terminate now
//! ```

use rts::records::{sched, task as records};

use crate::context::Caller;
use crate::cpuset::CpuSet;
use crate::kernel::{State, Unwind};
use crate::object::TaskId;
use crate::priority::Priority;
use crate::scheduler::SchedulerId;
use crate::status::{Fatal, InternalError, Result, Status};
use crate::task::{LifeState, Mode, ModeMask, TaskBody, TaskConfig, TaskSnapshot, TaskState, Tcb, WaitObject, WaitValue};
use crate::threadq::Timeout;

/// Life change carried out at a safe point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifeChange {
    Terminated,
    Restarted,
}

impl State {
    /// Live (non-zombie) task.
    pub(crate) fn live_task(&self, id: TaskId) -> Result<&Tcb> {
        self.tasks
            .get(id)
            .filter(|tcb| !tcb.is_zombie())
            .ok_or(Status::InvalidId)
    }

    fn live_task_mut(&mut self, id: TaskId) -> Result<&mut Tcb> {
        self.tasks
            .get_mut(id)
            .filter(|tcb| !tcb.is_zombie())
            .ok_or(Status::InvalidId)
    }

    fn calling_task(&self, caller: Caller) -> Result<TaskId> {
        match caller {
            Caller::Task { id, .. } => Ok(id),
            Caller::Isr { .. } => Err(Status::CalledFromIsr),
            Caller::Init => Err(Status::IncorrectState),
        }
    }

    pub(crate) fn task_create(&mut self, caller: Caller, config: &TaskConfig) -> Result<TaskId> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        if config.name.is_empty() {
            return Err(Status::InvalidName);
        }
        let home = config.scheduler.unwrap_or_else(|| self.caller_home(caller));
        let instance = self.instance(home)?;
        if !config.priority.is_valid_for(instance.max_priority) {
            return Err(Status::InvalidPriority);
        }
        let affinity = config
            .affinity
            .unwrap_or_else(|| CpuSet::first_n(self.processors.len()));
        if !affinity.intersects(instance.processors) && !instance.processors.is_empty() {
            return Err(Status::InvalidNumber);
        }
        if !config.modes.is_preemptible() && instance.processors.count() > 1 {
            return Err(Status::NotImplemented);
        }

        let mut created = self
            .tasks
            .insert_with(|id| Tcb::new(id, config, home, affinity));
        if created == Err(Status::TooMany) && self.reclaim_zombies() > 0 {
            created = self
                .tasks
                .insert_with(|id| Tcb::new(id, config, home, affinity));
        }
        let id = created?;
        log::debug!("created {id} {:?} priority {} on {home}", config.name, config.priority);
        self.trace_task(records::CREATE, id);
        Ok(id)
    }

    pub(crate) fn task_start(&mut self, id: TaskId, body: TaskBody, argument: usize) -> Result<()> {
        let tcb = self.live_task_mut(id)?;
        if !tcb.is_dormant() {
            return Err(Status::IncorrectState);
        }
        tcb.state.remove(TaskState::DORMANT);
        tcb.body = Some(body);
        tcb.argument = argument;
        tcb.iteration = 0;
        self.update_task(id);
        log::debug!("started {id}");
        self.trace_task(records::START, id);
        Ok(())
    }

    pub(crate) fn task_ident(&self, name: &str) -> Result<TaskId> {
        self.tasks
            .iter()
            .find(|tcb| !tcb.is_zombie() && tcb.name == name)
            .map(|tcb| tcb.id)
            .ok_or(Status::InvalidName)
    }

    pub(crate) fn task_snapshot(&self, id: TaskId) -> Result<TaskSnapshot> {
        self.tasks.get(id).map(Tcb::snapshot).ok_or(Status::InvalidId)
    }

    pub(crate) fn task_delete(&mut self, caller: Caller, target: TaskId) -> Result<()> {
        let join = WaitObject::Join(target);
        if let Some(outcome) = self.resume_outcome(caller, join) {
            return outcome.map(drop);
        }
        let tcb = self.live_task(target)?;
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        let dormant = tcb.is_dormant();
        let target_priority = tcb.priority;
        let (executing, disabled, caller_priority) = match caller {
            Caller::Task { id, .. } => {
                let me = self.live_task(id)?;
                (Some(id), me.dispatch_disable > 0, Some(me.priority))
            }
            _ => (None, false, None),
        };

        if executing == Some(target) {
            return self.terminate_self(target);
        }

        let tcb = self.live_task_mut(target)?;
        tcb.life.insert(LifeState::TERMINATING);
        if dormant {
            self.terminate(target, executing);
            return Ok(());
        }
        if let Some(priority) = caller_priority.filter(|p| *p > target_priority) {
            tcb.boost = Some(priority);
        }
        tcb.state.remove(TaskState::SUSPENDED);
        let protected = tcb.is_protected();
        let running = tcb.running_on.is_some();
        self.update_task(target);

        if protected {
            log::debug!("{target} is protected, termination deferred");
            self.trace_task(records::DEFER, target);
        } else {
            self.extract(target);
        }
        if disabled {
            return Err(self.raise_fatal(Fatal::internal(InternalError::BadThreadDispatchDisableLevel)));
        }
        if protected {
            return Ok(());
        }
        if running {
            if caller.task().is_some() {
                return self.wait_for(caller, join, Timeout::Forever, false);
            }
            return Ok(());
        }
        self.terminate(target, executing);
        Ok(())
    }

    /// Self deletion and exit. Never returns to the calling step.
    fn terminate_self(&mut self, task: TaskId) -> Result<()> {
        let tcb = self.live_task_mut(task)?;
        tcb.life.insert(LifeState::TERMINATING);
        if tcb.dispatch_disable > 0 {
            return Err(self.raise_fatal(Fatal::internal(InternalError::BadThreadDispatchDisableLevel)));
        }
        if !tcb.state.contains(TaskState::SUSPENDED) {
            self.terminate(task, Some(task));
        }
        self.effects.unwind = Some(Unwind::Exit);
        Err(Status::WouldBlock)
    }

    pub(crate) fn task_exit(&mut self, caller: Caller) -> Result<()> {
        let task = self.calling_task(caller)?;
        self.terminate_self(task)
    }

    /// Turns `task` into a zombie.
    pub(crate) fn terminate(&mut self, task: TaskId, executing: Option<TaskId>) {
        let Some(tcb) = self.tasks.get_mut(task) else {
            return;
        };
        let dormant = tcb.is_dormant();
        tcb.life.insert(LifeState::TERMINATING | LifeState::PROTECTED);
        if !dormant {
            self.queue_terminate_extensions(task);
        }
        self.extract(task);
        self.release_all_owned(task);
        self.stop_periods_of(task);

        if let Some(tcb) = self.tasks.get_mut(task) {
            if dormant {
                tcb.state.remove(TaskState::BLOCKED);
            } else {
                tcb.state.remove(TaskState::SUSPENDED | TaskState::BLOCKED);
            }
            tcb.state.insert(TaskState::ZOMBIE);
            tcb.body = None;
            tcb.boost = None;
            tcb.deadline = None;
            tcb.signals = Default::default();
        }
        self.update_task(task);
        while self.dequeue_first(WaitObject::Join(task), Ok(WaitValue::Unit)).is_some() {}
        self.zombies.push(task);
        self.queue_delete_extensions(executing, task);
        log::debug!("{task} terminated");
        self.trace_task(records::DELETE, task);
    }

    fn release_all_owned(&mut self, task: TaskId) {
        let owned = self
            .tasks
            .get(task)
            .map(|tcb| tcb.owned.clone())
            .unwrap_or_default();
        for id in owned.into_iter().rev() {
            self.surrender(id, task);
        }
    }

    pub(crate) fn task_restart(&mut self, caller: Caller, target: TaskId, argument: usize) -> Result<()> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        let tcb = self.live_task_mut(target)?;
        if tcb.is_dormant() || tcb.life.contains(LifeState::TERMINATING) {
            return Err(Status::IncorrectState);
        }
        let executing = caller.task();
        if executing == Some(target) {
            if tcb.dispatch_disable > 0 {
                return Err(self.raise_fatal(Fatal::internal(InternalError::BadThreadDispatchDisableLevel)));
            }
            tcb.argument = argument;
            self.restart(target, executing);
            self.effects.unwind = Some(Unwind::Exit);
            return Err(Status::WouldBlock);
        }

        tcb.argument = argument;
        tcb.life.insert(LifeState::RESTARTING);
        if tcb.is_protected() || tcb.running_on.is_some() {
            log::debug!("restart of {target} deferred");
            self.trace_task(records::DEFER, target);
            return Ok(());
        }
        self.restart(target, executing);
        Ok(())
    }

    /// Puts `task` back to the start of its body with its initial settings.
    pub(crate) fn restart(&mut self, task: TaskId, executing: Option<TaskId>) {
        self.extract(task);
        self.release_all_owned(task);
        let Some(tcb) = self.tasks.get_mut(task) else {
            return;
        };
        tcb.life.remove(LifeState::RESTARTING | LifeState::PROTECTED);
        tcb.state.remove(TaskState::SUSPENDED | TaskState::BLOCKED);
        tcb.real_priority = tcb.initial_priority;
        tcb.modes = tcb.initial_modes;
        tcb.boost = None;
        tcb.iteration = 0;
        tcb.dispatch_disable = 0;
        tcb.timeslice = 0;
        tcb.signals = Default::default();
        self.update_task(task);
        self.queue_restart_extensions(executing, task);
        log::debug!("{task} restarted");
        self.trace_task(records::RESTART, task);
    }

    /// Carries out a pending life change if `task` is no longer protected.
    pub(crate) fn apply_life_change(&mut self, task: TaskId) -> Option<LifeChange> {
        let tcb = self.tasks.get(task)?;
        if tcb.is_zombie() || tcb.is_protected() || tcb.running_on.is_some() {
            return None;
        }
        if tcb.life.contains(LifeState::TERMINATING) {
            if tcb.state.contains(TaskState::SUSPENDED) {
                return None;
            }
            self.terminate(task, Some(task));
            Some(LifeChange::Terminated)
        } else if tcb.life.contains(LifeState::RESTARTING) {
            self.restart(task, Some(task));
            Some(LifeChange::Restarted)
        } else {
            None
        }
    }

    pub(crate) fn task_suspend(&mut self, target: TaskId) -> Result<()> {
        let tcb = self.live_task_mut(target)?;
        if tcb.state.contains(TaskState::SUSPENDED) {
            return Err(Status::AlreadySuspended);
        }
        tcb.state.insert(TaskState::SUSPENDED);
        self.update_task(target);
        self.trace_task(records::SUSPEND, target);
        Ok(())
    }

    pub(crate) fn task_resume(&mut self, target: TaskId) -> Result<()> {
        let tcb = self.live_task_mut(target)?;
        if !tcb.state.contains(TaskState::SUSPENDED) {
            return Err(Status::IncorrectState);
        }
        tcb.state.remove(TaskState::SUSPENDED);
        self.update_task(target);
        self.trace_task(records::RESUME, target);
        Ok(())
    }

    pub(crate) fn task_is_suspended(&self, target: TaskId) -> Result<bool> {
        Ok(self.live_task(target)?.state.contains(TaskState::SUSPENDED))
    }

    /// Effective priority of `target` in the instance `scheduler`.
    pub(crate) fn task_get_priority(&self, target: TaskId, scheduler: SchedulerId) -> Result<Priority> {
        self.instance(scheduler)?;
        let tcb = self.live_task(target)?;
        if tcb.home != scheduler {
            return Err(Status::NotDefined);
        }
        Ok(tcb.priority)
    }

    /// Changes the real priority when `new` is given. Returns the old one.
    pub(crate) fn task_set_priority(&mut self, target: TaskId, new: Option<Priority>) -> Result<Priority> {
        let tcb = self.live_task(target)?;
        let max = self.instance(tcb.home)?.max_priority;
        let old = tcb.real_priority;
        let Some(priority) = new else {
            return Ok(old);
        };
        if !priority.is_valid_for(max) {
            return Err(Status::InvalidPriority);
        }
        self.live_task_mut(target)?.real_priority = priority;
        self.update_task(target);
        self.trace_pair(records::PRIORITY, target, u32::from(priority.get()));
        Ok(old)
    }

    /// Moves `target` to another home instance.
    pub(crate) fn task_set_scheduler(
        &mut self,
        target: TaskId,
        scheduler: SchedulerId,
        priority: Priority,
    ) -> Result<()> {
        let instance = self.instance(scheduler)?;
        let (max, processors) = (instance.max_priority, instance.processors);
        let tcb = self.live_task(target)?;
        if !priority.is_valid_for(max) {
            return Err(Status::InvalidPriority);
        }
        let enqueued = tcb.wait.object.is_some_and(|object| object.is_enqueued());
        if !tcb.owned.is_empty() || enqueued {
            return Err(Status::ResourceInUse);
        }
        if !tcb.affinity.intersects(processors) {
            return Err(Status::InvalidNumber);
        }
        self.leave_ready(target);
        let tcb = self.live_task_mut(target)?;
        tcb.home = scheduler;
        tcb.real_priority = priority;
        tcb.deadline = None;
        self.update_task(target);
        log::debug!("{target} moved to {scheduler}");
        Ok(())
    }

    pub(crate) fn set_affinity(&mut self, _caller: Caller, target: TaskId, affinity: CpuSet) -> Result<()> {
        let tcb = self.live_task(target)?;
        let processors = self.instance(tcb.home)?.processors;
        if !affinity.intersects(processors) {
            return Err(Status::InvalidNumber);
        }
        self.live_task_mut(target)?.affinity = affinity;
        Ok(())
    }

    pub(crate) fn get_affinity(&self, target: TaskId) -> Result<CpuSet> {
        Ok(self.live_task(target)?.affinity)
    }

    /// Changes the caller's execution mode. Returns the previous mode.
    pub(crate) fn task_mode(&mut self, caller: Caller, new: Mode, mask: ModeMask) -> Result<Mode> {
        let task = self.calling_task(caller)?;
        let tcb = self.live_task(task)?;
        let processors = self.instance(tcb.home)?.processors.count();
        if mask.contains(ModeMask::PREEMPT) && !new.is_preemptible() && processors > 1 {
            return Err(Status::NotImplemented);
        }
        if mask.contains(ModeMask::INTERRUPT) && new.level() != 0 && self.processors.len() > 1 {
            return Err(Status::NotImplemented);
        }
        let tcb = self.live_task_mut(task)?;
        let previous = tcb.modes;
        tcb.modes = previous.apply(new, mask);
        if !previous.contains(Mode::TIMESLICE) && tcb.modes.contains(Mode::TIMESLICE) {
            tcb.timeslice = 0;
        }
        Ok(previous)
    }

    /// Sleeps for `ticks`; zero yields to ready tasks of equal priority.
    pub(crate) fn task_wake_after(&mut self, caller: Caller, ticks: u64) -> Result<()> {
        if let Some(outcome) = self.resume_outcome(caller, WaitObject::Sleep) {
            return outcome.map(drop);
        }
        let task = self.calling_task(caller)?;
        self.ensure_not_blocked(caller)?;
        if ticks == 0 {
            self.requeue(task);
            return Ok(());
        }
        self.wait_for(caller, WaitObject::Sleep, Timeout::Ticks(ticks), false)
    }

    /// Sets or clears thread-life protection. Returns the previous setting.
    /// Clearing it carries out a deferred delete or restart right away.
    pub(crate) fn task_set_protection(&mut self, caller: Caller, protect: bool) -> Result<bool> {
        let task = self.calling_task(caller)?;
        let tcb = self.live_task_mut(task)?;
        let previous = tcb.is_protected();
        if protect {
            tcb.life.insert(LifeState::PROTECTED);
            return Ok(previous);
        }
        tcb.life.remove(LifeState::PROTECTED);
        if !tcb.life.intersects(LifeState::TERMINATING | LifeState::RESTARTING) {
            return Ok(previous);
        }
        if tcb.dispatch_disable > 0 {
            return Err(self.raise_fatal(Fatal::internal(InternalError::BadThreadDispatchDisableLevel)));
        }
        if tcb.life.contains(LifeState::TERMINATING) {
            self.terminate(task, Some(task));
        } else {
            self.restart(task, Some(task));
        }
        self.effects.unwind = Some(Unwind::Exit);
        Ok(previous)
    }

    pub(crate) fn dispatch_disable(&mut self, caller: Caller) -> Result<u32> {
        let task = self.calling_task(caller)?;
        let tcb = self.live_task_mut(task)?;
        tcb.dispatch_disable += 1;
        let level = tcb.dispatch_disable;
        self.trace_task(sched::LOCK, task);
        Ok(level)
    }

    pub(crate) fn dispatch_enable(&mut self, caller: Caller) -> Result<u32> {
        let task = self.calling_task(caller)?;
        let tcb = self.live_task_mut(task)?;
        if tcb.dispatch_disable == 0 {
            return Err(Status::IncorrectState);
        }
        tcb.dispatch_disable -= 1;
        let level = tcb.dispatch_disable;
        self.trace_task(sched::UNLOCK, task);
        Ok(level)
    }

    /// Frees the slots of zombies that no processor refers to any more.
    pub(crate) fn reclaim_zombies(&mut self) -> usize {
        let zombies = std::mem::take(&mut self.zombies);
        let mut reclaimed = 0;
        for task in zombies {
            let busy = self.tasks.get(task).is_some_and(|t| t.running_on.is_some())
                || self.processors.iter().any(|p| p.executing == Some(task));
            if busy {
                self.zombies.push(task);
                continue;
            }
            if self.tasks.remove(task).is_some() {
                reclaimed += 1;
                self.trace_task(records::RECLAIM, task);
            }
        }
        reclaimed
    }
}
