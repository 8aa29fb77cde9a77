//! Rate-monotonic periods.
//!
//! A period belongs to the task that created it. The owner calls
//! [`State::period_period`] once per job: the first call starts the period,
//! later calls block until the current period ends and then start the next
//! one. A period that ends while the owner is still working is marked
//! expired; the owner's next call reports `Timeout` and starts the new period
//! from that moment.

use crate::config::SchedulerPolicy;
use crate::context::Caller;
use crate::kernel::State;
use crate::object::{PeriodId, TaskId};
use crate::status::{Result, Status};
use crate::task::WaitObject;
use crate::threadq::Timeout;
use crate::watchdog::{WatchdogEvent, WatchdogKey};

/// Phase of a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PeriodState {
    Inactive,
    Active,
    Expired,
}

/// Observable state and statistics of a period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodStatus {
    pub owner: TaskId,
    pub state: PeriodState,
    pub length: u64,
    /// Ticks left in the current period.
    pub remaining: Option<u64>,
    /// Periods started.
    pub count: u64,
    /// Periods that ended before the owner asked for the next one.
    pub missed: u64,
}

pub(crate) struct Period {
    name: String,
    owner: TaskId,
    state: PeriodState,
    length: u64,
    timer: Option<WatchdogKey>,
    count: u64,
    missed: u64,
}

impl State {
    pub(crate) fn period_create(&mut self, caller: Caller, name: &str) -> Result<PeriodId> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        if name.is_empty() {
            return Err(Status::InvalidName);
        }
        let owner = caller.task().ok_or(Status::IncorrectState)?;
        let id = self.periods.insert_with(|_| Period {
            name: name.to_string(),
            owner,
            state: PeriodState::Inactive,
            length: 0,
            timer: None,
            count: 0,
            missed: 0,
        })?;
        log::debug!("created period {id} {name:?} owned by {owner}");
        Ok(id)
    }

    pub(crate) fn period_ident(&self, name: &str) -> Result<PeriodId> {
        self.periods
            .ids()
            .into_iter()
            .find(|id| self.periods.get(*id).is_some_and(|p| p.name == name))
            .ok_or(Status::InvalidName)
    }

    /// Starts, continues or, with `ticks == 0`, queries the period.
    pub(crate) fn period_period(&mut self, caller: Caller, id: PeriodId, ticks: u64) -> Result<()> {
        let object = WaitObject::Period(id);
        if let Some(outcome) = self.resume_outcome(caller, object) {
            return outcome.map(drop);
        }
        self.ensure_not_blocked(caller)?;
        let period = self.periods.get_mut(id).ok_or(Status::InvalidId)?;
        if caller.task() != Some(period.owner) {
            return Err(Status::NotOwnerOfResource);
        }
        if ticks == 0 {
            return match period.state {
                PeriodState::Inactive => Err(Status::NotDefined),
                PeriodState::Active => Ok(()),
                PeriodState::Expired => Err(Status::Timeout),
            };
        }
        match period.state {
            PeriodState::Inactive => {
                self.start_period(id, ticks);
                Ok(())
            }
            PeriodState::Active => {
                period.length = ticks;
                self.wait_for(caller, object, Timeout::Forever, false)
            }
            PeriodState::Expired => {
                log::debug!("{id} missed its deadline");
                self.start_period(id, ticks);
                Err(Status::Timeout)
            }
        }
    }

    fn start_period(&mut self, id: PeriodId, ticks: u64) {
        let key = self.watchdogs.insert(ticks, WatchdogEvent::PeriodEnd { period: id });
        let Some(period) = self.periods.get_mut(id) else {
            return;
        };
        if let Some(old) = period.timer.replace(key) {
            self.watchdogs.remove(old);
        }
        period.state = PeriodState::Active;
        period.length = ticks;
        period.count += 1;
        let owner = period.owner;
        self.trace_watchdog_arm(owner, key.expire());
        self.set_job_deadline(owner, Some(key.expire()));
    }

    /// Watchdog expiry at the end of the current period.
    pub(crate) fn period_end(&mut self, id: PeriodId) {
        let Some(period) = self.periods.get_mut(id) else {
            return;
        };
        period.timer = None;
        let owner = period.owner;
        let length = period.length;
        let waiting = self
            .tasks
            .get(owner)
            .is_some_and(|t| t.wait.object == Some(WaitObject::Period(id)));
        if waiting {
            self.start_period(id, length);
            self.unblock(owner, Ok(crate::task::WaitValue::Unit));
        } else {
            period.state = PeriodState::Expired;
            period.missed += 1;
        }
    }

    pub(crate) fn period_cancel(&mut self, caller: Caller, id: PeriodId) -> Result<()> {
        let period = self.periods.get_mut(id).ok_or(Status::InvalidId)?;
        if caller.task() != Some(period.owner) {
            return Err(Status::NotOwnerOfResource);
        }
        self.stop_period(id);
        Ok(())
    }

    fn stop_period(&mut self, id: PeriodId) {
        let Some(period) = self.periods.get_mut(id) else {
            return;
        };
        period.state = PeriodState::Inactive;
        let owner = period.owner;
        if let Some(key) = period.timer.take() {
            self.watchdogs.remove(key);
        }
        self.set_job_deadline(owner, None);
    }

    pub(crate) fn period_delete(&mut self, caller: Caller, id: PeriodId) -> Result<()> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        if !self.periods.contains(id) {
            return Err(Status::InvalidId);
        }
        self.stop_period(id);
        if let Some(period) = self.periods.remove(id) {
            let waiting = self
                .tasks
                .get(period.owner)
                .is_some_and(|t| t.wait.object == Some(WaitObject::Period(id)));
            if waiting {
                self.unblock(period.owner, Err(Status::ObjectWasDeleted));
            }
        }
        log::debug!("deleted period {id}");
        Ok(())
    }

    pub(crate) fn period_status(&self, id: PeriodId) -> Result<PeriodStatus> {
        let period = self.periods.get(id).ok_or(Status::InvalidId)?;
        Ok(PeriodStatus {
            owner: period.owner,
            state: period.state,
            length: period.length,
            remaining: period.timer.and_then(|key| self.watchdogs.remaining(key)),
            count: period.count,
            missed: period.missed,
        })
    }

    /// Stops every period of a terminating task.
    pub(crate) fn stop_periods_of(&mut self, task: TaskId) {
        let owned: Vec<_> = self
            .periods
            .ids()
            .into_iter()
            .filter(|id| self.periods.get(*id).is_some_and(|p| p.owner == task))
            .collect();
        for id in owned {
            self.stop_period(id);
        }
    }

    /// EDF instances schedule the owner by the end of its current period.
    fn set_job_deadline(&mut self, task: TaskId, deadline: Option<u64>) {
        let Some(tcb) = self.tasks.get(task) else {
            return;
        };
        let edf = self
            .schedulers
            .get(tcb.home.index())
            .is_some_and(|s| s.policy == SchedulerPolicy::Edf);
        if !edf {
            return;
        }
        if let Some(tcb) = self.tasks.get_mut(task) {
            tcb.deadline = deadline;
        }
        self.update_task(task);
    }
}
