//! Thread queues and the wait engine.
//!
//! Every synchronization object embeds one [`ThreadQueue`]. The engine below
//! is the only code that moves tasks in and out of queues, and it always
//! changes queue membership, the task's blocked state, its watchdog and its
//! ready-queue membership inside the same kernel critical section. A wait
//! ends exactly once: whichever of release, timeout or extraction runs first
//! clears the task's wait record, and the others find nothing to do.

use rts::records::tq;

use crate::context::Caller;
use crate::kernel::State;
use crate::object::TaskId;
use crate::status::{Fatal, InternalError, Result, Status};
use crate::task::{TaskState, WaitObject, WaitOutcome, WaitValue};
use crate::watchdog::WatchdogEvent;

/// Order in which a queue releases its waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Discipline {
    /// Arrival order.
    #[default]
    Fifo,
    /// Highest effective priority first, arrival order among equals.
    Priority,
}

/// How long a blocking directive may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeout {
    /// Fail with `Unsatisfied` instead of blocking.
    NoWait,
    Forever,
    /// Give up after this many ticks (at least one).
    Ticks(u64),
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    task: TaskId,
    seq: u64,
}

/// Blocked tasks of one object, kept in arrival order.
#[derive(Debug, Default)]
pub(crate) struct ThreadQueue {
    discipline: Discipline,
    waiters: Vec<Waiter>,
}

impl ThreadQueue {
    pub(crate) fn new(discipline: Discipline) -> Self {
        Self {
            discipline,
            waiters: Vec::new(),
        }
    }

    pub(crate) fn discipline(&self) -> Discipline {
        self.discipline
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn contains(&self, task: TaskId) -> bool {
        self.waiters.iter().any(|w| w.task == task)
    }

    pub(crate) fn tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.waiters.iter().map(|w| w.task)
    }

    fn push(&mut self, task: TaskId, seq: u64) {
        self.waiters.push(Waiter { task, seq });
    }

    fn remove(&mut self, task: TaskId) -> bool {
        match self.waiters.iter().position(|w| w.task == task) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }
}

impl State {
    pub(crate) fn queue(&self, object: WaitObject) -> Option<&ThreadQueue> {
        match object {
            WaitObject::Semaphore(id) => self.semaphores.get(id).map(|s| &s.queue),
            WaitObject::Barrier(id) => self.barriers.get(id).map(|b| &b.queue),
            WaitObject::MessageQueue(id) => self.message_queues.get(id).map(|q| &q.queue),
            WaitObject::Join(id) => self.tasks.get(id).map(|t| &t.join),
            WaitObject::Period(_) | WaitObject::Sleep => None,
        }
    }

    fn queue_mut(&mut self, object: WaitObject) -> Option<&mut ThreadQueue> {
        match object {
            WaitObject::Semaphore(id) => self.semaphores.get_mut(id).map(|s| &mut s.queue),
            WaitObject::Barrier(id) => self.barriers.get_mut(id).map(|b| &mut b.queue),
            WaitObject::MessageQueue(id) => {
                self.message_queues.get_mut(id).map(|q| &mut q.queue)
            }
            WaitObject::Join(id) => self.tasks.get_mut(id).map(|t| &mut t.join),
            WaitObject::Period(_) | WaitObject::Sleep => None,
        }
    }

    /// Blocks `task` on `object`. All directive checks are done by the caller.
    pub(crate) fn block(&mut self, task: TaskId, object: WaitObject, timeout: Timeout, sticky: bool) {
        let seq = self.next_seq();
        let Some(tcb) = self.tasks.get_mut(task) else {
            return;
        };
        tcb.wait.seq += 1;
        tcb.wait.object = Some(object);
        tcb.wait.sticky = sticky;
        tcb.wait.queue_seq = seq;
        tcb.wait.outcome = None;
        tcb.state.insert(TaskState::BLOCKED);
        let wait = tcb.wait.seq;

        if let Some(queue) = self.queue_mut(object) {
            queue.push(task, seq);
        }
        if let Timeout::Ticks(ticks) = timeout {
            let key = self
                .watchdogs
                .insert(ticks, WatchdogEvent::WaitTimeout { task, wait });
            if let Some(tcb) = self.tasks.get_mut(task) {
                tcb.wait.timer = Some(key);
            }
            self.trace_watchdog_arm(task, key.expire());
        }
        log::trace!("{task} blocks on {object:?} ({timeout:?})");
        self.trace_task(tq::ENQUEUE, task);

        self.queue_changed(object);
        self.update_task(task);
    }

    /// Ends the wait of `task`. Returns `false` if it was not waiting.
    pub(crate) fn unblock(&mut self, task: TaskId, outcome: WaitOutcome) -> bool {
        let Some(tcb) = self.tasks.get_mut(task) else {
            return false;
        };
        let Some(object) = tcb.wait.object.take() else {
            return false;
        };
        let timer = tcb.wait.timer.take();
        tcb.wait.sticky = false;
        tcb.wait.outcome = Some((object, outcome));
        tcb.state.remove(TaskState::BLOCKED);

        if let Some(key) = timer {
            if self.watchdogs.remove(key) {
                self.trace_task(rts::records::watchdog::DISARM, task);
            }
        }
        if let Some(queue) = self.queue_mut(object) {
            queue.remove(task);
        }
        self.queue_changed(object);
        self.update_task(task);
        true
    }

    /// Next waiter the queue would release.
    pub(crate) fn first_waiter(&self, object: WaitObject) -> Option<TaskId> {
        let queue = self.queue(object)?;
        match queue.discipline {
            Discipline::Fifo => queue.waiters.first().map(|w| w.task),
            Discipline::Priority => queue
                .waiters
                .iter()
                .max_by(|a, b| {
                    let ua = self.tasks.get(a.task).map(|t| t.urgency);
                    let ub = self.tasks.get(b.task).map(|t| t.urgency);
                    ua.cmp(&ub).then(b.seq.cmp(&a.seq))
                })
                .map(|w| w.task),
        }
    }

    /// Releases the first waiter with `outcome`.
    pub(crate) fn dequeue_first(&mut self, object: WaitObject, outcome: WaitOutcome) -> Option<TaskId> {
        let task = self.first_waiter(object)?;
        self.unblock(task, outcome);
        self.trace_task(tq::DEQUEUE, task);
        Some(task)
    }

    /// Releases every waiter with `status`. Returns how many were released.
    pub(crate) fn flush_waiters(&mut self, object: WaitObject, status: Status) -> usize {
        let mut released = 0;
        while let Some(task) = self.first_waiter(object) {
            if !self.unblock(task, Err(status)) {
                if let Some(queue) = self.queue_mut(object) {
                    queue.remove(task);
                }
                continue;
            }
            self.trace_task(tq::EXTRACT, task);
            released += 1;
        }
        released
    }

    /// Cancels whatever wait `task` is in, as a delete or restart does. The
    /// outcome is discarded.
    pub(crate) fn extract(&mut self, task: TaskId) {
        if self.unblock(task, Err(Status::Unsatisfied)) {
            self.trace_task(tq::EXTRACT, task);
        }
        if let Some(tcb) = self.tasks.get_mut(task) {
            tcb.wait.outcome = None;
        }
    }

    /// Watchdog expiry of wait number `wait`.
    pub(crate) fn wait_timeout(&mut self, task: TaskId, wait: u64) {
        let Some(tcb) = self.tasks.get_mut(task) else {
            return;
        };
        if tcb.wait.seq != wait {
            return;
        }
        let Some(object) = tcb.wait.object else {
            return;
        };
        tcb.wait.timer = None;
        let outcome = match object {
            WaitObject::Sleep => Ok(WaitValue::Unit),
            _ => Err(Status::Timeout),
        };
        self.unblock(task, outcome);
        self.trace_task(tq::TIMEOUT, task);
    }

    /// Takes the outcome of a finished wait on `object`. Outcomes of waits on
    /// other objects are dropped.
    pub(crate) fn take_outcome(&mut self, task: TaskId, object: WaitObject) -> Option<WaitOutcome> {
        let tcb = self.tasks.get_mut(task)?;
        match tcb.wait.outcome.take() {
            Some((waited, outcome)) if waited == object => Some(outcome),
            _ => None,
        }
    }

    /// Outcome of a wait the caller finished since it last asked.
    pub(crate) fn resume_outcome(&mut self, caller: Caller, object: WaitObject) -> Option<WaitOutcome> {
        self.take_outcome(caller.task()?, object)
    }

    /// A task that is still blocked gets nothing new to do.
    pub(crate) fn ensure_not_blocked(&self, caller: Caller) -> Result<()> {
        match caller.task().and_then(|task| self.tasks.get(task)) {
            Some(tcb) if tcb.is_blocked() => Err(Status::WouldBlock),
            _ => Ok(()),
        }
    }

    /// Blocks the caller on `object` or reports why it cannot block.
    pub(crate) fn wait_for<T>(
        &mut self,
        caller: Caller,
        object: WaitObject,
        timeout: Timeout,
        sticky: bool,
    ) -> Result<T> {
        let task = match caller {
            Caller::Task { id, .. } => id,
            Caller::Isr { .. } if timeout != Timeout::NoWait => return Err(Status::CalledFromIsr),
            Caller::Isr { .. } | Caller::Init => return Err(Status::Unsatisfied),
        };
        if timeout == Timeout::NoWait {
            return Err(Status::Unsatisfied);
        }
        let disabled = self.tasks.get(task).is_some_and(|t| t.dispatch_disable > 0);
        if disabled {
            return Err(self.raise_fatal(Fatal::internal(InternalError::BadThreadDispatchEnvironment)));
        }
        self.block(task, object, timeout, sticky);
        Err(Status::WouldBlock)
    }

    /// Owners of lock queues track their waiters.
    fn queue_changed(&mut self, object: WaitObject) {
        if let WaitObject::Semaphore(id) = object {
            if let Some(owner) = self.semaphores.get(id).and_then(|s| s.owner()) {
                self.update_task(owner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::state_with_tasks;
    use crate::priority::Priority;

    #[test]
    fn fifo_releases_in_arrival_order() {
        let (mut state, tasks) = state_with_tasks(&[5, 9, 7]);
        let queue = state.test_barrier(Discipline::Fifo);
        for task in &tasks {
            state.block(*task, queue, Timeout::Forever, false);
        }
        let order: Vec<_> = (0..3)
            .filter_map(|_| state.dequeue_first(queue, Ok(WaitValue::Unit)))
            .collect();
        assert_eq!(order, tasks);
    }

    #[test]
    fn priority_releases_most_urgent_then_oldest() {
        let (mut state, tasks) = state_with_tasks(&[5, 9, 9, 7]);
        let queue = state.test_barrier(Discipline::Priority);
        for task in &tasks {
            state.block(*task, queue, Timeout::Forever, false);
        }
        let order: Vec<_> = (0..4)
            .filter_map(|_| state.dequeue_first(queue, Ok(WaitValue::Unit)))
            .collect();
        assert_eq!(order, vec![tasks[1], tasks[2], tasks[3], tasks[0]]);
    }

    #[test]
    fn timeout_after_release_is_a_no_op() {
        let (mut state, tasks) = state_with_tasks(&[3]);
        let queue = state.test_barrier(Discipline::Fifo);
        state.block(tasks[0], queue, Timeout::Ticks(2), false);
        let wait = state.tasks.get(tasks[0]).expect("task").wait.seq;

        assert_eq!(state.dequeue_first(queue, Ok(WaitValue::Unit)), Some(tasks[0]));
        state.wait_timeout(tasks[0], wait);
        assert_eq!(state.take_outcome(tasks[0], queue), Some(Ok(WaitValue::Unit)));
        assert_eq!(state.watchdogs.len(), 0);
    }

    #[test]
    fn timeout_removes_waiter_from_queue() {
        let (mut state, tasks) = state_with_tasks(&[3]);
        let queue = state.test_barrier(Discipline::Fifo);
        state.block(tasks[0], queue, Timeout::Ticks(1), false);
        state.tick_watchdogs();

        assert!(state.queue(queue).expect("queue").is_empty());
        assert_eq!(state.take_outcome(tasks[0], queue), Some(Err(Status::Timeout)));
        assert!(state.dequeue_first(queue, Ok(WaitValue::Unit)).is_none());
        let tcb = state.tasks.get(tasks[0]).expect("task");
        assert!(!tcb.is_blocked());
        assert_eq!(tcb.priority, Priority(3));
    }
}
