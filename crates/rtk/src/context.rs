//! Per-caller directive interface.
//!
//! Every directive goes through a [`Context`], which knows who is calling:
//! initialization code, a task step running on some processor, or an
//! interrupt handler. The caller kind decides what a directive may do; tasks
//! may block, interrupt handlers may not, and initialization code never owns
//! anything.

use crate::barrier::{BarrierAttributes, BarrierInfo};
use crate::cpuset::{CpuIndex, CpuSet};
use crate::extension::ExtensionTable;
use crate::kernel::Kernel;
use crate::message::{MessageQueueAttributes, MessageQueueInfo};
use crate::object::{BarrierId, ExtensionId, MessageQueueId, PeriodId, SemaphoreId, TaskId};
use crate::period::PeriodStatus;
use crate::priority::Priority;
use crate::scheduler::SchedulerId;
use crate::semaphore::{SemaphoreAttributes, SemaphoreInfo};
use crate::signal::{SignalHandler, SignalSet};
use crate::status::{Fatal, FatalSource, Result};
use crate::task::{Mode, ModeMask, TaskAction, TaskBody, TaskConfig, TaskSnapshot};
use crate::threadq::Timeout;

/// Who issues a directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Caller {
    /// System initialization or any code outside task steps.
    Init,
    Task { id: TaskId, cpu: CpuIndex },
    Isr { cpu: CpuIndex },
}

impl Caller {
    pub(crate) fn is_interrupt(&self) -> bool {
        matches!(self, Caller::Isr { .. })
    }

    pub(crate) fn task(&self) -> Option<TaskId> {
        match self {
            Caller::Task { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub(crate) fn cpu(&self) -> Option<CpuIndex> {
        match self {
            Caller::Task { cpu, .. } | Caller::Isr { cpu } => Some(*cpu),
            Caller::Init => None,
        }
    }
}

/// Directive interface bound to one caller.
///
/// Blocking directives return [`Status::WouldBlock`](crate::Status::WouldBlock)
/// when the calling task had to wait. The task body then returns
/// [`TaskAction::Blocked`] and issues the same directive again on its next
/// step, which yields the outcome of the wait.
pub struct Context<'k> {
    kernel: &'k Kernel,
    caller: Caller,
}

impl<'k> Context<'k> {
    pub(crate) fn new(kernel: &'k Kernel, caller: Caller) -> Self {
        Self { kernel, caller }
    }

    pub fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    /// Calling task, if a task step is running.
    pub fn task_id(&self) -> Option<TaskId> {
        self.caller.task()
    }

    pub fn cpu(&self) -> Option<CpuIndex> {
        self.caller.cpu()
    }

    pub fn is_interrupt(&self) -> bool {
        self.caller.is_interrupt()
    }

    /// Number of completed steps of the calling task since it was started
    /// or restarted.
    pub fn iteration(&self) -> u64 {
        let Some(task) = self.caller.task() else {
            return 0;
        };
        self.kernel
            .peek(|state| state.tasks.get(task).map_or(0, |t| t.iteration))
    }

    /// Start or restart argument of the calling task.
    pub fn argument(&self) -> usize {
        let Some(task) = self.caller.task() else {
            return 0;
        };
        self.kernel
            .peek(|state| state.tasks.get(task).map_or(0, |t| t.argument))
    }

    /// Halts the system with an application fatal error.
    pub fn fatal(&self, code: u32) -> ! {
        self.kernel.halt(Fatal {
            source: FatalSource::Application,
            code,
        })
    }

    // Task manager.

    pub fn task_create(&mut self, config: &TaskConfig) -> Result<TaskId> {
        let caller = self.caller;
        self.kernel.call(|s| s.task_create(caller, config))
    }

    pub fn task_start(
        &mut self,
        task: TaskId,
        body: impl FnMut(&mut Context<'_>) -> TaskAction + Send + 'static,
        argument: usize,
    ) -> Result<()> {
        let body: TaskBody = Box::new(body);
        self.kernel.call(|s| s.task_start(task, body, argument))
    }

    /// Deletes a task. Deleting the calling task does not return.
    pub fn task_delete(&mut self, task: TaskId) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.task_delete(caller, task))
    }

    /// Restarts a task. Restarting the calling task does not return.
    pub fn task_restart(&mut self, task: TaskId, argument: usize) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.task_restart(caller, task, argument))
    }

    /// Terminates the calling task. Returns only with an error.
    pub fn task_exit(&mut self) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.task_exit(caller))
    }

    pub fn task_suspend(&mut self, task: TaskId) -> Result<()> {
        self.kernel.call(|s| s.task_suspend(task))
    }

    pub fn task_resume(&mut self, task: TaskId) -> Result<()> {
        self.kernel.call(|s| s.task_resume(task))
    }

    pub fn task_is_suspended(&self, task: TaskId) -> Result<bool> {
        self.kernel.peek(|s| s.task_is_suspended(task))
    }

    pub fn task_get_priority(&self, task: TaskId, scheduler: SchedulerId) -> Result<Priority> {
        self.kernel.peek(|s| s.task_get_priority(task, scheduler))
    }

    /// Sets the real priority when `new` is given; returns the previous one.
    pub fn task_set_priority(&mut self, task: TaskId, new: Option<Priority>) -> Result<Priority> {
        self.kernel.call(|s| s.task_set_priority(task, new))
    }

    pub fn task_set_scheduler(&mut self, task: TaskId, scheduler: SchedulerId, priority: Priority) -> Result<()> {
        self.kernel.call(|s| s.task_set_scheduler(task, scheduler, priority))
    }

    pub fn task_set_affinity(&mut self, task: TaskId, affinity: CpuSet) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.set_affinity(caller, task, affinity))
    }

    pub fn task_get_affinity(&self, task: TaskId) -> Result<CpuSet> {
        self.kernel.peek(|s| s.get_affinity(task))
    }

    /// Changes the fields of the calling task's mode selected by `mask`.
    pub fn task_mode(&mut self, new: Mode, mask: ModeMask) -> Result<Mode> {
        let caller = self.caller;
        self.kernel.call(|s| s.task_mode(caller, new, mask))
    }

    pub fn task_wake_after(&mut self, ticks: u64) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.task_wake_after(caller, ticks))
    }

    pub fn yield_now(&mut self) -> Result<()> {
        self.task_wake_after(0)
    }

    pub fn task_set_protection(&mut self, protect: bool) -> Result<bool> {
        let caller = self.caller;
        self.kernel.call(|s| s.task_set_protection(caller, protect))
    }

    pub fn task_ident(&self, name: &str) -> Result<TaskId> {
        self.kernel.peek(|s| s.task_ident(name))
    }

    pub fn task_snapshot(&self, task: TaskId) -> Result<TaskSnapshot> {
        self.kernel.task_snapshot(task)
    }

    /// Disables thread dispatching for the calling task. Returns the new level.
    pub fn dispatch_disable(&mut self) -> Result<u32> {
        let caller = self.caller;
        self.kernel.call(|s| s.dispatch_disable(caller))
    }

    pub fn dispatch_enable(&mut self) -> Result<u32> {
        let caller = self.caller;
        self.kernel.call(|s| s.dispatch_enable(caller))
    }

    // Scheduler manager.

    pub fn scheduler_ident(&self, name: &str) -> Result<SchedulerId> {
        self.kernel.peek(|s| s.scheduler_ident(name))
    }

    pub fn scheduler_of_processor(&self, cpu: CpuIndex) -> Result<SchedulerId> {
        self.kernel.peek(|s| s.scheduler_of_processor(cpu))
    }

    pub fn scheduler_processors(&self, scheduler: SchedulerId) -> Result<CpuSet> {
        self.kernel.peek(|s| s.scheduler_processors(scheduler))
    }

    pub fn scheduler_max_priority(&self, scheduler: SchedulerId) -> Result<Priority> {
        self.kernel.peek(|s| s.scheduler_max_priority(scheduler))
    }

    pub fn scheduler_add_processor(&mut self, scheduler: SchedulerId, cpu: CpuIndex) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.add_processor(caller, scheduler, cpu))
    }

    pub fn scheduler_remove_processor(&mut self, scheduler: SchedulerId, cpu: CpuIndex) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.remove_processor(caller, scheduler, cpu))
    }

    // Semaphore manager.

    pub fn semaphore_create(
        &mut self,
        name: &str,
        count: u32,
        attributes: SemaphoreAttributes,
        ceiling: Priority,
    ) -> Result<SemaphoreId> {
        let caller = self.caller;
        self.kernel
            .call(|s| s.semaphore_create(caller, name, count, attributes, ceiling))
    }

    pub fn semaphore_ident(&self, name: &str) -> Result<SemaphoreId> {
        self.kernel.peek(|s| s.semaphore_ident(name))
    }

    pub fn semaphore_obtain(&mut self, id: SemaphoreId, timeout: Timeout) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.semaphore_obtain(caller, id, timeout))
    }

    pub fn semaphore_release(&mut self, id: SemaphoreId) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.semaphore_release(caller, id))
    }

    /// Releases every waiter with `Unsatisfied`. Returns how many.
    pub fn semaphore_flush(&mut self, id: SemaphoreId) -> Result<usize> {
        let caller = self.caller;
        self.kernel.call(|s| s.semaphore_flush(caller, id))
    }

    pub fn semaphore_delete(&mut self, id: SemaphoreId) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.semaphore_delete(caller, id))
    }

    /// Reads the ceiling of `id` for `scheduler` and sets it when `new` is
    /// given.
    pub fn semaphore_set_priority(
        &mut self,
        id: SemaphoreId,
        scheduler: SchedulerId,
        new: Option<Priority>,
    ) -> Result<Priority> {
        self.kernel.call(|s| s.semaphore_set_priority(id, scheduler, new))
    }

    pub fn semaphore_info(&self, id: SemaphoreId) -> Result<SemaphoreInfo> {
        self.kernel.peek(|s| s.semaphore_info(id))
    }

    // Barrier manager.

    pub fn barrier_create(&mut self, name: &str, attributes: BarrierAttributes, maximum: u32) -> Result<BarrierId> {
        let caller = self.caller;
        self.kernel
            .call(|s| s.barrier_create(caller, name, attributes, maximum))
    }

    pub fn barrier_ident(&self, name: &str) -> Result<BarrierId> {
        self.kernel.peek(|s| s.barrier_ident(name))
    }

    pub fn barrier_wait(&mut self, id: BarrierId, timeout: Timeout) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.barrier_wait(caller, id, timeout))
    }

    pub fn barrier_release(&mut self, id: BarrierId) -> Result<usize> {
        self.kernel.call(|s| s.barrier_release(id))
    }

    pub fn barrier_release_n(&mut self, id: BarrierId, count: usize) -> Result<usize> {
        self.kernel.call(|s| s.barrier_release_n(id, count))
    }

    pub fn barrier_delete(&mut self, id: BarrierId) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.barrier_delete(caller, id))
    }

    pub fn barrier_info(&self, id: BarrierId) -> Result<BarrierInfo> {
        self.kernel.peek(|s| s.barrier_info(id))
    }

    // Message queue manager.

    pub fn message_queue_create(
        &mut self,
        name: &str,
        count: usize,
        maximum_size: usize,
        attributes: MessageQueueAttributes,
    ) -> Result<MessageQueueId> {
        let caller = self.caller;
        self.kernel
            .call(|s| s.message_queue_create(caller, name, count, maximum_size, attributes))
    }

    pub fn message_queue_ident(&self, name: &str) -> Result<MessageQueueId> {
        self.kernel.peek(|s| s.message_queue_ident(name))
    }

    pub fn message_queue_send(&mut self, id: MessageQueueId, message: &[u8]) -> Result<()> {
        self.kernel.call(|s| s.message_send(id, message, false))
    }

    pub fn message_queue_urgent(&mut self, id: MessageQueueId, message: &[u8]) -> Result<()> {
        self.kernel.call(|s| s.message_send(id, message, true))
    }

    pub fn message_queue_broadcast(&mut self, id: MessageQueueId, message: &[u8]) -> Result<usize> {
        self.kernel.call(|s| s.message_broadcast(id, message))
    }

    pub fn message_queue_receive(&mut self, id: MessageQueueId, timeout: Timeout) -> Result<Vec<u8>> {
        let caller = self.caller;
        self.kernel.call(|s| s.message_receive(caller, id, timeout))
    }

    pub fn message_queue_flush(&mut self, id: MessageQueueId) -> Result<usize> {
        self.kernel.call(|s| s.message_flush(id))
    }

    pub fn message_queue_pending(&self, id: MessageQueueId) -> Result<usize> {
        self.kernel.peek(|s| s.message_queue_info(id).map(|info| info.pending))
    }

    pub fn message_queue_delete(&mut self, id: MessageQueueId) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.message_delete(caller, id))
    }

    pub fn message_queue_info(&self, id: MessageQueueId) -> Result<MessageQueueInfo> {
        self.kernel.peek(|s| s.message_queue_info(id))
    }

    // Rate-monotonic manager.

    pub fn period_create(&mut self, name: &str) -> Result<PeriodId> {
        let caller = self.caller;
        self.kernel.call(|s| s.period_create(caller, name))
    }

    pub fn period_ident(&self, name: &str) -> Result<PeriodId> {
        self.kernel.peek(|s| s.period_ident(name))
    }

    /// Starts or continues the period; `ticks == 0` only reports its state.
    pub fn period(&mut self, id: PeriodId, ticks: u64) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.period_period(caller, id, ticks))
    }

    pub fn period_status(&self, id: PeriodId) -> Result<PeriodStatus> {
        self.kernel.peek(|s| s.period_status(id))
    }

    pub fn period_cancel(&mut self, id: PeriodId) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.period_cancel(caller, id))
    }

    pub fn period_delete(&mut self, id: PeriodId) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.period_delete(caller, id))
    }

    // Signal manager.

    pub fn signal_catch(&mut self, handler: Option<SignalHandler>) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.signal_catch(caller, handler))
    }

    pub fn signal_send(&mut self, task: TaskId, set: SignalSet) -> Result<()> {
        self.kernel.call(|s| s.signal_send(task, set))
    }

    // User extensions.

    pub fn extension_create(&mut self, name: &str, table: ExtensionTable) -> Result<ExtensionId> {
        let caller = self.caller;
        self.kernel.call(|s| s.extension_create(caller, name, table))
    }

    pub fn extension_ident(&self, name: &str) -> Result<ExtensionId> {
        self.kernel.peek(|s| s.extension_ident(name))
    }

    pub fn extension_delete(&mut self, id: ExtensionId) -> Result<()> {
        let caller = self.caller;
        self.kernel.call(|s| s.extension_delete(caller, id))
    }
}
