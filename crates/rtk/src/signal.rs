//! Asynchronous signal routines.
//!
//! Signals sent to a task accumulate in its pending set. When the task is
//! next dispatched with ASR processing enabled, the dispatcher hands the whole
//! set to the task's handler before the body runs.

use bitflags::bitflags;

use crate::context::{Caller, Context};
use crate::kernel::State;
use crate::object::TaskId;
use crate::status::{Result, Status};
use crate::sync::Arc;

bitflags! {
    /// Set of signals. Any bit may be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct SignalSet: u32 {
        const SIGNAL_0 = 1 << 0;
        const SIGNAL_1 = 1 << 1;
        const SIGNAL_2 = 1 << 2;
        const SIGNAL_3 = 1 << 3;
        const _ = !0;
    }
}

/// Asynchronous signal routine of a task.
pub type SignalHandler = Arc<dyn Fn(&mut Context<'_>, SignalSet) + Send + Sync>;

#[derive(Default)]
pub(crate) struct SignalState {
    pub(crate) handler: Option<SignalHandler>,
    pub(crate) pending: SignalSet,
}

impl State {
    /// Installs or removes the caller's signal routine. Removing it discards
    /// pending signals.
    pub(crate) fn signal_catch(&mut self, caller: Caller, handler: Option<SignalHandler>) -> Result<()> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        let task = caller.task().ok_or(Status::IncorrectState)?;
        let tcb = self.tasks.get_mut(task).ok_or(Status::InvalidId)?;
        if handler.is_none() {
            tcb.signals.pending = SignalSet::empty();
        }
        tcb.signals.handler = handler;
        Ok(())
    }

    pub(crate) fn signal_send(&mut self, task: TaskId, set: SignalSet) -> Result<()> {
        let tcb = self.tasks.get_mut(task).ok_or(Status::InvalidId)?;
        if set.is_empty() {
            return Err(Status::InvalidNumber);
        }
        if tcb.signals.handler.is_none() {
            return Err(Status::NotDefined);
        }
        tcb.signals.pending |= set;
        log::trace!("signals {set:?} sent to {task}");
        Ok(())
    }

    /// Pending signals and the handler to run them, if the task takes them now.
    pub(crate) fn take_signals(&mut self, task: TaskId) -> Option<(SignalHandler, SignalSet)> {
        let tcb = self.tasks.get_mut(task)?;
        if !tcb.modes.asr_enabled() || tcb.signals.pending.is_empty() {
            return None;
        }
        let handler = tcb.signals.handler.clone()?;
        let set = core::mem::take(&mut tcb.signals.pending);
        Some((handler, set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::state_with_tasks;
    use crate::task::Mode;

    fn noop() -> SignalHandler {
        Arc::new(|_: &mut Context<'_>, _| {})
    }

    #[test]
    fn send_requires_a_handler_and_signals() {
        let (mut state, tasks) = state_with_tasks(&[5]);
        let caller = Caller::Task { id: tasks[0], cpu: 0 };
        assert_eq!(state.signal_send(tasks[0], SignalSet::SIGNAL_1), Err(Status::NotDefined));
        state.signal_catch(caller, Some(noop())).expect("catch");
        assert_eq!(state.signal_send(tasks[0], SignalSet::empty()), Err(Status::InvalidNumber));
        state.signal_send(tasks[0], SignalSet::SIGNAL_1).expect("send");
        state.signal_send(tasks[0], SignalSet::SIGNAL_3).expect("send");

        let (_, set) = state.take_signals(tasks[0]).expect("pending");
        assert_eq!(set, SignalSet::SIGNAL_1 | SignalSet::SIGNAL_3);
        assert!(state.take_signals(tasks[0]).is_none());
    }

    #[test]
    fn disabled_asr_keeps_signals_pending() {
        let (mut state, tasks) = state_with_tasks(&[5]);
        let caller = Caller::Task { id: tasks[0], cpu: 0 };
        state.signal_catch(caller, Some(noop())).expect("catch");
        state.tasks.get_mut(tasks[0]).expect("task").modes = Mode::NO_ASR;
        state.signal_send(tasks[0], SignalSet::SIGNAL_0).expect("send");
        assert!(state.take_signals(tasks[0]).is_none());

        state.tasks.get_mut(tasks[0]).expect("task").modes = Mode::DEFAULT;
        assert!(state.take_signals(tasks[0]).is_some());
    }
}
