//! User extensions.
//!
//! Extension sets observe task life changes. Static sets come from the
//! kernel builder and always run first; dynamic sets are installed and
//! removed at run time. Delete and terminate extensions run in reverse
//! registration order, restart extensions in registration order. Every call
//! happens after the kernel critical section of the directive was left and
//! before the directive returns.

use crate::context::Caller;
use crate::kernel::State;
use crate::object::{Arena, ExtensionId, TaskId};
use crate::status::{Result, Status};
use crate::sync::Arc;
use crate::task::TaskSnapshot;

/// Called with the task that performed the change (if any) and the task
/// the change applies to.
pub type LifeExtension = Arc<dyn Fn(Option<TaskId>, &TaskSnapshot) + Send + Sync>;

/// Called with the task that is terminating.
pub type TerminateExtension = Arc<dyn Fn(&TaskSnapshot) + Send + Sync>;

/// One extension set. Unused entries stay `None`.
#[derive(Clone, Default)]
pub struct ExtensionTable {
    pub task_delete: Option<LifeExtension>,
    pub task_restart: Option<LifeExtension>,
    pub task_terminate: Option<TerminateExtension>,
}

impl ExtensionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_delete(
        mut self,
        f: impl Fn(Option<TaskId>, &TaskSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.task_delete = Some(Arc::new(f));
        self
    }

    pub fn with_task_restart(
        mut self,
        f: impl Fn(Option<TaskId>, &TaskSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.task_restart = Some(Arc::new(f));
        self
    }

    pub fn with_task_terminate(mut self, f: impl Fn(&TaskSnapshot) + Send + Sync + 'static) -> Self {
        self.task_terminate = Some(Arc::new(f));
        self
    }
}

impl core::fmt::Debug for ExtensionTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExtensionTable")
            .field("task_delete", &self.task_delete.is_some())
            .field("task_restart", &self.task_restart.is_some())
            .field("task_terminate", &self.task_terminate.is_some())
            .finish()
    }
}

struct DynamicSet {
    name: String,
    seq: u64,
    table: ExtensionTable,
}

pub(crate) struct Extensions {
    statics: Vec<ExtensionTable>,
    dynamic: Arena<ExtensionId, DynamicSet>,
}

impl Extensions {
    pub(crate) fn new(statics: Vec<ExtensionTable>, capacity: usize) -> Self {
        Self {
            statics,
            dynamic: Arena::new(capacity),
        }
    }

    /// Sets in registration order.
    fn ordered(&self) -> Vec<&ExtensionTable> {
        let mut dynamic: Vec<&DynamicSet> = self.dynamic.iter().collect();
        dynamic.sort_by_key(|set| set.seq);
        self.statics
            .iter()
            .chain(dynamic.into_iter().map(|set| &set.table))
            .collect()
    }
}

impl State {
    pub(crate) fn extension_create(
        &mut self,
        caller: Caller,
        name: &str,
        table: ExtensionTable,
    ) -> Result<ExtensionId> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        if name.is_empty() {
            return Err(Status::InvalidName);
        }
        let seq = self.next_seq();
        let id = self.extensions.dynamic.insert_with(|_| DynamicSet {
            name: name.to_string(),
            seq,
            table,
        })?;
        log::debug!("installed extension set {id} {name:?}");
        Ok(id)
    }

    pub(crate) fn extension_ident(&self, name: &str) -> Result<ExtensionId> {
        let dynamic = &self.extensions.dynamic;
        dynamic
            .ids()
            .into_iter()
            .find(|id| dynamic.get(*id).is_some_and(|set| set.name == name))
            .ok_or(Status::InvalidName)
    }

    pub(crate) fn extension_delete(&mut self, caller: Caller, id: ExtensionId) -> Result<()> {
        if caller.is_interrupt() {
            return Err(Status::CalledFromIsr);
        }
        self.extensions.dynamic.remove(id).ok_or(Status::InvalidId)?;
        log::debug!("removed extension set {id}");
        Ok(())
    }

    pub(crate) fn queue_terminate_extensions(&mut self, task: TaskId) {
        let Some(snapshot) = self.tasks.get(task).map(|t| t.snapshot()) else {
            return;
        };
        let hooks: Vec<TerminateExtension> = self
            .extensions
            .ordered()
            .into_iter()
            .rev()
            .filter_map(|set| set.task_terminate.clone())
            .collect();
        if hooks.is_empty() {
            return;
        }
        self.effects.defer(Box::new(move || {
            for hook in hooks {
                hook(&snapshot);
            }
        }));
    }

    pub(crate) fn queue_delete_extensions(&mut self, executing: Option<TaskId>, task: TaskId) {
        let hooks: Vec<LifeExtension> = self
            .extensions
            .ordered()
            .into_iter()
            .rev()
            .filter_map(|set| set.task_delete.clone())
            .collect();
        self.queue_life_extensions(hooks, executing, task);
    }

    pub(crate) fn queue_restart_extensions(&mut self, executing: Option<TaskId>, task: TaskId) {
        let hooks: Vec<LifeExtension> = self
            .extensions
            .ordered()
            .into_iter()
            .filter_map(|set| set.task_restart.clone())
            .collect();
        self.queue_life_extensions(hooks, executing, task);
    }

    fn queue_life_extensions(&mut self, hooks: Vec<LifeExtension>, executing: Option<TaskId>, task: TaskId) {
        let Some(snapshot) = self.tasks.get(task).map(|t| t.snapshot()) else {
            return;
        };
        if hooks.is_empty() {
            return;
        }
        self.effects.defer(Box::new(move || {
            for hook in hooks {
                hook(executing, &snapshot);
            }
        }));
    }
}
