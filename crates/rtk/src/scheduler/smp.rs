//! Processor allocation.
//!
//! Allocation is recomputed from scratch whenever the kernel leaves its
//! critical section or a processor dispatches:
//!
//! 1. a task that is in the middle of a step keeps its processor, and so does
//!    an executing task that disabled preemption or thread dispatching;
//! 2. each instance hands its remaining processors to its ready tasks, most
//!    urgent first, preferring the processor a task already has; a task whose
//!    affinity finds no free processor may move one lower-ranked heir to
//!    another free processor of that heir;
//! 3. a processor whose heir spins on an MrsP mutex runs the mutex owner
//!    instead when the owner is ready but got no processor of its own.

use std::collections::HashSet;

use rts::records::sched;

use crate::cpuset::CpuIndex;
use crate::kernel::State;
use crate::object::TaskId;
use crate::task::WaitObject;

impl State {
    pub(crate) fn allocate(&mut self) {
        let count = self.processors.len();
        let mut heirs: Vec<Option<TaskId>> = vec![None; count];
        let mut pinned = vec![false; count];
        let mut assigned: HashSet<TaskId> = HashSet::new();

        for cpu in 0..count {
            if self.processors[cpu].scheduler.is_none() {
                continue;
            }
            let Some(task) = self.processors[cpu].executing else {
                continue;
            };
            let Some(tcb) = self.tasks.get(task) else {
                continue;
            };
            let keeps = tcb.running_on == Some(cpu)
                || (tcb.is_schedulable()
                    && tcb.cpu == Some(cpu)
                    && (!tcb.modes.is_preemptible() || tcb.dispatch_disable > 0));
            if keeps {
                heirs[cpu] = Some(task);
                pinned[cpu] = true;
                assigned.insert(task);
            }
        }

        for instance in &self.schedulers {
            for task in instance.ready.ordered() {
                if assigned.contains(&task) {
                    continue;
                }
                let Some(tcb) = self.tasks.get(task) else {
                    continue;
                };
                let allowed = tcb.affinity.intersection(instance.processors);
                let free: Vec<CpuIndex> = allowed.iter().filter(|c| heirs[*c].is_none()).collect();
                let choice = tcb
                    .cpu
                    .filter(|c| free.contains(c))
                    .or_else(|| free.first().copied());
                if let Some(cpu) = choice {
                    heirs[cpu] = Some(task);
                    assigned.insert(task);
                    continue;
                }

                // Move one heir aside if it can run elsewhere.
                for cpu in allowed.iter() {
                    let Some(other) = heirs[cpu] else {
                        continue;
                    };
                    if pinned[cpu] {
                        continue;
                    }
                    let Some(other_tcb) = self.tasks.get(other) else {
                        continue;
                    };
                    let Some(home) = self.schedulers.get(other_tcb.home.index()) else {
                        continue;
                    };
                    let alternative = other_tcb
                        .affinity
                        .intersection(home.processors)
                        .iter()
                        .find(|c| heirs[*c].is_none());
                    if let Some(target) = alternative {
                        heirs[target] = Some(other);
                        heirs[cpu] = Some(task);
                        assigned.insert(task);
                        break;
                    }
                }
            }
        }

        let mut helping = Vec::new();
        for cpu in 0..count {
            let Some(waiter) = heirs[cpu] else {
                continue;
            };
            let Some(tcb) = self.tasks.get(waiter) else {
                continue;
            };
            if !tcb.wait.sticky {
                continue;
            }
            let Some(WaitObject::Semaphore(id)) = tcb.wait.object else {
                continue;
            };
            let Some(owner) = self.semaphores.get(id).and_then(|s| s.owner()) else {
                continue;
            };
            let runnable = self.tasks.get(owner).is_some_and(|o| o.is_runnable());
            if runnable && !assigned.contains(&owner) {
                heirs[cpu] = Some(owner);
                assigned.insert(owner);
                if let Some(scheduler) = self.processors[cpu].scheduler {
                    helping.push((owner, scheduler, cpu));
                }
            }
        }

        let ids = self.tasks.ids();
        for id in ids {
            if let Some(tcb) = self.tasks.get_mut(id) {
                tcb.cpu = None;
                tcb.helping = None;
            }
        }
        for (cpu, heir) in heirs.iter().enumerate() {
            self.processors[cpu].heir = *heir;
            if let Some(tcb) = heir.and_then(|t| self.tasks.get_mut(t)) {
                tcb.cpu = Some(cpu);
            }
        }
        for (owner, scheduler, cpu) in helping {
            let home = self.tasks.get(owner).map(|t| t.home);
            if home != Some(scheduler) {
                if let Some(tcb) = self.tasks.get_mut(owner) {
                    tcb.helping = Some(scheduler);
                }
                log::trace!("{owner} helped by processor {cpu}");
                self.trace_task(sched::HELP, owner);
            }
        }
    }
}
