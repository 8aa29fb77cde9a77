//! Kernel context, critical section and dispatcher.
//!
//! All kernel objects live in one [`State`] behind the kernel critical
//! section. A directive runs entirely inside the critical section; whatever
//! it wants to happen outside (trace records, extension calls, not returning
//! to the caller) is collected as effects and carried out after the lock is
//! dropped.
//!
//! A dispatch on one processor switches to the processor's heir, runs one
//! step of its body without holding the lock, and then settles the step's
//! result at the task's safe point.

use core::fmt;
use std::panic::{self, AssertUnwindSafe};

use rts::records::{sched, watchdog as wd_records};
use rts::system::{SystemInfo, SYSTEM_INFO};
use rts::{PayloadBuilder, TraceError, TraceHook};

use crate::barrier::Barrier;
use crate::config::{ConfigError, KernelConfig};
use crate::context::{Caller, Context};
use crate::cpuset::CpuIndex;
use crate::extension::{ExtensionTable, Extensions};
use crate::message::MessageQueue;
use crate::object::{Arena, BarrierId, MessageQueueId, PeriodId, SemaphoreId, TaskId};
use crate::period::Period;
use crate::scheduler::{Processor, SchedulerId, SchedulerInstance};
use crate::semaphore::Semaphore;
use crate::signal::{SignalHandler, SignalSet};
use crate::status::{Fatal, FatalSource, Result, Status, TaskExit};
use crate::sync::{Arc, Mutex};
use crate::task::{LifeState, Mode, TaskAction, TaskBody, TaskSnapshot, Tcb};
use crate::watchdog::{TimerWheel, WatchdogEvent};

/// Called with the source and code of a fatal error before the halt.
pub type FatalHandler = Arc<dyn Fn(FatalSource, u32) + Send + Sync>;

/// How control leaves the directive after the critical section.
#[derive(Debug)]
pub(crate) enum Unwind {
    /// The calling task no longer runs its step.
    Exit,
    Fatal(Fatal),
}

/// Work produced inside the critical section and performed after it.
#[derive(Default)]
pub(crate) struct Effects {
    pub(crate) traces: Vec<(u8, Vec<u8>)>,
    pub(crate) calls: Vec<Box<dyn FnOnce() + Send>>,
    pub(crate) unwind: Option<Unwind>,
}

impl Effects {
    pub(crate) fn defer(&mut self, call: Box<dyn FnOnce() + Send>) {
        self.calls.push(call);
    }

    pub(crate) fn take(&mut self) -> Effects {
        core::mem::take(self)
    }
}

/// Everything the kernel critical section protects.
pub(crate) struct State {
    pub(crate) tasks: Arena<TaskId, Tcb>,
    pub(crate) semaphores: Arena<SemaphoreId, Semaphore>,
    pub(crate) barriers: Arena<BarrierId, Barrier>,
    pub(crate) message_queues: Arena<MessageQueueId, MessageQueue>,
    pub(crate) periods: Arena<PeriodId, Period>,
    pub(crate) extensions: Extensions,
    pub(crate) schedulers: Vec<SchedulerInstance>,
    pub(crate) processors: Vec<Processor>,
    pub(crate) watchdogs: TimerWheel,
    /// Terminated tasks whose slots are not reclaimed yet.
    pub(crate) zombies: Vec<TaskId>,
    pub(crate) seq: u64,
    pub(crate) ticks_per_timeslice: u32,
    pub(crate) effects: Effects,
}

impl State {
    /// State for a validated configuration.
    pub(crate) fn new(config: &KernelConfig, extensions: Vec<ExtensionTable>) -> Self {
        let schedulers: Vec<SchedulerInstance> = config
            .effective_schedulers()
            .iter()
            .map(SchedulerInstance::new)
            .collect();
        let mut processors: Vec<Processor> = (0..config.processors).map(|_| Processor::default()).collect();
        for (index, instance) in schedulers.iter().enumerate() {
            for cpu in instance.processors.iter() {
                if let Some(processor) = processors.get_mut(cpu) {
                    processor.scheduler = Some(SchedulerId(index as u8));
                }
            }
        }
        Self {
            tasks: Arena::new(config.maximum_tasks),
            semaphores: Arena::new(config.maximum_semaphores),
            barriers: Arena::new(config.maximum_barriers),
            message_queues: Arena::new(config.maximum_message_queues),
            periods: Arena::new(config.maximum_periods),
            extensions: Extensions::new(extensions, config.maximum_extensions),
            schedulers,
            processors,
            watchdogs: TimerWheel::new(),
            zombies: Vec::new(),
            seq: 0,
            ticks_per_timeslice: config.ticks_per_timeslice.max(1),
            effects: Effects::default(),
        }
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub(crate) fn trace_raw(&mut self, record: u8, payload: Vec<u8>) {
        self.effects.traces.push((record, payload));
    }

    pub(crate) fn trace_task(&mut self, record: u8, task: TaskId) {
        let mut payload = PayloadBuilder::with_capacity(4);
        payload.push_u32(task.object_id().raw());
        self.trace_raw(record, payload.finish());
    }

    pub(crate) fn trace_pair(&mut self, record: u8, task: TaskId, value: u32) {
        let mut payload = PayloadBuilder::with_capacity(8);
        payload.push_u32(task.object_id().raw()).push_u32(value);
        self.trace_raw(record, payload.finish());
    }

    pub(crate) fn trace_watchdog_arm(&mut self, task: TaskId, expire: u64) {
        let mut payload = PayloadBuilder::with_capacity(12);
        payload.push_u32(task.object_id().raw()).push_u64(expire);
        self.trace_raw(wd_records::ARM, payload.finish());
    }

    /// Requests a fatal halt once the critical section is left. The returned
    /// status is never seen by the caller.
    pub(crate) fn raise_fatal(&mut self, fatal: Fatal) -> Status {
        self.effects.unwind = Some(Unwind::Fatal(fatal));
        Status::IncorrectState
    }

    /// Advances the clock by one tick and fires expired watchdogs.
    pub(crate) fn tick_watchdogs(&mut self) {
        for (_, event) in self.watchdogs.tick() {
            match event {
                WatchdogEvent::WaitTimeout { task, wait } => {
                    self.trace_task(wd_records::FIRE, task);
                    self.wait_timeout(task, wait);
                }
                WatchdogEvent::PeriodEnd { period } => self.period_end(period),
            }
        }
    }

    /// Charges one tick to every executing timeslicing task.
    fn tick_timeslices(&mut self) {
        let executing: Vec<TaskId> = self.processors.iter().filter_map(|p| p.executing).collect();
        for task in executing {
            let Some(tcb) = self.tasks.get_mut(task) else {
                continue;
            };
            if !tcb.modes.contains(Mode::TIMESLICE) || !tcb.modes.is_preemptible() || !tcb.is_runnable() {
                continue;
            }
            tcb.timeslice += 1;
            if tcb.timeslice >= self.ticks_per_timeslice {
                tcb.timeslice = 0;
                self.requeue(task);
            }
        }
    }

    /// Switches `cpu` to its heir and takes the heir's body for one step.
    fn prepare_step(&mut self, cpu: CpuIndex) -> Prepared {
        self.allocate();
        let Some(processor) = self.processors.get(cpu) else {
            return Prepared::Idle;
        };
        if processor.scheduler.is_none() {
            return Prepared::Idle;
        }
        let heir = processor.heir;
        if processor.executing != heir {
            if heir.is_some() {
                for other in self.processors.iter_mut().filter(|p| p.executing == heir) {
                    other.executing = None;
                }
            }
            self.processors[cpu].executing = heir;
            match heir {
                Some(task) => {
                    log::trace!("processor {cpu} switches to {task}");
                    self.trace_pair(sched::NEXT, task, cpu as u32);
                }
                None => self.trace_raw(sched::IDLE, vec![cpu as u8]),
            }
        }
        let Some(task) = heir else {
            return Prepared::Idle;
        };
        if self.apply_life_change(task).is_some() {
            return Prepared::Changed;
        }
        let Some(tcb) = self.tasks.get_mut(task) else {
            return Prepared::Busy;
        };
        if !tcb.is_runnable() || tcb.running_on.is_some() {
            return Prepared::Busy;
        }
        let Some(body) = tcb.body.take() else {
            return Prepared::Busy;
        };
        tcb.running_on = Some(cpu);
        let signals = self.take_signals(task);
        Prepared::Step { task, body, signals }
    }

    /// Safe point at the end of a step. `action` is `None` when the step did
    /// not return normally.
    fn finish_step(&mut self, task: TaskId, body: TaskBody, action: Option<TaskAction>) {
        let Some(tcb) = self.tasks.get_mut(task) else {
            return;
        };
        tcb.running_on = None;
        if tcb.is_zombie() {
            return;
        }
        tcb.body = Some(body);
        if let Some(action) = action {
            tcb.iteration += 1;
            match action {
                TaskAction::Continue | TaskAction::Blocked => {}
                TaskAction::Yield => self.requeue(task),
                TaskAction::Exit => {
                    match self.task_exit(Caller::Task { id: task, cpu: 0 }) {
                        Err(Status::WouldBlock) => {}
                        other => log::warn!("{task} failed to exit: {other:?}"),
                    }
                    if matches!(self.effects.unwind, Some(Unwind::Exit)) {
                        self.effects.unwind = None;
                    }
                }
            }
        }
        self.apply_life_change(task);
    }

    /// No processor has anything left to do.
    fn is_quiescent(&self) -> bool {
        if self.tasks.iter().any(|t| t.running_on.is_some()) {
            return false;
        }
        self.processors
            .iter()
            .filter(|p| p.scheduler.is_some())
            .filter_map(|p| p.heir)
            .filter_map(|task| self.tasks.get(task))
            .all(|tcb| {
                !tcb.is_runnable() && !tcb.life.intersects(LifeState::TERMINATING | LifeState::RESTARTING)
            })
    }
}

enum Prepared {
    Idle,
    /// The heir cannot run a step right now.
    Busy,
    /// A pending life change was carried out instead of a step.
    Changed,
    Step {
        task: TaskId,
        body: TaskBody,
        signals: Option<(SignalHandler, SignalSet)>,
    },
}

/// Errors raised while building a kernel.
#[derive(Debug)]
pub enum KernelError {
    Config(ConfigError),
    Trace(TraceError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(error) => write!(f, "invalid configuration: {error}"),
            Self::Trace(_) => write!(f, "trace error"),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<ConfigError> for KernelError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TraceError> for KernelError {
    fn from(value: TraceError) -> Self {
        Self::Trace(value)
    }
}

/// Builder for [`Kernel`].
pub struct KernelBuilder {
    config: KernelConfig,
    trace: Option<TraceHook>,
    fatal_handler: Option<FatalHandler>,
    extensions: Vec<ExtensionTable>,
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            trace: None,
            fatal_handler: None,
            extensions: Vec::new(),
        }
    }

    pub fn with_trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    pub fn with_fatal_handler(mut self, handler: impl Fn(FatalSource, u32) + Send + Sync + 'static) -> Self {
        self.fatal_handler = Some(Arc::new(handler));
        self
    }

    /// Adds a static extension set. Static sets run before dynamic ones.
    pub fn with_extensions(mut self, table: ExtensionTable) -> Self {
        self.extensions.push(table);
        self
    }

    pub fn build(self) -> core::result::Result<Kernel, KernelError> {
        if let Err(error) = self.config.validate() {
            log::warn!("rejected kernel configuration {:?}: {error}", self.config.name);
            return Err(error.into());
        }
        let state = State::new(&self.config, self.extensions);
        if let Some(trace) = &self.trace {
            let max_priority = state
                .schedulers
                .iter()
                .map(|s| s.max_priority.get())
                .max()
                .unwrap_or_default();
            let info = SystemInfo {
                version: self.config.version,
                processors: self.config.processors as u8,
                schedulers: state.schedulers.len() as u8,
                max_tasks: self.config.maximum_tasks.min(usize::from(u16::MAX)) as u16,
                max_priority,
                ticks_per_timeslice: self.config.ticks_per_timeslice,
            };
            trace(SYSTEM_INFO, &info.payload(), false)?;
        }
        log::debug!(
            "kernel {:?} up with {} processors and {} schedulers",
            self.config.name,
            self.config.processors,
            state.schedulers.len()
        );
        Ok(Kernel {
            state: Mutex::new(state),
            config: self.config,
            trace: self.trace,
            fatal_handler: self.fatal_handler,
        })
    }
}

/// The kernel: owns every kernel object and drives the processors.
pub struct Kernel {
    state: Mutex<State>,
    config: KernelConfig,
    trace: Option<TraceHook>,
    fatal_handler: Option<FatalHandler>,
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> KernelBuilder {
        KernelBuilder::new(config)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn trace_hook(&self) -> Option<TraceHook> {
        self.trace.clone()
    }

    /// Directive interface for initialization code.
    pub fn context(&self) -> Context<'_> {
        Context::new(self, Caller::Init)
    }

    /// Runs `f` as an interrupt handler on `cpu`.
    pub fn interrupt<R>(&self, cpu: CpuIndex, f: impl FnOnce(&mut Context<'_>) -> R) -> R {
        let mut context = Context::new(self, Caller::Isr { cpu });
        f(&mut context)
    }

    /// Clock tick: fires watchdogs and charges timeslices.
    pub fn tick(&self) {
        self.call(|state| {
            state.tick_watchdogs();
            state.tick_timeslices();
        });
    }

    /// Current tick count.
    pub fn now(&self) -> u64 {
        self.peek(|state| state.watchdogs.now())
    }

    pub fn task_snapshot(&self, task: TaskId) -> Result<TaskSnapshot> {
        self.peek(|state| state.task_snapshot(task))
    }

    /// Task allocated to `cpu` by the last dispatch.
    pub fn executing(&self, cpu: CpuIndex) -> Option<TaskId> {
        self.peek(|state| state.processors.get(cpu).and_then(|p| p.executing))
    }

    /// Frees zombie slots. Returns how many were freed.
    pub fn reclaim_zombies(&self) -> usize {
        self.call(State::reclaim_zombies)
    }

    /// Dispatches `cpu` once. Returns whether anything ran.
    pub fn dispatch_on(&self, cpu: CpuIndex) -> bool {
        let (prepared, effects) = {
            let mut state = self.state.lock();
            let prepared = state.prepare_step(cpu);
            (prepared, state.effects.take())
        };
        self.apply(effects);

        let (task, mut body, signals) = match prepared {
            Prepared::Idle => {
                if let Some(idle) = self.config.idle_callback {
                    idle();
                }
                return false;
            }
            Prepared::Busy => return false,
            Prepared::Changed => return true,
            Prepared::Step { task, body, signals } => (task, body, signals),
        };

        let mut context = Context::new(self, Caller::Task { id: task, cpu });
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some((handler, set)) = signals {
                handler(&mut context, set);
            }
            body(&mut context)
        }));

        let effects = {
            let mut state = self.state.lock();
            state.finish_step(task, body, result.as_ref().ok().copied());
            state.allocate();
            state.effects.take()
        };
        self.apply(effects);

        if let Err(payload) = result {
            if !payload.is::<TaskExit>() {
                panic::resume_unwind(payload);
            }
        }
        true
    }

    /// Dispatches every processor once. Returns how many ran something.
    pub fn dispatch_once(&self) -> usize {
        (0..self.config.processors)
            .filter(|cpu| self.dispatch_on(*cpu))
            .count()
    }

    /// Dispatches until no processor has anything to run. Returns the number
    /// of dispatches that ran something.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let ran = self.dispatch_once();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }

    /// Like [`Kernel::run_until_idle`], but stops after `rounds` rounds.
    pub fn run_rounds(&self, rounds: usize) -> usize {
        (0..rounds).map(|_| self.dispatch_once()).sum()
    }

    /// Drives every processor from its own OS thread until the system is
    /// quiescent.
    pub fn run_parallel(&self) {
        std::thread::scope(|scope| {
            for cpu in 0..self.config.processors {
                scope.spawn(move || loop {
                    if self.dispatch_on(cpu) {
                        continue;
                    }
                    if self.peek(State::is_quiescent) {
                        break;
                    }
                    std::thread::yield_now();
                });
            }
        });
    }

    /// Runs `f` inside the critical section and carries out its effects.
    pub(crate) fn call<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let (result, effects) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            state.allocate();
            (result, state.effects.take())
        };
        self.apply(effects);
        result
    }

    /// Read-only access to the kernel state.
    pub(crate) fn peek<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let state = self.state.lock();
        f(&state)
    }

    fn apply(&self, effects: Effects) {
        if let Some(trace) = &self.trace {
            for (record, payload) in &effects.traces {
                if let Err(error) = trace(*record, payload, true) {
                    log::warn!("trace record {record} dropped: {error}");
                }
            }
        }
        for call in effects.calls {
            call();
        }
        match effects.unwind {
            None => {}
            Some(Unwind::Exit) => panic::resume_unwind(Box::new(TaskExit)),
            Some(Unwind::Fatal(fatal)) => self.halt(fatal),
        }
    }

    /// Fatal error: reports, calls the fatal handler and unwinds with the
    /// [`Fatal`] payload.
    pub(crate) fn halt(&self, fatal: Fatal) -> ! {
        log::error!("{fatal}");
        if let Some(trace) = &self.trace {
            let mut payload = PayloadBuilder::with_capacity(5);
            payload
                .push_u8(match fatal.source {
                    FatalSource::InternalError => 0,
                    FatalSource::Application => 1,
                })
                .push_u32(fatal.code);
            let _ = trace(rts::records::FATAL, payload.as_slice(), true);
        }
        if let Some(handler) = &self.fatal_handler {
            handler(fatal.source, fatal.code);
        }
        panic::resume_unwind(Box::new(fatal))
    }
}
