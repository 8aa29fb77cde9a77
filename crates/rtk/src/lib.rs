//! # rtk
//!
//! Scheduling and synchronization core of a symmetric multiprocessing
//! real-time kernel.
//!
//! ## Module Overview
//! - [`kernel`]    – Critical section, dispatcher, clock tick and parallel run.
//! - [`context`]   – Directive interface bound to a caller (init, task, ISR).
//! - task life cycle – creation, start, restart, deletion and zombies.
//! - thread queues – FIFO and priority wait queues with timeouts.
//! - scheduler     – Instances, affinity, fixed priority and EDF.
//! - semaphores    – Counting, simple binary and mutexes with the
//!   inheritance, ceiling and MrsP locking protocols.
//! - barriers, message queues, rate-monotonic periods, signals and user
//!   extensions.
//!
//! Task bodies are step functions. Each dispatch runs one step on a
//! processor; a directive that blocks returns [`Status::WouldBlock`] and the
//! body repeats it on the next step to collect the outcome.
//!
//! The kernel always links the `rts` trace crate. Records are produced only
//! when a [`TraceHook`] is installed on the [`KernelBuilder`].

mod barrier;
mod config;
pub mod context;
mod cpuset;
mod extension;
pub mod kernel;
mod lifecycle;
mod message;
mod object;
mod period;
mod priority;
mod protocol;
mod scheduler;
mod semaphore;
mod signal;
mod status;
mod sync;
mod task;
mod threadq;
mod watchdog;

pub use barrier::{BarrierAttributes, BarrierInfo};
pub use config::{ConfigError, KernelConfig, KernelConfigBuilder, SchedulerConfig, SchedulerPolicy};
pub use context::Context;
pub use cpuset::{CpuIndex, CpuSet, MAX_PROCESSORS};
pub use extension::{ExtensionTable, LifeExtension, TerminateExtension};
pub use kernel::{FatalHandler, Kernel, KernelBuilder, KernelError};
pub use message::{MessageQueueAttributes, MessageQueueInfo};
pub use object::{BarrierId, ExtensionId, MessageQueueId, ObjectId, PeriodId, SemaphoreId, TaskId};
pub use period::{PeriodState, PeriodStatus};
pub use priority::{Priority, PRIORITY_LEVELS};
pub use protocol::Protocol;
pub use rts::{TraceError, TraceHook};
pub use scheduler::SchedulerId;
pub use semaphore::{SemaphoreAttributes, SemaphoreInfo, SemaphoreKind};
pub use signal::{SignalHandler, SignalSet};
pub use status::{Fatal, FatalSource, InternalError, Result, Status};
pub use task::{
    BlockedState, LifeState, Mode, ModeMask, TaskAction, TaskBody, TaskConfig, TaskSnapshot, TaskState,
    WaitObject,
};
pub use threadq::{Discipline, Timeout};
