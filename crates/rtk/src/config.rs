//! Kernel configuration.
//!
//! Sizes every object arena, lays out the scheduler instances over the
//! processors and carries the timeslice length. Validation happens once, when
//! the kernel is built.

use core::fmt;

use crate::cpuset::{CpuIndex, CpuSet, MAX_PROCESSORS};
use crate::priority::Priority;

/// Scheduling policy of a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SchedulerPolicy {
    /// Fixed priorities, FIFO among equals.
    FixedPriority,
    /// Earliest deadline first. Tasks without a deadline run in background
    /// priority order.
    Edf,
}

/// One scheduler instance and the processors it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SchedulerConfig {
    pub name: String,
    pub policy: SchedulerPolicy,
    pub processors: CpuSet,
    pub max_priority: Priority,
}

impl SchedulerConfig {
    pub fn fixed_priority(name: impl Into<String>, processors: CpuSet) -> Self {
        Self {
            name: name.into(),
            policy: SchedulerPolicy::FixedPriority,
            processors,
            max_priority: Priority::MAX,
        }
    }

    pub fn edf(name: impl Into<String>, processors: CpuSet) -> Self {
        Self {
            name: name.into(),
            policy: SchedulerPolicy::Edf,
            processors,
            max_priority: Priority::MAX,
        }
    }

    pub fn with_max_priority(mut self, max_priority: Priority) -> Self {
        self.max_priority = max_priority;
        self
    }
}

/// Configuration for the kernel.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KernelConfig {
    pub name: String,
    pub processors: usize,
    /// Scheduler instances. Empty means one fixed-priority instance owning
    /// every processor.
    pub schedulers: Vec<SchedulerConfig>,
    pub maximum_tasks: usize,
    pub maximum_semaphores: usize,
    pub maximum_barriers: usize,
    pub maximum_message_queues: usize,
    pub maximum_periods: usize,
    pub maximum_extensions: usize,
    pub ticks_per_timeslice: u32,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub idle_callback: Option<fn()>,
    pub version: u16,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "rtk".to_string(),
            processors: 1,
            schedulers: Vec::new(),
            maximum_tasks: 32,
            maximum_semaphores: 32,
            maximum_barriers: 8,
            maximum_message_queues: 8,
            maximum_periods: 8,
            maximum_extensions: 4,
            ticks_per_timeslice: 10,
            idle_callback: None,
            version: 300,
        }
    }
}

impl KernelConfig {
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }

    /// Scheduler table after defaulting.
    pub fn effective_schedulers(&self) -> Vec<SchedulerConfig> {
        if self.schedulers.is_empty() {
            vec![SchedulerConfig::fixed_priority(
                "FP",
                CpuSet::first_n(self.processors),
            )]
        } else {
            self.schedulers.clone()
        }
    }

    /// Checks that every processor belongs to exactly one scheduler instance.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processors == 0 {
            return Err(ConfigError::NoProcessors);
        }
        if self.processors > MAX_PROCESSORS {
            return Err(ConfigError::TooManyProcessors(self.processors));
        }
        let all = CpuSet::first_n(self.processors);
        let mut seen = CpuSet::empty();
        let schedulers = self.effective_schedulers();
        for (index, scheduler) in schedulers.iter().enumerate() {
            if scheduler.processors.is_empty() {
                return Err(ConfigError::EmptyScheduler(scheduler.name.clone()));
            }
            if !scheduler.max_priority.is_valid_for(Priority::MAX) {
                return Err(ConfigError::InvalidMaxPriority {
                    scheduler: scheduler.name.clone(),
                    priority: scheduler.max_priority,
                });
            }
            if schedulers[..index].iter().any(|s| s.name == scheduler.name) {
                return Err(ConfigError::DuplicateSchedulerName(scheduler.name.clone()));
            }
            if let Some(cpu) = scheduler.processors.iter().find(|cpu| !all.contains(*cpu)) {
                return Err(ConfigError::ProcessorOutOfRange {
                    scheduler: scheduler.name.clone(),
                    cpu,
                });
            }
            if let Some(cpu) = scheduler.processors.intersection(seen).first() {
                return Err(ConfigError::ProcessorShared { cpu });
            }
            seen = seen.union(scheduler.processors);
        }
        if let Some(cpu) = all.iter().find(|cpu| !seen.contains(*cpu)) {
            return Err(ConfigError::ProcessorUnassigned { cpu });
        }
        Ok(())
    }
}

/// Builder for [`KernelConfig`] with fluent setters.
#[derive(Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn processors(mut self, count: usize) -> Self {
        self.config.processors = count;
        self
    }

    /// Adds a scheduler instance.
    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.config.schedulers.push(scheduler);
        self
    }

    pub fn maximum_tasks(mut self, count: usize) -> Self {
        self.config.maximum_tasks = count;
        self
    }

    pub fn maximum_semaphores(mut self, count: usize) -> Self {
        self.config.maximum_semaphores = count;
        self
    }

    pub fn maximum_barriers(mut self, count: usize) -> Self {
        self.config.maximum_barriers = count;
        self
    }

    pub fn maximum_message_queues(mut self, count: usize) -> Self {
        self.config.maximum_message_queues = count;
        self
    }

    pub fn maximum_periods(mut self, count: usize) -> Self {
        self.config.maximum_periods = count;
        self
    }

    pub fn maximum_extensions(mut self, count: usize) -> Self {
        self.config.maximum_extensions = count;
        self
    }

    pub fn ticks_per_timeslice(mut self, ticks: u32) -> Self {
        self.config.ticks_per_timeslice = ticks;
        self
    }

    /// Called whenever a dispatch round finds nothing to run.
    pub fn idle_callback(mut self, callback: fn()) -> Self {
        self.config.idle_callback = Some(callback);
        self
    }

    pub fn version(mut self, version: u16) -> Self {
        self.config.version = version;
        self
    }

    pub fn build(self) -> KernelConfig {
        self.config
    }
}

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NoProcessors,
    TooManyProcessors(usize),
    EmptyScheduler(String),
    DuplicateSchedulerName(String),
    InvalidMaxPriority { scheduler: String, priority: Priority },
    ProcessorOutOfRange { scheduler: String, cpu: CpuIndex },
    ProcessorShared { cpu: CpuIndex },
    ProcessorUnassigned { cpu: CpuIndex },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoProcessors => write!(f, "at least one processor is required"),
            Self::TooManyProcessors(count) => {
                write!(f, "{count} processors exceed the supported {MAX_PROCESSORS}")
            }
            Self::EmptyScheduler(name) => write!(f, "scheduler {name:?} owns no processor"),
            Self::DuplicateSchedulerName(name) => {
                write!(f, "scheduler name {name:?} used twice")
            }
            Self::InvalidMaxPriority {
                scheduler,
                priority,
            } => write!(f, "scheduler {scheduler:?}: invalid maximum priority {priority}"),
            Self::ProcessorOutOfRange { scheduler, cpu } => {
                write!(f, "scheduler {scheduler:?}: processor {cpu} does not exist")
            }
            Self::ProcessorShared { cpu } => {
                write!(f, "processor {cpu} assigned to more than one scheduler")
            }
            Self::ProcessorUnassigned { cpu } => {
                write!(f, "processor {cpu} not assigned to any scheduler")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
