//! Tests for KernelConfig builder and kernel construction.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use rtk::{ConfigError, CpuSet, Kernel, KernelConfig, KernelError, Priority, SchedulerConfig, SchedulerPolicy};
use rts::system::{SystemInfo, SYSTEM_INFO};
use rts::records::{sched, task};
use rts::{MemoryBackend, TraceConfig, Tracer};

#[test]
fn kernel_config_builder() {
    let config = KernelConfig::builder()
        .name("TestKernel")
        .processors(4)
        .maximum_tasks(64)
        .maximum_semaphores(16)
        .ticks_per_timeslice(5)
        .version(301)
        .build();

    assert_eq!(config.name, "TestKernel");
    assert_eq!(config.processors, 4);
    assert_eq!(config.maximum_tasks, 64);
    assert_eq!(config.maximum_semaphores, 16);
    assert_eq!(config.ticks_per_timeslice, 5);
    assert_eq!(config.version, 301);
}

#[test]
fn kernel_config_default() {
    let config = KernelConfig::default();

    assert_eq!(config.name, "rtk");
    assert_eq!(config.processors, 1);
    assert_eq!(config.maximum_tasks, 32);
    assert_eq!(config.version, 300);
    assert!(config.idle_callback.is_none());

    let schedulers = config.effective_schedulers();
    assert_eq!(schedulers.len(), 1);
    assert_eq!(schedulers[0].policy, SchedulerPolicy::FixedPriority);
    assert_eq!(schedulers[0].processors, CpuSet::first_n(1));
}

#[test]
fn kernel_with_custom_config() {
    common::init_logging();
    let config = KernelConfig::builder()
        .name("CustomKernel")
        .processors(2)
        .scheduler(SchedulerConfig::fixed_priority("A", CpuSet::single(0)))
        .scheduler(SchedulerConfig::edf("B", CpuSet::single(1)).with_max_priority(Priority(20)))
        .build();

    let kernel = Kernel::with_config(config).build().expect("kernel");
    assert_eq!(kernel.config().name, "CustomKernel");

    let init = kernel.context();
    let b = init.scheduler_ident("B").expect("ident");
    assert_eq!(init.scheduler_of_processor(1), Ok(b));
    assert_eq!(init.scheduler_max_priority(b), Ok(Priority(20)));
    assert_eq!(init.scheduler_processors(b), Ok(CpuSet::single(1)));
}

#[test]
fn shared_processor_is_rejected() {
    common::init_logging();
    let config = KernelConfig::builder()
        .processors(2)
        .scheduler(SchedulerConfig::fixed_priority("A", CpuSet::first_n(2)))
        .scheduler(SchedulerConfig::fixed_priority("B", CpuSet::single(1)))
        .build();

    match Kernel::with_config(config).build() {
        Err(KernelError::Config(error)) => assert_eq!(error, ConfigError::ProcessorShared { cpu: 1 }),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("configuration accepted"),
    }
}

#[test]
fn unassigned_processor_is_rejected() {
    let config = KernelConfig::builder()
        .processors(2)
        .scheduler(SchedulerConfig::fixed_priority("A", CpuSet::single(0)))
        .build();
    assert_eq!(config.validate(), Err(ConfigError::ProcessorUnassigned { cpu: 1 }));
}

static IDLE_CALLS: AtomicUsize = AtomicUsize::new(0);

fn idle_callback() {
    IDLE_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn kernel_idle_callback() {
    common::init_logging();
    let config = KernelConfig::builder().idle_callback(idle_callback).build();
    assert!(config.idle_callback.is_some());

    let kernel = Kernel::with_config(config).build().expect("kernel");
    assert_eq!(kernel.run_until_idle(), 0);
    assert!(IDLE_CALLS.load(Ordering::SeqCst) >= 1);
}

#[test]
fn build_emits_system_info() {
    common::init_logging();
    let backend = MemoryBackend::new();
    let tracer = Tracer::new(
        TraceConfig {
            include_timestamp: false,
            ..TraceConfig::default()
        },
        backend.clone(),
    )
    .into_handle();

    let config = KernelConfig::builder().processors(2).version(302).build();
    let _kernel = Kernel::with_config(config)
        .with_trace_hook(tracer.hook())
        .build()
        .expect("kernel");

    let records = backend.records(false).expect("decode");
    assert_eq!(records[0].record_type, SYSTEM_INFO);
    let info = SystemInfo::from_payload(&records[0].payload).expect("system info");
    assert_eq!(info.version, 302);
    assert_eq!(info.processors, 2);
    assert_eq!(info.schedulers, 1);
    assert_eq!(info.max_priority, Priority::MAX.get());
}

#[test]
fn task_life_is_traced_after_the_fact() {
    common::init_logging();
    let backend = MemoryBackend::new();
    let tracer = Tracer::new(
        TraceConfig {
            include_timestamp: false,
            ..TraceConfig::default()
        },
        backend.clone(),
    )
    .into_handle();
    let kernel = Kernel::with_config(KernelConfig::default())
        .with_trace_hook(tracer.hook())
        .build()
        .expect("kernel");

    common::spawn(&kernel, "once", 5, |_| rtk::TaskAction::Exit);
    assert_eq!(kernel.run_until_idle(), 1);

    let expected = [task::CREATE, task::START, sched::NEXT, task::DELETE];
    let types = backend.record_types();
    let mut remaining = types.iter();
    for record_type in expected {
        assert!(
            remaining.any(|t| *t == record_type),
            "record {record_type} missing or out of order in {types:?}"
        );
    }
}
