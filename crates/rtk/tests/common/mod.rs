//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;
use rtk::{Context, Kernel, KernelConfig, Priority, Status, TaskAction, TaskConfig, TaskId};

struct TestLogger;

impl Log for TestLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:<5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: TestLogger = TestLogger;

static INIT: Lazy<()> = Lazy::new(|| {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
});

pub fn init_logging() {
    Lazy::force(&INIT);
}

/// Shared log the task bodies write to.
pub type Journal<T> = Arc<Mutex<Vec<T>>>;

pub fn journal<T>() -> Journal<T> {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn kernel(processors: usize) -> Kernel {
    init_logging();
    let config = KernelConfig::builder().processors(processors).build();
    Kernel::with_config(config).build().expect("kernel")
}

/// Creates and starts a task from initialization code.
pub fn spawn(
    kernel: &Kernel,
    name: &str,
    priority: u8,
    body: impl FnMut(&mut Context<'_>) -> TaskAction + Send + 'static,
) -> TaskId {
    let mut init = kernel.context();
    let task = init
        .task_create(&TaskConfig::new(name, Priority(priority)))
        .expect("create");
    init.task_start(task, body, 0).expect("start");
    task
}

/// Maps the result of a blocking directive to the action a body returns.
pub fn blocked_or<T>(result: &Result<T, Status>, done: TaskAction) -> TaskAction {
    match result {
        Err(Status::WouldBlock) => TaskAction::Blocked,
        _ => done,
    }
}
