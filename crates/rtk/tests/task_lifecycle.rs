//! Task life cycle through the public kernel interface.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{blocked_or, journal, kernel, spawn};
use rtk::{
    BlockedState, ExtensionTable, Fatal, FatalSource, Kernel, KernelConfig, Priority, SemaphoreAttributes, Status, TaskAction,
    TaskConfig, TaskState, Timeout,
};

#[test]
fn self_delete_never_returns() {
    let kernel = kernel(1);
    let returned = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&returned);
    let task = spawn(&kernel, "self", 5, move |ctx| {
        let me = ctx.task_id().expect("task context");
        let _ = ctx.task_delete(me);
        flag.store(true, Ordering::SeqCst);
        TaskAction::Continue
    });

    assert_eq!(kernel.run_until_idle(), 1);
    assert!(!returned.load(Ordering::SeqCst));
    let snapshot = kernel.task_snapshot(task).expect("snapshot");
    assert!(snapshot.is_zombie());
    assert_eq!(kernel.context().task_ident("self"), Err(Status::InvalidName));

    assert_eq!(kernel.reclaim_zombies(), 1);
    assert_eq!(kernel.task_snapshot(task), Err(Status::InvalidId));
}

#[test]
fn exit_action_terminates_the_task() {
    let kernel = kernel(1);
    let task = spawn(&kernel, "worker", 3, |ctx| {
        if ctx.iteration() == 2 {
            TaskAction::Exit
        } else {
            TaskAction::Continue
        }
    });
    assert_eq!(kernel.run_until_idle(), 3);
    assert!(kernel.task_snapshot(task).expect("snapshot").is_zombie());
}

#[test]
fn interrupt_cannot_delete() {
    let kernel = kernel(1);
    let task = spawn(&kernel, "victim", 5, |_| TaskAction::Continue);
    let before = kernel.task_snapshot(task).expect("snapshot");

    let status = kernel.interrupt(0, |ctx| ctx.task_delete(task));
    assert_eq!(status, Err(Status::CalledFromIsr));
    assert_eq!(kernel.task_snapshot(task).expect("snapshot"), before);
}

#[test]
fn dormant_task_is_deleted_at_once() {
    let kernel = kernel(1);
    let mut init = kernel.context();
    let task = init
        .task_create(&TaskConfig::new("dormant", Priority(4)))
        .expect("create");
    assert!(kernel.task_snapshot(task).expect("snapshot").is_dormant());

    assert_eq!(init.task_delete(task), Ok(()));
    assert!(kernel.task_snapshot(task).expect("snapshot").is_zombie());
    assert_eq!(init.task_delete(task), Err(Status::InvalidId));
    assert_eq!(init.task_start(task, |_| TaskAction::Exit, 0), Err(Status::InvalidId));
}

#[test]
fn deleting_a_waiting_task_cancels_its_wait() {
    let kernel = kernel(1);
    let mut init = kernel.context();
    let sem = init
        .semaphore_create("sem", 0, SemaphoreAttributes::COUNTING, Priority(1))
        .expect("semaphore");
    let task = spawn(&kernel, "waiter", 5, move |ctx| {
        let result = ctx.semaphore_obtain(sem, Timeout::Ticks(10));
        blocked_or(&result, TaskAction::Exit)
    });

    kernel.run_until_idle();
    let snapshot = kernel.task_snapshot(task).expect("snapshot");
    assert_eq!(snapshot.blocked, BlockedState::Enqueued(rtk::WaitObject::Semaphore(sem)));
    assert!(snapshot.timer_active);

    assert_eq!(init.task_delete(task), Ok(()));
    let snapshot = kernel.task_snapshot(task).expect("snapshot");
    assert!(snapshot.is_zombie());
    assert!(!snapshot.timer_active);
    assert_eq!(snapshot.blocked, BlockedState::Ready);
    assert!(init.semaphore_info(sem).expect("info").waiters.is_empty());
}

#[test]
fn suspended_task_is_deleted() {
    let kernel = kernel(1);
    let mut init = kernel.context();
    let task = spawn(&kernel, "sleeper", 5, |_| TaskAction::Continue);
    init.task_suspend(task).expect("suspend");
    assert_eq!(init.task_suspend(task), Err(Status::AlreadySuspended));
    assert_eq!(init.task_is_suspended(task), Ok(true));

    assert_eq!(init.task_delete(task), Ok(()));
    assert!(kernel.task_snapshot(task).expect("snapshot").is_zombie());
}

#[test]
fn protected_task_terminates_when_protection_drops() {
    let kernel = kernel(1);
    let reached = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&reached);
    let task = spawn(&kernel, "guarded", 5, move |ctx| {
        if ctx.iteration() == 0 {
            assert_eq!(ctx.task_set_protection(true), Ok(false));
        } else {
            let _ = ctx.task_set_protection(false);
            flag.store(true, Ordering::SeqCst);
        }
        TaskAction::Continue
    });

    assert_eq!(kernel.dispatch_once(), 1);
    let mut init = kernel.context();
    assert_eq!(init.task_delete(task), Ok(()));
    let snapshot = kernel.task_snapshot(task).expect("snapshot");
    assert!(snapshot.is_terminating());
    assert!(!snapshot.is_zombie());

    kernel.run_until_idle();
    assert!(!reached.load(Ordering::SeqCst));
    assert!(kernel.task_snapshot(task).expect("snapshot").is_zombie());
}

#[test]
fn restart_resets_the_task() {
    let kernel = kernel(1);
    let arguments = journal();
    let seen = Arc::clone(&arguments);
    let task = spawn(&kernel, "restartable", 5, move |ctx| {
        seen.lock().unwrap().push(ctx.argument());
        TaskAction::Continue
    });

    kernel.dispatch_once();
    kernel.dispatch_once();
    let mut init = kernel.context();
    init.task_set_priority(task, Some(Priority(9))).expect("priority");
    assert_eq!(init.task_restart(task, 7), Ok(()));

    let snapshot = kernel.task_snapshot(task).expect("snapshot");
    assert_eq!(snapshot.iteration, 0);
    assert_eq!(snapshot.argument, 7);
    assert_eq!(snapshot.real_priority, Priority(5));

    kernel.dispatch_once();
    assert_eq!(*arguments.lock().unwrap(), vec![0, 0, 7]);

    let dormant = init
        .task_create(&TaskConfig::new("dormant", Priority(2)))
        .expect("create");
    assert_eq!(init.task_restart(dormant, 0), Err(Status::IncorrectState));
}

#[test]
fn self_restart_starts_over() {
    let kernel = kernel(1);
    let steps = journal();
    let log = Arc::clone(&steps);
    spawn(&kernel, "again", 5, move |ctx| {
        let iteration = ctx.iteration();
        let argument = ctx.argument();
        log.lock().unwrap().push((iteration, argument));
        if iteration == 1 && argument == 0 {
            let me = ctx.task_id().expect("task context");
            let _ = ctx.task_restart(me, 1);
            unreachable!("self restart returned");
        }
        if argument == 1 && iteration == 1 {
            return TaskAction::Exit;
        }
        TaskAction::Continue
    });

    kernel.run_until_idle();
    assert_eq!(*steps.lock().unwrap(), vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
}

#[test]
fn extensions_observe_delete_in_reverse_order() {
    common::init_logging();
    let events = journal();
    let table = |name: &'static str| {
        let terminate = Arc::clone(&events);
        let delete = Arc::clone(&events);
        ExtensionTable::new()
            .with_task_terminate(move |_| terminate.lock().unwrap().push(format!("terminate {name}")))
            .with_task_delete(move |_, _| delete.lock().unwrap().push(format!("delete {name}")))
    };
    let kernel = Kernel::with_config(KernelConfig::default())
        .with_extensions(table("static"))
        .build()
        .expect("kernel");
    let mut init = kernel.context();
    init.extension_create("a", table("a")).expect("a");
    init.extension_create("b", table("b")).expect("b");

    let task = spawn(&kernel, "observed", 5, |_| TaskAction::Continue);
    init.task_delete(task).expect("delete");

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "terminate b",
            "terminate a",
            "terminate static",
            "delete b",
            "delete a",
            "delete static",
        ]
    );
}

#[test]
fn restart_extension_sees_the_restarter() {
    common::init_logging();
    let events = journal();
    let log = Arc::clone(&events);
    let kernel = Kernel::builder()
        .with_extensions(ExtensionTable::new().with_task_restart(move |by, task| {
            log.lock().unwrap().push((by, task.id));
        }))
        .build()
        .expect("kernel");

    let task = spawn(&kernel, "target", 5, |_| TaskAction::Continue);
    let mut init = kernel.context();
    init.task_restart(task, 0).expect("restart");
    assert_eq!(*events.lock().unwrap(), vec![(None, task)]);
}

#[test]
fn higher_priority_deleter_boosts_a_protected_target() {
    let kernel = kernel(1);
    let victim = spawn(&kernel, "victim", 2, |ctx| {
        if ctx.iteration() == 0 {
            let _ = ctx.task_set_protection(true);
            return TaskAction::Continue;
        }
        TaskAction::Continue
    });
    kernel.dispatch_once();

    let deleter = spawn(&kernel, "deleter", 9, move |ctx| {
        assert_eq!(ctx.task_delete(victim), Ok(()));
        TaskAction::Exit
    });
    kernel.dispatch_once();

    let snapshot = kernel.task_snapshot(victim).expect("snapshot");
    assert!(snapshot.is_terminating());
    assert_eq!(snapshot.priority, Priority(9));
    assert_eq!(snapshot.real_priority, Priority(2));
    assert!(kernel.task_snapshot(deleter).expect("snapshot").is_zombie());
    assert_eq!(snapshot.state & TaskState::ZOMBIE, TaskState::empty());
}

#[test]
fn fatal_error_reaches_the_handler_and_halts() {
    common::init_logging();
    let reported = journal();
    let log = Arc::clone(&reported);
    let kernel = Kernel::with_config(KernelConfig::default())
        .with_fatal_handler(move |source, code| log.lock().unwrap().push((source, code)))
        .build()
        .expect("kernel");
    spawn(&kernel, "doomed", 5, |ctx| ctx.fatal(42));

    let halted = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| kernel.run_until_idle()));
    let payload = halted.expect_err("fatal error unwinds out of the dispatcher");
    let fatal = payload.downcast::<Fatal>().expect("fatal payload");
    assert_eq!(*fatal, Fatal { source: FatalSource::Application, code: 42 });
    assert_eq!(*reported.lock().unwrap(), vec![(FatalSource::Application, 42)]);
}
