//! Semaphores, locking protocols, barriers, message queues and signals.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{blocked_or, journal, kernel, spawn};
use rtk::{
    BarrierAttributes, BlockedState, Context, MessageQueueAttributes, Priority, Protocol, SemaphoreAttributes,
    SemaphoreKind, SignalHandler, SignalSet, Status, TaskAction, TaskId, Timeout, WaitObject,
};

const CEILING: SemaphoreAttributes = SemaphoreAttributes::BINARY
    .union(SemaphoreAttributes::PRIORITY)
    .union(SemaphoreAttributes::PRIORITY_CEILING);
const INHERIT: SemaphoreAttributes = SemaphoreAttributes::BINARY
    .union(SemaphoreAttributes::PRIORITY)
    .union(SemaphoreAttributes::INHERIT_PRIORITY);
const MRSP: SemaphoreAttributes = SemaphoreAttributes::BINARY
    .union(SemaphoreAttributes::PRIORITY)
    .union(SemaphoreAttributes::MULTIPROCESSOR_RESOURCE_SHARING);

fn priority_of(ctx: &Context<'_>, task: TaskId) -> Priority {
    ctx.task_snapshot(task).expect("snapshot").priority
}

fn waiters_release_order(attributes: SemaphoreAttributes) -> Vec<&'static str> {
    let kernel = kernel(1);
    let mut init = kernel.context();
    let sem = init
        .semaphore_create("sem", 0, attributes, Priority(1))
        .expect("semaphore");
    let order = journal();
    let mut tasks = Vec::new();
    for (name, priority) in [("low", 3), ("high", 5), ("mid", 4)] {
        let log = Arc::clone(&order);
        tasks.push(spawn(&kernel, name, priority, move |ctx| {
            let result = ctx.semaphore_obtain(sem, Timeout::Forever);
            if result.is_ok() {
                log.lock().unwrap().push(name);
            }
            blocked_or(&result, TaskAction::Exit)
        }));
    }
    kernel.run_until_idle();
    assert_eq!(init.semaphore_info(sem).expect("info").waiters.len(), 3);

    // Raise the last arrival above everyone else.
    init.task_set_priority(tasks[0], Some(Priority(9))).expect("priority");
    for _ in 0..3 {
        init.semaphore_release(sem).expect("release");
        kernel.run_until_idle();
    }
    let order = order.lock().unwrap().clone();
    order
}

#[test]
fn fifo_semaphore_releases_in_arrival_order() {
    assert_eq!(
        waiters_release_order(SemaphoreAttributes::FIFO),
        vec!["high", "mid", "low"]
    );
}

#[test]
fn priority_semaphore_releases_most_urgent_first() {
    assert_eq!(
        waiters_release_order(SemaphoreAttributes::PRIORITY),
        vec!["low", "high", "mid"]
    );
}

#[test]
fn counting_semaphore_without_waiting() {
    let kernel = kernel(1);
    let mut init = kernel.context();
    let sem = init
        .semaphore_create("count", 2, SemaphoreAttributes::COUNTING, Priority(1))
        .expect("semaphore");
    assert_eq!(init.semaphore_obtain(sem, Timeout::NoWait), Ok(()));
    assert_eq!(init.semaphore_obtain(sem, Timeout::NoWait), Ok(()));
    assert_eq!(init.semaphore_obtain(sem, Timeout::NoWait), Err(Status::Unsatisfied));
    assert_eq!(init.semaphore_obtain(sem, Timeout::Forever), Err(Status::Unsatisfied));
    assert_eq!(
        kernel.interrupt(0, |ctx| ctx.semaphore_obtain(sem, Timeout::Forever)),
        Err(Status::CalledFromIsr)
    );
    kernel.interrupt(0, |ctx| ctx.semaphore_release(sem)).expect("release");
    assert_eq!(init.semaphore_info(sem).expect("info").count, 1);
}

#[test]
fn timed_wait_expires() {
    let kernel = kernel(1);
    let mut init = kernel.context();
    let sem = init
        .semaphore_create("sem", 0, SemaphoreAttributes::COUNTING, Priority(1))
        .expect("semaphore");
    let outcome = journal();
    let log = Arc::clone(&outcome);
    spawn(&kernel, "waiter", 5, move |ctx| {
        let result = ctx.semaphore_obtain(sem, Timeout::Ticks(3));
        if result != Err(Status::WouldBlock) {
            log.lock().unwrap().push((result, ctx.kernel().now()));
        }
        blocked_or(&result, TaskAction::Exit)
    });

    kernel.run_until_idle();
    for _ in 0..3 {
        kernel.tick();
        kernel.run_until_idle();
    }
    assert_eq!(*outcome.lock().unwrap(), vec![(Err(Status::Timeout), 3)]);
}

#[test]
fn ceiling_raises_owner_and_reverts_exactly() {
    let kernel = kernel(1);
    let mut init = kernel.context();
    let mutex = init
        .semaphore_create("ceiling", 1, CEILING, Priority(10))
        .expect("mutex");
    assert_eq!(
        init.semaphore_info(mutex).expect("info").kind,
        SemaphoreKind::Mutex(Protocol::Ceiling)
    );
    let seen = journal();
    let log = Arc::clone(&seen);
    spawn(&kernel, "holder", 3, move |ctx| {
        let me = ctx.task_id().expect("task context");
        ctx.semaphore_obtain(mutex, Timeout::Forever).expect("obtain");
        log.lock().unwrap().push(priority_of(ctx, me));
        ctx.semaphore_obtain(mutex, Timeout::Forever).expect("nested obtain");
        ctx.semaphore_release(mutex).expect("inner release");
        log.lock().unwrap().push(priority_of(ctx, me));
        ctx.semaphore_release(mutex).expect("outer release");
        log.lock().unwrap().push(priority_of(ctx, me));
        TaskAction::Exit
    });
    let urgent = journal();
    let log = Arc::clone(&urgent);
    spawn(&kernel, "too-urgent", 12, move |ctx| {
        log.lock().unwrap().push(ctx.semaphore_obtain(mutex, Timeout::Forever));
        TaskAction::Exit
    });

    kernel.run_until_idle();
    assert_eq!(*urgent.lock().unwrap(), vec![Err(Status::InvalidPriority)]);
    assert_eq!(*seen.lock().unwrap(), vec![Priority(10), Priority(10), Priority(3)]);
}

#[test]
fn inheritance_raises_owner_to_its_waiter() {
    let kernel = kernel(1);
    let mut init = kernel.context();
    let mutex = init
        .semaphore_create("inherit", 1, INHERIT, Priority(1))
        .expect("mutex");
    let low = spawn(&kernel, "low", 2, move |ctx| {
        if ctx.iteration() == 0 {
            ctx.semaphore_obtain(mutex, Timeout::Forever).expect("obtain");
            return TaskAction::Continue;
        }
        ctx.semaphore_release(mutex).expect("release");
        TaskAction::Exit
    });
    assert_eq!(kernel.dispatch_once(), 1);

    let acquired = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&acquired);
    let high = spawn(&kernel, "high", 8, move |ctx| {
        let result = ctx.semaphore_obtain(mutex, Timeout::Forever);
        if result.is_ok() {
            count.fetch_add(1, Ordering::SeqCst);
            ctx.semaphore_release(mutex).expect("release");
        }
        blocked_or(&result, TaskAction::Exit)
    });
    assert_eq!(kernel.dispatch_once(), 1);
    assert_eq!(kernel.task_snapshot(low).expect("snapshot").priority, Priority(8));
    assert_eq!(init.semaphore_info(mutex).expect("info").waiters, vec![high]);

    kernel.dispatch_once();
    let info = init.semaphore_info(mutex).expect("info");
    assert_eq!(info.owner, Some(high));
    assert!(kernel.task_snapshot(low).expect("snapshot").is_zombie());

    kernel.run_until_idle();
    assert_eq!(acquired.load(Ordering::SeqCst), 1);
    assert_eq!(init.semaphore_info(mutex).expect("info").owner, None);
}

#[test]
fn mutex_rules() {
    let kernel = kernel(1);
    let mut init = kernel.context();
    let mutex = init
        .semaphore_create("plain", 1, SemaphoreAttributes::BINARY, Priority(1))
        .expect("mutex");
    assert_eq!(init.semaphore_obtain(mutex, Timeout::NoWait), Err(Status::IncorrectState));
    assert_eq!(init.semaphore_release(mutex), Err(Status::NotOwnerOfResource));
    assert_eq!(
        init.semaphore_create("bad", 2, SemaphoreAttributes::BINARY, Priority(1)),
        Err(Status::InvalidNumber)
    );
    assert_eq!(
        init.semaphore_create("bad", 1, SemaphoreAttributes::BINARY | SemaphoreAttributes::INHERIT_PRIORITY, Priority(1)),
        Err(Status::NotDefined)
    );

    let results = journal();
    let log = Arc::clone(&results);
    spawn(&kernel, "owner", 5, move |ctx| {
        ctx.semaphore_obtain(mutex, Timeout::Forever).expect("obtain");
        log.lock().unwrap().push(ctx.semaphore_delete(mutex));
        ctx.semaphore_release(mutex).expect("release");
        log.lock().unwrap().push(ctx.semaphore_delete(mutex));
        TaskAction::Exit
    });
    kernel.run_until_idle();
    assert_eq!(*results.lock().unwrap(), vec![Err(Status::ResourceInUse), Ok(())]);
}

#[test]
fn mrsp_rules() {
    let kernel = kernel(1);
    let mut init = kernel.context();
    assert_eq!(
        init.semaphore_create("mrsp", 0, MRSP, Priority(6)),
        Err(Status::InvalidNumber)
    );
    let outer = init.semaphore_create("outer", 1, MRSP, Priority(6)).expect("outer");
    let inner = init.semaphore_create("inner", 1, MRSP, Priority(7)).expect("inner");
    assert_eq!(init.semaphore_flush(outer), Err(Status::NotDefined));

    let results = journal();
    let log = Arc::clone(&results);
    spawn(&kernel, "nested", 4, move |ctx| {
        let me = ctx.task_id().expect("task context");
        ctx.semaphore_obtain(outer, Timeout::Forever).expect("outer");
        log.lock().unwrap().push(ctx.semaphore_obtain(outer, Timeout::Forever));
        ctx.semaphore_obtain(inner, Timeout::Forever).expect("inner");
        assert_eq!(priority_of(ctx, me), Priority(7));
        log.lock().unwrap().push(ctx.semaphore_release(outer));
        log.lock().unwrap().push(ctx.semaphore_release(inner));
        log.lock().unwrap().push(ctx.semaphore_release(outer));
        TaskAction::Exit
    });
    kernel.run_until_idle();
    assert_eq!(
        *results.lock().unwrap(),
        vec![Err(Status::Unsatisfied), Err(Status::IncorrectState), Ok(()), Ok(())]
    );
}

#[test]
fn ceiling_can_be_read_and_changed() {
    let kernel = kernel(1);
    let mut init = kernel.context();
    let scheduler = init.scheduler_of_processor(0).expect("scheduler");
    let mutex = init
        .semaphore_create("ceiling", 1, CEILING, Priority(10))
        .expect("mutex");
    assert_eq!(init.semaphore_set_priority(mutex, scheduler, None), Ok(Priority(10)));
    assert_eq!(
        init.semaphore_set_priority(mutex, scheduler, Some(Priority(12))),
        Ok(Priority(10))
    );
    assert_eq!(init.semaphore_set_priority(mutex, scheduler, None), Ok(Priority(12)));
    assert_eq!(
        init.semaphore_set_priority(mutex, scheduler, Some(Priority(0))),
        Err(Status::InvalidPriority)
    );

    let counting = init
        .semaphore_create("count", 0, SemaphoreAttributes::COUNTING, Priority(1))
        .expect("counting");
    assert_eq!(
        init.semaphore_set_priority(counting, scheduler, None),
        Err(Status::NotDefined)
    );
}

#[test]
fn automatic_barrier_releases_on_last_arrival() {
    let kernel = kernel(1);
    let mut init = kernel.context();
    let barrier = init
        .barrier_create("meet", BarrierAttributes::AUTOMATIC_RELEASE, 3)
        .expect("barrier");
    let passed = Arc::new(AtomicUsize::new(0));
    for name in ["a", "b"] {
        let count = Arc::clone(&passed);
        spawn(&kernel, name, 5, move |ctx| {
            let result = ctx.barrier_wait(barrier, Timeout::Forever);
            if result.is_ok() {
                count.fetch_add(1, Ordering::SeqCst);
            }
            blocked_or(&result, TaskAction::Exit)
        });
    }
    kernel.run_until_idle();
    assert_eq!(passed.load(Ordering::SeqCst), 0);
    assert_eq!(init.barrier_info(barrier).expect("info").waiters.len(), 2);

    let count = Arc::clone(&passed);
    spawn(&kernel, "c", 5, move |ctx| {
        let result = ctx.barrier_wait(barrier, Timeout::Forever);
        if result.is_ok() {
            count.fetch_add(1, Ordering::SeqCst);
        }
        blocked_or(&result, TaskAction::Exit)
    });
    kernel.run_until_idle();
    assert_eq!(passed.load(Ordering::SeqCst), 3);
}

#[test]
fn manual_barrier_is_released_explicitly() {
    let kernel = kernel(1);
    let mut init = kernel.context();
    let barrier = init
        .barrier_create("gate", BarrierAttributes::MANUAL_RELEASE, 0)
        .expect("barrier");
    assert_eq!(init.barrier_ident("gate"), Ok(barrier));
    for name in ["a", "b", "c"] {
        spawn(&kernel, name, 5, move |ctx| {
            let result = ctx.barrier_wait(barrier, Timeout::Forever);
            blocked_or(&result, TaskAction::Exit)
        });
    }
    kernel.run_until_idle();
    assert_eq!(init.barrier_release_n(barrier, 1), Ok(1));
    assert_eq!(init.barrier_release(barrier), Ok(2));
    assert_eq!(init.barrier_release(barrier), Ok(0));
    assert_eq!(init.barrier_delete(barrier), Ok(()));
    assert_eq!(init.barrier_info(barrier), Err(Status::InvalidId));
}

#[test]
fn deleting_a_period_releases_its_waiting_owner() {
    let kernel = kernel(1);
    let results = journal();
    let log = Arc::clone(&results);
    let mut period = None;
    let owner = spawn(&kernel, "periodic", 5, move |ctx| match period {
        None => {
            let id = ctx.period_create("p").expect("period");
            ctx.period(id, 3).expect("start");
            period = Some(id);
            TaskAction::Continue
        }
        Some(id) => {
            let result = ctx.period(id, 3);
            if result == Err(Status::WouldBlock) {
                return TaskAction::Blocked;
            }
            log.lock().unwrap().push(result);
            TaskAction::Exit
        }
    });
    kernel.run_until_idle();

    let mut init = kernel.context();
    let id = init.period_ident("p").expect("ident");
    let waiting = init.task_snapshot(owner).expect("snapshot");
    assert_eq!(waiting.blocked, BlockedState::Plain(WaitObject::Period(id)));

    init.period_delete(id).expect("delete");
    assert_eq!(init.period_status(id), Err(Status::InvalidId));
    kernel.run_until_idle();
    assert_eq!(*results.lock().unwrap(), vec![Err(Status::ObjectWasDeleted)]);

    // The expired timer of a deleted period must not touch the former owner.
    for _ in 0..5 {
        kernel.tick();
    }
    kernel.run_until_idle();
    assert_eq!(results.lock().unwrap().len(), 1);
}

#[test]
fn message_queue_hands_messages_to_waiting_receiver() {
    let kernel = kernel(1);
    let mut init = kernel.context();
    let queue = init
        .message_queue_create("mq", 2, 8, MessageQueueAttributes::FIFO)
        .expect("queue");
    let received = journal();
    let log = Arc::clone(&received);
    spawn(&kernel, "receiver", 5, move |ctx| {
        let result = ctx.message_queue_receive(queue, Timeout::Forever);
        if let Ok(message) = &result {
            log.lock().unwrap().push(message.clone());
        }
        blocked_or(&result, TaskAction::Exit)
    });
    kernel.run_until_idle();
    assert_eq!(init.message_queue_info(queue).expect("info").waiters.len(), 1);

    init.message_queue_send(queue, b"one").expect("send");
    assert_eq!(init.message_queue_pending(queue), Ok(0));
    kernel.run_until_idle();
    assert_eq!(*received.lock().unwrap(), vec![b"one".to_vec()]);
}

#[test]
fn message_queue_buffers_without_receivers() {
    let kernel = kernel(1);
    let mut init = kernel.context();
    let queue = init
        .message_queue_create("mq", 2, 8, MessageQueueAttributes::FIFO)
        .expect("queue");
    assert_eq!(init.message_queue_ident("mq"), Ok(queue));

    init.message_queue_send(queue, b"two").expect("send");
    init.message_queue_urgent(queue, b"zero").expect("urgent");
    assert_eq!(init.message_queue_send(queue, b"three"), Err(Status::TooMany));
    assert_eq!(init.message_queue_send(queue, b"far too long"), Err(Status::InvalidSize));
    assert_eq!(init.message_queue_pending(queue), Ok(2));

    assert_eq!(init.message_queue_receive(queue, Timeout::NoWait), Ok(b"zero".to_vec()));
    assert_eq!(init.message_queue_flush(queue), Ok(1));
    assert_eq!(init.message_queue_receive(queue, Timeout::NoWait), Err(Status::Unsatisfied));
    assert_eq!(init.message_queue_broadcast(queue, b"all"), Ok(0));
    assert_eq!(init.message_queue_delete(queue), Ok(()));
    assert_eq!(init.message_queue_pending(queue), Err(Status::InvalidId));
}

#[test]
fn signals_run_before_the_next_step() {
    let kernel = kernel(1);
    let caught = journal();
    let log = Arc::clone(&caught);
    let task = spawn(&kernel, "catcher", 5, move |ctx| {
        if ctx.iteration() == 0 {
            let log = Arc::clone(&log);
            let handler: SignalHandler = Arc::new(move |_: &mut Context<'_>, set: SignalSet| {
                log.lock().unwrap().push(set);
            });
            ctx.signal_catch(Some(handler)).expect("catch");
            return TaskAction::Continue;
        }
        TaskAction::Exit
    });
    let mut init = kernel.context();
    assert_eq!(init.signal_send(task, SignalSet::SIGNAL_0), Err(Status::NotDefined));
    kernel.dispatch_once();

    assert_eq!(init.signal_send(task, SignalSet::empty()), Err(Status::InvalidNumber));
    init.signal_send(task, SignalSet::SIGNAL_0).expect("send");
    kernel
        .interrupt(0, |ctx| ctx.signal_send(task, SignalSet::SIGNAL_2))
        .expect("send");
    kernel.run_until_idle();
    assert_eq!(*caught.lock().unwrap(), vec![SignalSet::SIGNAL_0 | SignalSet::SIGNAL_2]);
}
