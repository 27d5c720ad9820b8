/*
 * Fiber Scheduler Tests
 *
 * Queue bookkeeping of the cooperative layer: startup, run placement and
 * wakeups, round-robin yields, targeted yields, join/exit draining, and
 * fork. Context switches go through the simulated platform, which records
 * them; fiber routines run for real when the wrapper is driven.
 */

use alloc::sync::Arc;

use crate::fiber::fiber::FiberStatus;
use crate::fiber::{FiberConfig, FiberError, FiberPlacement, FiberSystem, Quiescence, YieldOutcome};
use crate::platform::SimPlatform;
use crate::sched::types::CpuId;

const CPU0: CpuId = CpuId(0);
const CPU1: CpuId = CpuId(1);

fn fsys(num_cpus: usize, cfg: FiberConfig) -> (Arc<SimPlatform>, FiberSystem) {
    let platform = Arc::new(SimPlatform::new(num_cpus));
    let f = FiberSystem::new(platform.clone(), num_cpus, cfg);
    for i in 0..num_cpus {
        f.startup(CpuId(i as u32)).unwrap();
    }
    (platform, f)
}

fn nop(input: usize) -> usize {
    input
}

fn double(input: usize) -> usize {
    input * 2
}

#[test]
fn startup_installs_the_idle_fiber() {
    let (_p, f) = fsys(1, FiberConfig::default());
    let cur = f.current(CPU0).expect("fiber context is up");
    assert!(cur.is_idle());
    assert_eq!(cur.status(), FiberStatus::Run);
    assert_eq!(f.queue_len(CPU0), 0);
}

#[test]
fn idle_yield_with_empty_queue_does_nothing() {
    let (p, f) = fsys(1, FiberConfig::default());
    assert_eq!(f.yield_now(CPU0), Ok(YieldOutcome::NothingToDo));
    assert!(p.fiber_switch_log(CPU0).is_empty());
}

#[test]
fn run_queues_and_yield_switches() {
    let (p, f) = fsys(1, FiberConfig::default());
    let fib = f.start(CPU0, nop, 7, None, FiberPlacement::Current).unwrap();
    assert_eq!(fib.status(), FiberStatus::Ready);
    assert_eq!(f.queue_len(CPU0), 1);

    assert_eq!(f.yield_now(CPU0), Ok(YieldOutcome::Switched));
    let cur = f.current(CPU0).unwrap();
    assert_eq!(cur.id, fib.id);
    assert_eq!(cur.status(), FiberStatus::Run);
    // the idle fiber does not ride the queue
    assert_eq!(f.queue_len(CPU0), 0);
    assert_eq!(p.fiber_switch_log(CPU0).len(), 1);
}

#[test]
fn yield_rotates_fifo() {
    let (_p, f) = fsys(1, FiberConfig::default());
    let f1 = f.start(CPU0, nop, 1, None, FiberPlacement::Current).unwrap();
    let f2 = f.start(CPU0, nop, 2, None, FiberPlacement::Current).unwrap();

    f.yield_now(CPU0).unwrap(); // idle -> f1
    assert_eq!(f.current(CPU0).unwrap().id, f1.id);
    f.yield_now(CPU0).unwrap(); // f1 -> f2, f1 re-queued
    assert_eq!(f.current(CPU0).unwrap().id, f2.id);
    assert_eq!(f1.status(), FiberStatus::Ready);
    f.yield_now(CPU0).unwrap(); // f2 -> f1
    assert_eq!(f.current(CPU0).unwrap().id, f1.id);
}

#[test]
fn yield_to_extracts_the_target() {
    let (_p, f) = fsys(1, FiberConfig::default());
    let f1 = f.start(CPU0, nop, 1, None, FiberPlacement::Current).unwrap();
    let f2 = f.start(CPU0, nop, 2, None, FiberPlacement::Current).unwrap();
    let _ = f1;

    // jump the queue straight to f2
    assert_eq!(f.yield_to(CPU0, &f2, false), Ok(YieldOutcome::Switched));
    assert_eq!(f.current(CPU0).unwrap().id, f2.id);
}

#[test]
fn yield_to_unready_target_returns_early_when_asked() {
    let (_p, f) = fsys(1, FiberConfig::default());
    let f1 = f.start(CPU0, nop, 1, None, FiberPlacement::Current).unwrap();
    // a fiber that is not READY (still Init, never queued) cannot be
    // yielded to
    let loner = f.create(nop, 9, None).unwrap();

    assert_eq!(f.yield_to(CPU0, &loner, true), Err(FiberError::NotReady));

    // without the early-return flag we fall back to round robin
    assert_eq!(
        f.yield_to(CPU0, &loner, false),
        Ok(YieldOutcome::SwitchedElsewhere)
    );
    assert_eq!(f.current(CPU0).unwrap().id, f1.id);
}

#[test]
fn run_on_remote_cpu_wakes_its_fiber_thread() {
    let cfg = FiberConfig {
        quiescence: Quiescence::Sleep(1_000_000),
        ..FiberConfig::default()
    };
    let (p, f) = fsys(2, cfg);
    let fib = f.create(nop, 0, None).unwrap();
    f.run(CPU0, &fib, FiberPlacement::On(CPU1)).unwrap();

    assert_eq!(f.queue_len(CPU1), 1);
    assert_eq!(fib.inner.lock().curr_cpu, Some(CPU1));
    assert_eq!(p.fiber_wake_count(CPU1), 1);
    // spinning fiber threads are never woken
    assert_eq!(p.fiber_wake_count(CPU0), 0);
}

#[test]
fn join_parks_and_exit_releases() {
    let (_p, f) = fsys(1, FiberConfig::default());
    let worker = f.start(CPU0, double, 21, None, FiberPlacement::Current).unwrap();
    let joiner = f.start(CPU0, nop, 0, None, FiberPlacement::Current).unwrap();

    f.yield_now(CPU0).unwrap(); // idle -> worker
    f.yield_now(CPU0).unwrap(); // worker -> joiner, worker re-queued
    assert_eq!(f.current(CPU0).unwrap().id, joiner.id);

    // the joiner parks on the worker's wait queue and the worker resumes
    f.join(CPU0, &worker).unwrap();
    assert_eq!(joiner.status(), FiberStatus::Wait);
    assert_eq!(worker.waiter_count(), 1);
    assert_eq!(f.current(CPU0).unwrap().id, worker.id);

    // drive the worker to completion: the wrapper runs the routine and
    // exits, releasing every waiter back into a run queue. On a one-CPU
    // system the released joiner lands on this very queue and is the next
    // round-robin pick.
    f.fiber_wrapper(CPU0, &worker);

    assert!(worker.is_done());
    assert_eq!(worker.output(), Some(42));
    assert!(worker.stack.lock().is_none(), "the dead stack is freed");
    assert_eq!(f.current(CPU0).unwrap().id, joiner.id);
    assert_eq!(joiner.status(), FiberStatus::Run);
    assert_eq!(f.queue_len(CPU0), 0);

    // joining a finished fiber fails cleanly
    assert_eq!(f.join(CPU0, &worker), Err(FiberError::Exiting));
}

#[test]
fn fork_queues_a_child_with_its_own_stack() {
    let (_p, f) = fsys(1, FiberConfig::default());
    let parent = f.start(CPU0, nop, 5, None, FiberPlacement::Current).unwrap();
    f.yield_now(CPU0).unwrap();
    assert_eq!(f.current(CPU0).unwrap().id, parent.id);

    let child = f.fork(CPU0).expect("fork returns the child handle");

    // parent and child are distinct fibers on distinct stacks
    assert_ne!(child.id, parent.id);
    assert!(child.stack.lock().is_some());
    assert_eq!(child.stack_size, parent.stack_size);
    assert_eq!(child.status(), FiberStatus::Ready);
    assert_eq!(f.queue_len(CPU0), 1);
}

#[test]
fn fork_honors_the_fork_cpu_knob() {
    let (_p, f) = fsys(2, FiberConfig::default());
    let parent = f.start(CPU0, nop, 5, None, FiberPlacement::Current).unwrap();
    f.yield_now(CPU0).unwrap();
    assert_eq!(f.current(CPU0).unwrap().id, parent.id);

    f.set_fork_cpu(CPU0, FiberPlacement::On(CPU1)).unwrap();
    let child = f.fork(CPU0).unwrap();
    assert_eq!(child.inner.lock().curr_cpu, Some(CPU1));
    assert_eq!(f.queue_len(CPU1), 1);

    // an out-of-range knob is rejected
    assert_eq!(
        f.set_fork_cpu(CPU0, FiberPlacement::On(CpuId(9))),
        Err(FiberError::InvalidCpu)
    );
}
