/*
 * Lifecycle Tests
 *
 * Thread creation, registration, exit, and reaping against the global
 * registry, plus tid lookup and the reaper's idempotence.
 */

use super::sim_system;
use crate::platform::Platform;
use crate::sched::types::{Constraints, CpuId, Placement, RtStatus, ThreadStatus};

const CPU0: CpuId = CpuId(0);

#[test]
fn create_admit_exit_reap_roundtrip() {
    let (_p, sys) = sim_system(1);
    let baseline = sys.num_threads();

    let t = sys.create_thread("mortal", Some(Constraints::aperiodic(10)), None);
    let tid = t.tid;
    assert_eq!(sys.num_threads(), baseline + 1);
    sys.make_runnable(CPU0, &t, Placement::Local, true).unwrap();

    // get it onto the CPU, then take it off for good
    sys.yield_now(CPU0);
    assert_eq!(sys.current(CPU0).tid, tid);
    sys.exit(CPU0);

    {
        let rt = t.rt.lock();
        assert_eq!(rt.status, RtStatus::Exiting);
        assert_eq!(rt.thread_status, ThreadStatus::Exited);
    }
    assert!(sys.current(CPU0).tid != tid);

    // the reaper may run any number of times; the thread list returns to
    // its original size and stays there
    assert_eq!(sys.reap(), 1);
    assert_eq!(sys.num_threads(), baseline);
    assert_eq!(sys.reap(), 0);
    assert_eq!(sys.num_threads(), baseline);
    assert!(sys.find_thread_by_tid(tid).is_none());
}

#[test]
fn find_thread_by_tid_walks_the_registry() {
    let (_p, sys) = sim_system(2);
    let t = sys.create_thread("needle", None, None);
    let found = sys.find_thread_by_tid(t.tid).expect("registered thread");
    assert_eq!(found.tid, t.tid);
    assert!(sys
        .find_thread_by_tid(crate::sched::types::ThreadId(0xdead))
        .is_none());
}

#[test]
fn unbound_threads_get_a_random_initial_cpu() {
    let (_p, sys) = sim_system(4);
    // bound threads stay put; unbound ones land somewhere valid
    let bound = sys.create_thread("bound", None, Some(CpuId(3)));
    assert_eq!(bound.current_cpu(), CpuId(3));

    for _ in 0..16 {
        let t = sys.create_thread("roam", None, None);
        assert!(t.current_cpu().as_usize() < 4);
    }
}

#[test]
fn reap_ignores_live_threads() {
    let (_p, sys) = sim_system(1);
    let t = sys.create_thread("alive", Some(Constraints::aperiodic(5)), None);
    sys.make_runnable(CPU0, &t, Placement::Local, true).unwrap();
    let n = sys.num_threads();
    assert_eq!(sys.reap(), 0);
    assert_eq!(sys.num_threads(), n);
}

#[test]
fn exit_time_is_recorded() {
    let (p, sys) = sim_system(1);
    let t = sys.create_thread("mortal", Some(Constraints::aperiodic(10)), None);
    sys.make_runnable(CPU0, &t, Placement::Local, true).unwrap();
    sys.yield_now(CPU0);
    assert_eq!(sys.current(CPU0).tid, t.tid);

    p.advance_ns(5_000_000);
    sys.exit(CPU0);
    assert_eq!(t.rt.lock().exit_time, p.now_ns());
}
