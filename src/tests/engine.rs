/*
 * Reschedule Engine Tests
 *
 * Drives need_resched end to end on the simulated platform: the fast
 * path, arrival pumping, EDF preemption, slice exhaustion, deadline
 * misses, sporadic completion, yield semantics, the preempted-sleep
 * status repair, and timer arming.
 */

use super::{sim_system, sim_system_with, MS};
use crate::sched::types::{
    Constraints, CpuId, Placement, ReschedSource, RtStatus, SchedConfig, ThreadStatus,
};

const CPU0: CpuId = CpuId(0);

#[test]
fn direct_call_takes_fast_path_before_timeout() {
    let (p, sys) = sim_system(1);
    let before = sys.current(CPU0);
    let resched_before = before.rt.lock().stats.resched_count;

    // well before the first quantum expires, a stray direct invocation
    // must not change anything
    p.advance_ns(100_000);
    assert!(sys.need_resched(CPU0, ReschedSource::Direct).is_none());

    let rt = before.rt.lock();
    assert_eq!(rt.stats.resched_count, resched_before + 1);
    assert_eq!(rt.stats.resched_long_count, 0);
    assert!(sys.current(CPU0).tid == before.tid);
}

#[test]
fn timer_tick_pumps_arrivals_and_switches_to_rt() {
    let (p, sys) = sim_system(1);
    let t = sys.create_thread("rt", Some(Constraints::periodic(10 * MS, 2 * MS)), None);
    sys.make_runnable(CPU0, &t, Placement::Local, true).unwrap();

    // the thread sits pending until its arrival instant passes
    p.advance_ns(MS);
    let next = sys.need_resched(CPU0, ReschedSource::Timer);
    assert_eq!(next.map(|n| n.tid), Some(t.tid));
    assert_eq!(sys.current(CPU0).tid, t.tid);

    let rt = t.rt.lock();
    assert_eq!(rt.stats.arrival_count, 1);
    assert_eq!(rt.stats.switch_in_count, 1);
    // the arrival moved the deadline one period out from the arrival key
    assert_eq!(rt.deadline, 10 * MS);
    assert_eq!(rt.thread_status, ThreadStatus::Running);
}

#[test]
fn earlier_deadline_preempts_running_rt() {
    let (p, sys) = sim_system(1);
    let slow = sys.create_thread("slow", Some(Constraints::periodic(40 * MS, 4 * MS)), None);
    sys.make_runnable(CPU0, &slow, Placement::Local, true).unwrap();

    p.advance_ns(MS);
    sys.need_resched(CPU0, ReschedSource::Timer);
    assert_eq!(sys.current(CPU0).tid, slow.tid);

    // a tighter-deadline thread arrives while slow still has slice left
    let fast = sys.create_thread("fast", Some(Constraints::periodic(8 * MS, MS)), None);
    sys.make_runnable(CPU0, &fast, Placement::Local, true).unwrap();

    p.advance_ns(MS);
    let next = sys.need_resched(CPU0, ReschedSource::Timer);
    assert_eq!(next.map(|n| n.tid), Some(fast.tid));

    // slow went back on the EDF queue, not pending
    let rt = slow.rt.lock();
    assert_eq!(rt.q_kind, crate::sched::types::QueueKind::Runnable);
    assert_eq!(rt.thread_status, ThreadStatus::Suspended);
}

#[test]
fn exhausted_slice_returns_to_pending() {
    let (p, sys) = sim_system(1);
    let t = sys.create_thread("rt", Some(Constraints::periodic(10 * MS, 2 * MS)), None);
    sys.make_runnable(CPU0, &t, Placement::Local, true).unwrap();

    p.advance_ns(MS);
    sys.need_resched(CPU0, ReschedSource::Timer);
    assert_eq!(sys.current(CPU0).tid, t.tid);

    // run out the slice, well inside the deadline
    p.advance_ns(2 * MS);
    sys.need_resched(CPU0, ReschedSource::Timer);

    let rt = t.rt.lock();
    assert_eq!(rt.q_kind, crate::sched::types::QueueKind::Pending);
    assert_eq!(rt.stats.miss_count, 0);
    // its pending key is the next arrival: one period past the first
    assert_eq!(rt.deadline, 10 * MS);
    assert!(sys.current(CPU0).tid != t.tid);
}

#[test]
fn missed_deadline_rearrives_immediately() {
    let (p, sys) = sim_system(1);
    let t = sys.create_thread("rt", Some(Constraints::periodic(10 * MS, 2 * MS)), None);
    sys.make_runnable(CPU0, &t, Placement::Local, true).unwrap();

    p.advance_ns(MS);
    sys.need_resched(CPU0, ReschedSource::Timer);
    assert_eq!(sys.current(CPU0).tid, t.tid);

    // blow straight past the deadline before the slice completes
    p.advance_ns(12 * MS);
    sys.need_resched(CPU0, ReschedSource::Timer);

    let rt = t.rt.lock();
    assert_eq!(rt.stats.miss_count, 1);
    assert!(rt.stats.miss_time_sum > 0);
    // the miss is an immediate re-arrival: next period's deadline, fresh
    // slice, and (being the earliest deadline around) the thread comes
    // straight back off the runnable queue and keeps the CPU
    assert_eq!(rt.deadline, 20 * MS);
    assert_eq!(rt.run_time, 0);
    drop(rt);
    assert_eq!(sys.current(CPU0).tid, t.tid);
}

#[test]
fn sporadic_completion_demotes_to_aperiodic() {
    let cfg = SchedConfig {
        sporadic_reservation: 600_000,
        ..SchedConfig::default()
    };
    let (p, sys) = sim_system_with(1, cfg);
    let t = sys.create_thread("s", Some(Constraints::sporadic(5 * MS, 20 * MS, 42)), None);
    sys.make_runnable(CPU0, &t, Placement::Local, true).unwrap();

    p.advance_ns(MS);
    sys.need_resched(CPU0, ReschedSource::Timer);
    assert_eq!(sys.current(CPU0).tid, t.tid);

    // complete the job inside its deadline
    p.advance_ns(5 * MS);
    sys.need_resched(CPU0, ReschedSource::Timer);

    let rt = t.rt.lock();
    assert_eq!(rt.stats.miss_count, 0);
    match rt.constraints {
        Constraints::Aperiodic { priority, .. } => assert_eq!(priority, 42),
        ref c => panic!("completed sporadic kept {:?}", c),
    }
    assert_eq!(rt.q_kind, crate::sched::types::QueueKind::Aperiodic);
}

#[test]
fn yield_with_no_peer_keeps_running() {
    let (_p, sys) = sim_system(1);
    let cur = sys.current(CPU0);
    let (resched0, switch0) = {
        let rt = cur.rt.lock();
        (rt.stats.resched_count, rt.stats.switch_in_count)
    };

    sys.yield_now(CPU0);

    let rt = cur.rt.lock();
    assert_eq!(sys.current(CPU0).tid, cur.tid);
    assert_eq!(rt.stats.resched_count, resched0 + 1);
    assert_eq!(rt.stats.switch_in_count, switch0);
    assert_eq!(rt.status, RtStatus::Admitted);
    assert_eq!(rt.thread_status, ThreadStatus::Running);
}

#[test]
fn yield_rotates_between_equal_aperiodics() {
    let (p, sys) = sim_system(1);
    let t = sys.create_thread("worker", Some(Constraints::aperiodic(10)), None);
    sys.make_runnable(CPU0, &t, Placement::Local, true).unwrap();

    let boot = sys.current(CPU0);
    sys.yield_now(CPU0);
    assert_eq!(sys.current(CPU0).tid, t.tid);
    assert_eq!(
        p.switch_log(CPU0).last().copied(),
        Some(t.tid),
        "the voluntary switch goes through the platform"
    );

    sys.yield_now(CPU0);
    assert_eq!(sys.current(CPU0).tid, boot.tid);
}

#[test]
fn preempted_sleep_keeps_waiting_status() {
    let (_p, sys) = sim_system(1);
    let t = sys.create_thread("napper", Some(Constraints::aperiodic(10)), None);
    sys.make_runnable(CPU0, &t, Placement::Local, true).unwrap();

    // the thread was preempted in the middle of going to sleep: it is on
    // a run queue but already marked Waiting by the wait machinery
    t.rt.lock().thread_status = ThreadStatus::Waiting;

    sys.yield_now(CPU0);

    // the engine switched to it but must not stomp the Waiting status,
    // so the interrupted sleep is retried
    assert_eq!(sys.current(CPU0).tid, t.tid);
    assert_eq!(t.rt.lock().thread_status, ThreadStatus::Waiting);
}

#[test]
fn sleep_leaves_the_queues_and_wake_requeues() {
    let (_p, sys) = sim_system(1);
    let t = sys.create_thread("napper", Some(Constraints::aperiodic(10)), None);
    sys.make_runnable(CPU0, &t, Placement::Local, true).unwrap();

    sys.yield_now(CPU0);
    assert_eq!(sys.current(CPU0).tid, t.tid);

    // the wait machinery parks the thread, then asks the scheduler to
    // put it to sleep
    t.rt.lock().thread_status = ThreadStatus::Waiting;
    sys.sleep(CPU0);

    assert!(sys.current(CPU0).tid != t.tid);
    assert_eq!(t.rt.lock().q_kind, crate::sched::types::QueueKind::Unqueued);

    // waking is a plain make-runnable without re-admission
    sys.make_runnable(CPU0, &t, Placement::Local, false).unwrap();
    let rt = t.rt.lock();
    assert_eq!(rt.q_kind, crate::sched::types::QueueKind::Aperiodic);
    assert_eq!(rt.thread_status, ThreadStatus::Suspended);
}

#[test]
fn timer_armed_for_slice_remainder() {
    let (p, sys) = sim_system(1);
    let t = sys.create_thread("rt", Some(Constraints::periodic(10 * MS, 3 * MS)), None);
    sys.make_runnable(CPU0, &t, Placement::Local, true).unwrap();

    p.advance_ns(MS);
    sys.need_resched(CPU0, ReschedSource::Timer);
    assert_eq!(sys.current(CPU0).tid, t.tid);

    // the freshly switched-in thread has its full slice ahead of it
    assert_eq!(p.last_timer_arm(CPU0), Some(3 * MS));

    // half the slice later the arm covers only the remainder
    p.advance_ns(MS);
    sys.need_resched(CPU0, ReschedSource::Timer);
    assert_eq!(sys.current(CPU0).tid, t.tid);
    assert_eq!(p.last_timer_arm(CPU0), Some(2 * MS));
}

#[test]
fn two_periodic_threads_run_hundred_clean_periods() {
    // two threads, 3ms and 4ms slices in a 10ms period each: utilisation
    // 0.7 fits RMS(2). Over one simulated second both must arrive ~100
    // times and never miss.
    let (p, sys) = sim_system(1);
    let a = sys.create_thread("a", Some(Constraints::periodic(10 * MS, 3 * MS)), None);
    let b = sys.create_thread("b", Some(Constraints::periodic(10 * MS, 4 * MS)), None);
    sys.make_runnable(CPU0, &a, Placement::Local, true).unwrap();
    sys.make_runnable(CPU0, &b, Placement::Local, true).unwrap();

    // tick every 500us for one second of virtual time
    let step = MS / 2;
    for _ in 0..2000 {
        p.advance_ns(step);
        sys.need_resched(CPU0, ReschedSource::Timer);
    }

    for t in [&a, &b] {
        let rt = t.rt.lock();
        assert_eq!(rt.stats.miss_count, 0, "{} missed deadlines", t.name);
        assert!(
            (99..=101).contains(&rt.stats.arrival_count),
            "{} arrived {} times",
            t.name,
            rt.stats.arrival_count
        );
        assert!(rt.stats.switch_in_count >= 99);
    }
}

#[test]
fn single_queue_membership_invariant_holds() {
    // after a burst of scheduling activity, every registered thread is on
    // at most one queue and its tag says which
    let (p, sys) = sim_system(1);
    let rt1 = sys.create_thread("rt1", Some(Constraints::periodic(10 * MS, 2 * MS)), None);
    let rt2 = sys.create_thread("rt2", Some(Constraints::periodic(7 * MS, MS)), None);
    let ap = sys.create_thread("ap", Some(Constraints::aperiodic(10)), None);
    for t in [&rt1, &rt2, &ap] {
        sys.make_runnable(CPU0, t, Placement::Local, true).unwrap();
    }

    for i in 0..400 {
        p.advance_ns(MS / 4);
        sys.need_resched(CPU0, ReschedSource::Timer);
        if i % 37 == 0 {
            sys.yield_now(CPU0);
        }
    }

    let local = sys.cpu_state(CPU0).sched.lock();
    for t in [&rt1, &rt2, &ap] {
        let q = t.rt.lock().q_kind;
        let on_runnable = local.runnable.iter().filter(|s| s.thread.tid == t.tid).count();
        let on_pending = local.pending.iter().filter(|s| s.thread.tid == t.tid).count();
        let mut on_aperiodic = 0;
        for pos in 0.. {
            match local.peek_aperiodic(pos) {
                Some(th) => {
                    if th.tid == t.tid {
                        on_aperiodic += 1;
                    }
                }
                None => break,
            }
        }
        let total = on_runnable + on_pending + on_aperiodic;
        let is_current = local.current.tid == t.tid;
        use crate::sched::types::QueueKind;
        match q {
            QueueKind::Runnable => assert_eq!((on_runnable, total), (1, 1)),
            QueueKind::Pending => assert_eq!((on_pending, total), (1, 1)),
            QueueKind::Aperiodic => assert_eq!((on_aperiodic, total), (1, 1)),
            QueueKind::Unqueued => {
                assert_eq!(total, 0);
                assert!(is_current, "unqueued thread {} is not running", t.tid);
            }
        }
    }
}

#[test]
fn runtime_accounting_sums_run_intervals() {
    let (p, sys) = sim_system(1);
    let t = sys.create_thread("worker", Some(Constraints::aperiodic(10)), None);
    sys.make_runnable(CPU0, &t, Placement::Local, true).unwrap();

    sys.yield_now(CPU0);
    assert_eq!(sys.current(CPU0).tid, t.tid);

    // run 2ms, lose the CPU, run 3ms more
    p.advance_ns(2 * MS);
    sys.yield_now(CPU0);
    assert!(sys.current(CPU0).tid != t.tid);
    assert_eq!(sys.get_runtime(&t), 2 * MS);

    sys.yield_now(CPU0);
    assert_eq!(sys.current(CPU0).tid, t.tid);
    p.advance_ns(3 * MS);
    sys.yield_now(CPU0);

    assert_eq!(sys.get_runtime(&t), 5 * MS);
}
