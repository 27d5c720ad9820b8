/*
 * Admission Control Tests
 *
 * The utilisation bounds from the rate-monotonic model, the sporadic
 * feasibility check, and the rules that never change: aperiodic always
 * fits, and nothing with an out-of-range interrupt priority class ever
 * does.
 */

use super::{sim_system, sim_system_with, MS};
use crate::sched::types::{
    Constraints, CpuId, Placement, RtStatus, SchedConfig, SchedError, ThreadStatus,
};

#[test]
fn aperiodic_always_admitted() {
    let (_p, sys) = sim_system(1);
    let t = sys.create_thread("worker", Some(Constraints::aperiodic(100)), None);
    sys.make_runnable(CpuId(0), &t, Placement::Local, true)
        .unwrap();

    let rt = t.rt.lock();
    assert_eq!(rt.status, RtStatus::Admitted);
    assert_eq!(rt.thread_status, ThreadStatus::Suspended);
    // the deadline key of an aperiodic thread is its priority
    assert_eq!(rt.deadline, 100);
    assert_eq!(rt.stats.arrival_count, 1);
}

#[test]
fn two_periodic_threads_within_rms_bound() {
    // 3ms/10ms + 4ms/10ms = 0.7, under both RMS(2) = 0.828 and the
    // periodic reservation
    let (_p, sys) = sim_system(1);
    let a = sys.create_thread("a", Some(Constraints::periodic(10 * MS, 3 * MS)), None);
    let b = sys.create_thread("b", Some(Constraints::periodic(10 * MS, 4 * MS)), None);

    sys.make_runnable(CpuId(0), &a, Placement::Local, true)
        .unwrap();
    sys.make_runnable(CpuId(0), &b, Placement::Local, true)
        .unwrap();

    assert_eq!(a.rt.lock().status, RtStatus::Admitted);
    assert_eq!(b.rt.lock().status, RtStatus::Admitted);
}

#[test]
fn oversubscribed_periodic_rejected() {
    // 2ms/4ms + 3ms/6ms = 1.0 > RMS(2): the second admission must fail
    let (_p, sys) = sim_system(1);
    let a = sys.create_thread("a", Some(Constraints::periodic(4 * MS, 2 * MS)), None);
    let b = sys.create_thread("b", Some(Constraints::periodic(6 * MS, 3 * MS)), None);

    sys.make_runnable(CpuId(0), &a, Placement::Local, true)
        .unwrap();
    let err = sys
        .make_runnable(CpuId(0), &b, Placement::Local, true)
        .unwrap_err();
    assert_eq!(err, SchedError::AdmissionDenied);
    assert_eq!(b.rt.lock().status, RtStatus::Denied);
}

#[test]
fn periodic_slice_must_be_less_than_period() {
    let (_p, sys) = sim_system(1);
    let t = sys.create_thread("t", Some(Constraints::periodic(5 * MS, 5 * MS)), None);
    assert!(sys
        .make_runnable(CpuId(0), &t, Placement::Local, true)
        .is_err());
}

#[test]
fn infeasible_sporadic_rejected_immediately() {
    // phase + size >= deadline can never complete in time
    let (p, sys) = sim_system(1);
    p.set_time_ns(0);
    let t = sys.create_thread(
        "s",
        Some(Constraints::Sporadic {
            phase_ns: 2 * MS,
            size_ns: 8 * MS,
            deadline_ns: 10 * MS,
            aperiodic_priority: 1,
            interrupt_priority_class: 0,
        }),
        None,
    );
    assert_eq!(
        sys.make_runnable(CpuId(0), &t, Placement::Local, true),
        Err(SchedError::AdmissionDenied)
    );
}

#[test]
fn sporadic_admitted_within_reservation() {
    let cfg = SchedConfig {
        sporadic_reservation: 600_000,
        ..SchedConfig::default()
    };
    let (_p, sys) = sim_system_with(1, cfg);
    // 5ms of work in a 10ms window is utilisation 0.5, inside the 0.6
    // reservation
    let t = sys.create_thread(
        "s",
        Some(Constraints::sporadic(5 * MS, 10 * MS, 7)),
        None,
    );
    sys.make_runnable(CpuId(0), &t, Placement::Local, true)
        .unwrap();
    assert_eq!(t.rt.lock().status, RtStatus::Admitted);
}

#[test]
fn sporadic_rejected_beyond_reservation() {
    // the default sporadic reservation is 0.1; 5ms in 10ms does not fit
    let (_p, sys) = sim_system(1);
    let t = sys.create_thread(
        "s",
        Some(Constraints::sporadic(5 * MS, 10 * MS, 7)),
        None,
    );
    assert!(sys
        .make_runnable(CpuId(0), &t, Placement::Local, true)
        .is_err());
}

#[test]
fn interrupt_priority_class_capped() {
    let (_p, sys) = sim_system(1);
    let t = sys.create_thread(
        "t",
        Some(Constraints::Aperiodic {
            priority: 1,
            interrupt_priority_class: 0xf,
        }),
        None,
    );
    assert_eq!(
        sys.make_runnable(CpuId(0), &t, Placement::Local, true),
        Err(SchedError::AdmissionDenied)
    );
}

#[test]
fn admission_resets_statistics() {
    let (_p, sys) = sim_system(1);
    let t = sys.create_thread("t", Some(Constraints::aperiodic(5)), None);
    {
        let mut rt = t.rt.lock();
        rt.stats.resched_count = 17;
        rt.stats.miss_count = 3;
        rt.run_time = 1234;
    }
    sys.make_runnable(CpuId(0), &t, Placement::Local, true)
        .unwrap();
    let rt = t.rt.lock();
    assert_eq!(rt.stats.resched_count, 0);
    assert_eq!(rt.stats.miss_count, 0);
    assert_eq!(rt.run_time, 0);
}
