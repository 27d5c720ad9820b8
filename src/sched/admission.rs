/*
 * Admission Control
 *
 * The gate that accepts or rejects a thread's constraints against the
 * CPU's current utilisation. All arithmetic is fixed-point against
 * UTIL_ONE; no floating point enters the scheduler.
 *
 * - Aperiodic threads are always admitted.
 * - Periodic admission uses the Liu-Layland rate-monotonic bound for a
 *   non-harmonic task set, n*(2^{1/n} - 1), precomputed for up to 16
 *   threads and ln 2 beyond, capped by the configured periodic
 *   reservation.
 * - Sporadic admission is against the sporadic reservation, with an
 *   immediate reject when the job cannot possibly fit before its deadline.
 *
 * Admission resets the thread's timing and statistics and installs the
 * deadline that the queues will key on: next arrival for real-time
 * threads, the priority itself for aperiodic threads.
 */

use super::state::LocalState;
use super::thread::ThreadRef;
use super::types::{Constraints, SchedError, UTIL_ONE};

/// RMS schedulability limit for a non-harmonic task set of `count` threads,
/// fixed-point against UTIL_ONE. For a harmonic task set this would be 1.0.
pub(crate) fn periodic_util_rms_limit(count: u64) -> u64 {
    // n*(2^{1/n} - 1), converging to ln 2
    const LN2: u64 = 693_147;
    const LEVELS: [u64; 16] = [
        1_000_000, 828_427, 779_763, 756_828, 743_491, 734_772, 728_626, 724_061, 720_537,
        717_734, 715_451, 713_557, 711_958, 710_592, 709_411, 708_380,
    ];

    if count == 0 || count > 16 {
        LN2
    } else {
        LEVELS[(count - 1) as usize]
    }
}

/// Sum the utilisation of every periodic thread on the runnable and
/// pending queues. Returns (utilisation, count).
pub(crate) fn periodic_util(local: &LocalState) -> (u64, u64) {
    let mut util = 0u64;
    let mut count = 0u64;

    for slot in local.runnable.iter().chain(local.pending.iter()) {
        let rt = slot.thread.rt.lock();
        if let Constraints::Periodic {
            period_ns,
            slice_ns,
            ..
        } = rt.constraints
        {
            count += 1;
            util += (slice_ns * UTIL_ONE) / period_ns;
        }
    }

    (util, count)
}

/// Sum the instantaneous utilisation of every sporadic thread on the
/// runnable and pending queues. Runnable sporadics are measured by their
/// remaining work against their current deadline (the phase is behind
/// them); pending ones by their full size against the deadline net of the
/// phase still to elapse.
pub(crate) fn sporadic_util(local: &LocalState, now: u64) -> (u64, u64) {
    let mut util = 0u64;
    let mut count = 0u64;

    for slot in local.runnable.iter() {
        let rt = slot.thread.rt.lock();
        if let Constraints::Sporadic {
            size_ns,
            deadline_ns,
            ..
        } = rt.constraints
        {
            count += 1;
            let remaining = size_ns.saturating_sub(rt.run_time);
            let window = deadline_ns.saturating_sub(now).max(1);
            util += (remaining * UTIL_ONE) / window;
        }
    }

    for slot in local.pending.iter() {
        let rt = slot.thread.rt.lock();
        if let Constraints::Sporadic {
            phase_ns,
            size_ns,
            deadline_ns,
            ..
        } = rt.constraints
        {
            count += 1;
            let window = deadline_ns.saturating_sub(now).saturating_sub(phase_ns).max(1);
            util += (size_ns * UTIL_ONE) / window;
        }
    }

    (util, count)
}

/// Admit or reject `thread` under its current constraints.
///
/// Assumes the local CPU lock is held. On success the thread's state and
/// statistics have been reset and its deadline installed; on failure
/// nothing about the thread has changed except its status is not touched
/// here (the caller decides between Denied and a retry).
pub(crate) fn admit(local: &mut LocalState, thread: &ThreadRef, now: u64) -> Result<(), SchedError> {
    let util_limit = local.cfg.util_limit;
    let aper_res = local.cfg.aperiodic_reservation;
    let spor_res = local.cfg.sporadic_reservation;
    let per_res = util_limit
        .saturating_sub(aper_res)
        .saturating_sub(spor_res);

    let constraints = thread.rt.lock().constraints;

    log::debug!(
        "admission: {} tpr={} util_limit={} aper_res={} spor_res={} per_res={}",
        constraints.class_name(),
        constraints.interrupt_priority_class(),
        util_limit,
        aper_res,
        spor_res,
        per_res
    );

    if constraints.interrupt_priority_class() > 0xe {
        log::debug!(
            "rejecting thread with too high an interrupt priority class ({})",
            constraints.interrupt_priority_class()
        );
        return Err(SchedError::AdmissionDenied);
    }

    match constraints {
        Constraints::Aperiodic { priority, .. } => {
            // aperiodic threads are always admitted
            let mut rt = thread.rt.lock();
            rt.reset_state();
            rt.reset_stats();
            rt.deadline = priority;
            log::debug!("admitting aperiodic thread {}", thread.tid);
            Ok(())
        }

        Constraints::Periodic {
            phase_ns,
            period_ns,
            slice_ns,
            ..
        } => {
            let this_util = (slice_ns * UTIL_ONE) / period_ns;
            let (cur_util, cur_count) = periodic_util(local);
            let rms_limit = periodic_util_rms_limit(cur_count + 1);
            let our_limit = rms_limit.min(per_res);

            log::debug!(
                "periodic admission: this_util={} cur_util={} rms_limit={} our_limit={}",
                this_util,
                cur_util,
                rms_limit,
                our_limit
            );

            if cur_util + this_util < our_limit {
                let mut rt = thread.rt.lock();
                rt.reset_state();
                rt.reset_stats();
                // the next arrival of this thread is at this time
                rt.deadline = now + phase_ns;
                log::debug!("admitting periodic thread {}", thread.tid);
                Ok(())
            } else {
                log::debug!("rejected periodic thread {}", thread.tid);
                Err(SchedError::AdmissionDenied)
            }
        }

        Constraints::Sporadic {
            phase_ns,
            size_ns,
            deadline_ns,
            ..
        } => {
            if now + phase_ns + size_ns >= deadline_ns {
                // cannot possibly complete in time
                log::debug!("rejected impossible sporadic thread {}", thread.tid);
                return Err(SchedError::AdmissionDenied);
            }

            let time_left = deadline_ns - (now + phase_ns);
            let this_util = (size_ns * UTIL_ONE) / time_left;
            let (cur_util, _cur_count) = sporadic_util(local, now);

            log::debug!(
                "sporadic admission: this_util={} cur_util={} our_limit={}",
                this_util,
                cur_util,
                spor_res
            );

            if cur_util + this_util < spor_res {
                let mut rt = thread.rt.lock();
                rt.reset_state();
                rt.reset_stats();
                // the next arrival of this thread is at this time
                rt.deadline = now + phase_ns;
                log::debug!("admitting sporadic thread {}", thread.tid);
                Ok(())
            } else {
                log::debug!("rejected sporadic thread {}", thread.tid);
                Err(SchedError::AdmissionDenied)
            }
        }
    }
}
