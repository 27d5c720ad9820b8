/*
 * Reschedule Engine
 *
 * The main decision procedure, invoked on every timer tick, every kick
 * IPI, and every voluntary transition. Within one critical section it:
 *
 * 1. Flushes the current thread's run-time accounting.
 * 2. Takes the fast path out if nothing interesting can have happened.
 * 3. Drains arrivals from the pending queue into the EDF runnable queue.
 * 4. Disposes of the current thread according to its class (aperiodic /
 *    sporadic / periodic) and picks the next thread: the earliest-deadline
 *    runnable real-time thread if any, else the policy's aperiodic pick.
 * 5. Commits: updates the current pointer, re-arms the one-shot timer for
 *    the next interesting event, and sets the interrupt priority class.
 *
 * The decision comes back as NoChange or Switch(next); the caller performs
 * the actual context switch. States that cannot be satisfied (an empty
 * aperiodic queue, a queue overflow on a re-enqueue) are kernel bugs and
 * panic. Races the engine can heal (a vanished arrival, a thread found in
 * an unexpected status) are logged and survived.
 */

use spin::MutexGuard;

use crate::platform::Platform;

use super::state::LocalState;
use super::thread::ThreadRef;
use super::types::{Constraints, CpuId, ReschedSource, RtStatus, ThreadStatus};

/// What the decision pass concluded
pub(crate) enum Outcome {
    /// Keep running the current thread; the timer has been re-armed
    NoChange,
    /// Context switch to this thread
    Switch(ThreadRef),
}

/// Snapshot of the current thread's transition flags, taken once at entry
struct EntryFlags {
    going_to_sleep: bool,
    going_to_exit: bool,
    changing: bool,
    yielding: bool,
    idle: bool,
}

impl EntryFlags {
    /// "Special" means the current thread is not to be re-enqueued here:
    /// some other path has already queued it (or it is leaving forever)
    fn special(&self) -> bool {
        self.going_to_sleep || self.going_to_exit || self.changing
    }
}

/// The decision procedure: decide what thread must run on this CPU next.
///
/// This is the heart of the scheduler. Every timer expiry, every kick IPI,
/// and every voluntary transition funnels through here, and nothing else
/// ever performs a context-switch decision.
///
/// The pass runs in five steps:
///
/// 1. FLUSH: charge the current thread for the interval that just ended
///    (`run_time += now - start_time`) and snapshot its transition flags.
///    Nothing below may look at stale accounting.
/// 2. FAST PATH: a direct invocation on a thread that has not timed out,
///    is not idle, and is not mid-transition changes nothing; return
///    immediately without touching the queues or the timer.
/// 3. ARRIVALS: pump every pending real-time thread whose arrival instant
///    has passed onto the EDF runnable queue, installing its new deadline
///    (period end for periodic, the absolute constraint deadline for
///    sporadic) as the heap key.
/// 4. DISPOSE + PICK: hand the current thread to its class handler
///    (consider_aperiodic / consider_sporadic / consider_periodic), which
///    re-queues or demotes it as its class demands and picks the next
///    thread: the earliest-deadline runnable real-time thread if one
///    exists, else the aperiodic policy's choice.
/// 5. COMMIT: install the pick as current, reconcile thread statuses
///    (tolerating the preempted-sleep race), re-arm the one-shot timer for
///    the next interesting event, and set the interrupt priority class.
///
/// # Arguments
/// - `local`: this CPU's scheduler state; the caller holds its lock with
///   interrupts disabled on this CPU
/// - `platform`: clock, timer, and interrupt-priority intrinsics
/// - `source`: what caused this invocation; timer and kick entries always
///   take the full path, direct entries may use the fast path
///
/// # Returns
/// - `Outcome::NoChange`: the current thread keeps the CPU; the timer has
///   been re-armed (unless the fast path ruled nothing could have changed)
/// - `Outcome::Switch(next)`: the caller must context-switch to `next`;
///   the timer and interrupt priority class are already set for it
///
/// # Panics
/// On states that must not happen in a correct kernel: a queue overflow
/// while re-enqueueing, or an empty aperiodic queue (the idle thread is
/// always supposed to be there).
pub(crate) fn need_resched_locked(
    local: &mut LocalState,
    platform: &dyn Platform,
    source: ReschedSource,
) -> Outcome {
    let now = platform.now_ns();
    let cur = local.current.clone();

    local.timer.end_time = now;

    // Flush accounting for the interval that just ended and snapshot the
    // transition flags under one lock acquisition.
    let flags = {
        let mut rt = cur.rt.lock();
        let ran = now.saturating_sub(rt.start_time);
        rt.run_time += ran;
        rt.cur_run_time += ran;
        rt.stats.resched_count += 1;
        EntryFlags {
            going_to_sleep: rt.status == RtStatus::Sleeping,
            going_to_exit: rt.status == RtStatus::Exiting,
            changing: rt.status == RtStatus::Changing,
            yielding: rt.status == RtStatus::Yielding,
            idle: cur.is_idle,
        }
    };

    let timed_out = local.timer.set_time < now;

    log::trace!(
        "need_resched (cur={}, sleep={}, exit={}, changing={})",
        cur.tid,
        flags.going_to_sleep,
        flags.going_to_exit,
        flags.changing
    );

    // We got here either by a non-timer interrupt or a direct call, the
    // thread is not trying to do anything special, and it has not timed
    // out; change nothing and wait for the next invocation.
    if !timed_out
        && source == ReschedSource::Direct
        && !flags.special()
        && !flags.yielding
        && !flags.idle
    {
        log::trace!(
            "out early: now={:#x} set_time={:#x}",
            now,
            local.timer.set_time
        );
        return Outcome::NoChange;
    }

    // Move every real-time thread that has now arrived from the pending
    // queue to the runnable queue.
    loop {
        match local.pending.peek_min() {
            Some((arrival, _)) if arrival <= now => {}
            _ => break,
        }
        let Some(arrived) = local.next_pending() else {
            log::error!("race in arrivals");
            continue;
        };
        {
            let mut rt = arrived.rt.lock();
            rt.stats.arrival_count += 1;
            match rt.constraints {
                Constraints::Periodic { period_ns, .. } => {
                    // the deadline becomes the end of the period relative
                    // to this arrival time, not the current time
                    rt.deadline += period_ns;
                    rt.run_time = 0;
                }
                Constraints::Sporadic { deadline_ns, .. } => {
                    // the deadline is absolutely the one in the constraints
                    rt.deadline = deadline_ns;
                }
                Constraints::Aperiodic { .. } => {
                    log::error!("aperiodic thread {} was on the pending queue", arrived.tid);
                }
            }
        }
        // status fields were set when the thread went pending
        if local.put_runnable(&arrived).is_err() {
            panic!("unexpected queue overflow in need_resched (arrival)");
        }
    }

    let cur_constraints = { cur.rt.lock().constraints };
    let next = match cur_constraints {
        Constraints::Aperiodic { .. } => consider_aperiodic(local, platform, &cur, &flags, now),
        Constraints::Sporadic { .. } => consider_sporadic(local, platform, &cur, &flags, now),
        Constraints::Periodic { .. } => consider_periodic(local, platform, &cur, &flags, now),
    };

    commit(local, platform, cur, next, &flags, now)
}

/// Dispose of a current aperiodic thread and pick what runs next.
///
/// An aperiodic thread has no deadline of its own, so the disposition is
/// simple: refresh its dynamic-priority key, put it back on the aperiodic
/// queue (unless a special transition has already queued it elsewhere or
/// is removing it for good), and then prefer any runnable real-time
/// thread over the whole aperiodic class.
///
/// # Arguments
/// - `local`: this CPU's scheduler state, lock held
/// - `platform`: entropy source for the lottery policy's draw
/// - `cur`: the thread currently on the CPU (aperiodic class)
/// - `flags`: its transition flags, snapshotted at engine entry
/// - `now`: the instant this reschedule pass is accounting against
///
/// # Returns
/// The thread to run next: the earliest-deadline real-time thread if any
/// is runnable, otherwise the aperiodic policy's pick (possibly `cur`
/// itself, which the commit step treats as "no switch").
///
/// # Panics
/// If the aperiodic queue overflows on the re-enqueue or turns up empty
/// on the pick; both mean the idle-thread invariant is broken.
fn consider_aperiodic(
    local: &mut LocalState,
    platform: &dyn Platform,
    cur: &ThreadRef,
    flags: &EntryFlags,
    now: u64,
) -> ThreadRef {
    // update the dynamic priority before any queueing decision
    local.update_aperiodic(cur, now);

    if !flags.special() {
        // current aperiodic thread has run out of time or is yielding;
        // keep it on the aperiodic run queue
        cur.rt.lock().thread_status = ThreadStatus::Suspended;
        if local.put_aperiodic(cur).is_err() {
            panic!("unexpected queue overflow in need_resched (aperiodic)");
        }
    }
    // else: it has initiated something special and does not go back on a
    // run queue until awoken

    if local.have_rt() {
        // a runnable real-time thread exists; switch to the one with the
        // earliest deadline
        if let Some(n) = local.next_rt() {
            return n;
        }
        log::error!("race detected: no RT threads found on switch from aperiodic");
        // salvageable; continue on to aperiodic
    }

    local
        .next_aperiodic(platform)
        .unwrap_or_else(|| panic!("aperiodic queue empty: nothing to run"))
}

/// Dispose of a current sporadic thread and pick what runs next.
///
/// A sporadic thread arrives once and must finish `size_ns` of work by
/// its absolute deadline, so there are three dispositions:
///
/// 1. CHANGING FAST PATH: the thread only just became sporadic and the
///    arrival pump already promoted it to the head of the runnable queue;
///    take it straight back off and keep running it.
/// 2. JOB COMPLETE (`run_time >= size_ns`): record a deadline miss if it
///    finished late (non-fatal, it will not arrive again), then demote it
///    to an aperiodic at its configured completion priority and re-enqueue
///    it there. Its life continues in the aperiodic underlay.
/// 3. JOB STILL RUNNING: preempt only for a strictly earlier-deadline
///    real-time thread (putting ourselves back on the EDF queue), or
///    vacate unconditionally when a special transition is in progress.
///    Otherwise stick with the current thread.
///
/// # Arguments
/// - `local`: this CPU's scheduler state, lock held
/// - `platform`: entropy source for the lottery policy's draw
/// - `cur`: the thread currently on the CPU (sporadic class)
/// - `flags`: its transition flags, snapshotted at engine entry
/// - `now`: the instant used for the completion and deadline checks
///
/// # Returns
/// The thread to run next; `cur` itself when nothing more urgent exists
/// and no transition forces it off the CPU.
///
/// # Panics
/// If a re-enqueue overflows a queue or the aperiodic queue is empty when
/// a pick is needed.
fn consider_sporadic(
    local: &mut LocalState,
    platform: &dyn Platform,
    cur: &ThreadRef,
    flags: &EntryFlags,
    now: u64,
) -> ThreadRef {
    if let Some(n) = changing_fast_path(local, cur, flags) {
        return n;
    }

    let (run_time, size_ns, deadline, aperiodic_priority, ipc) = {
        let rt = cur.rt.lock();
        match rt.constraints {
            Constraints::Sporadic {
                size_ns,
                aperiodic_priority,
                interrupt_priority_class,
                ..
            } => (
                rt.run_time,
                size_ns,
                rt.deadline,
                aperiodic_priority,
                interrupt_priority_class,
            ),
            _ => unreachable!(),
        }
    };

    if run_time >= size_ns {
        // The sporadic job is complete. Whether the deadline was met does
        // not matter for scheduling; it will not arrive again. Its life is
        // not over, though: it now becomes an aperiodic.
        cur.rt.lock().check_deadline(now);

        if !flags.special() {
            {
                let mut rt = cur.rt.lock();
                rt.constraints = Constraints::Aperiodic {
                    priority: aperiodic_priority,
                    interrupt_priority_class: ipc,
                };
                rt.thread_status = ThreadStatus::Suspended;
            }
            if local.put_aperiodic(cur).is_err() {
                panic!("unexpected queue overflow in need_resched (sporadic completion)");
            }
        }

        if local.have_rt() {
            if let Some(n) = local.next_rt() {
                return n;
            }
            log::error!("race detected: no RT threads found on switch from sporadic on timeout");
        }

        return local
            .next_aperiodic(platform)
            .unwrap_or_else(|| panic!("aperiodic queue empty: nothing to run"));
    }

    // The job is not done yet. Preempt for an earlier deadline, or vacate
    // if we are in a special transition.
    log::trace!("sporadic task not done yet");
    if local.have_rt() {
        let earlier = local
            .peek_rt()
            .map(|(key, _)| deadline > key)
            .unwrap_or(false);
        if flags.special() || earlier {
            if let Some(n) = local.next_rt() {
                if !flags.special() {
                    log::trace!("putting self back on RT run queue");
                    cur.rt.lock().thread_status = ThreadStatus::Suspended;
                    if local.put_runnable(cur).is_err() {
                        panic!("unexpected queue overflow in need_resched (sporadic preempt)");
                    }
                }
                return n;
            }
            log::error!("race detected: no RT threads found on switch from sporadic on preemption");
            // continue running the current thread
        }
    }

    // No real-time thread is better than us. But in a special transition
    // we must go away regardless, which means finding an aperiodic.
    if flags.special() {
        local
            .next_aperiodic(platform)
            .unwrap_or_else(|| panic!("aperiodic queue empty: nothing to run"))
    } else {
        // sticking with the current thread; mark it suspended to meet the
        // expectation of the outbound code
        cur.rt.lock().thread_status = ThreadStatus::Suspended;
        cur.clone()
    }
}

/// Dispose of a current periodic thread and pick what runs next.
///
/// A periodic thread owes `slice_ns` of work every period, with the next
/// arrival doubling as the deadline, so there are three dispositions:
///
/// 1. CHANGING FAST PATH: as for sporadic; a freshly converted thread
///    found at the head of the runnable queue keeps the CPU.
/// 2. SLICE EXHAUSTED (`run_time >= slice_ns`): the period's work is done.
///    If the deadline was met, park the thread on the pending queue keyed
///    by its next arrival. If it was missed, count the miss, advance the
///    deadline by one period relative to when the work SHOULD have been
///    done (not relative to now), zero the slice, and re-enqueue it as an
///    immediate re-arrival on the runnable queue.
/// 3. SLICE REMAINING: preempt only for a strictly earlier deadline or a
///    special transition, exactly as for sporadic.
///
/// The common tail handles the two cases that fall through: a thread that
/// was parked above (or is mid-transition) with no real-time work left
/// hands the CPU to the aperiodic underlay; a thread still owed its slice
/// keeps running.
///
/// # Arguments
/// - `local`: this CPU's scheduler state, lock held
/// - `platform`: entropy source for the lottery policy's draw
/// - `cur`: the thread currently on the CPU (periodic class)
/// - `flags`: its transition flags, snapshotted at engine entry
/// - `now`: the instant used for the slice and deadline checks
///
/// # Returns
/// The thread to run next; `cur` itself when its slice is unfinished and
/// nothing more urgent exists.
///
/// # Panics
/// If a re-enqueue overflows a queue or the aperiodic queue is empty when
/// a pick is needed.
fn consider_periodic(
    local: &mut LocalState,
    platform: &dyn Platform,
    cur: &ThreadRef,
    flags: &EntryFlags,
    now: u64,
) -> ThreadRef {
    if let Some(n) = changing_fast_path(local, cur, flags) {
        return n;
    }

    let (run_time, slice_ns, period_ns, deadline) = {
        let rt = cur.rt.lock();
        match rt.constraints {
            Constraints::Periodic {
                period_ns,
                slice_ns,
                ..
            } => (rt.run_time, slice_ns, period_ns, rt.deadline),
            _ => unreachable!(),
        }
    };

    if run_time >= slice_ns {
        log::trace!(
            "current task complete (slice={}, run_time={})",
            slice_ns,
            run_time
        );
        let missed = cur.rt.lock().check_deadline(now);
        if missed {
            log::debug!("missed deadline - immediate re-arrival");
            {
                let mut rt = cur.rt.lock();
                // the deadline update is relative to when this task SHOULD
                // have completed, not to the current time
                rt.deadline += period_ns;
                rt.run_time = 0;
            }
            // it has immediately arrived again, so it goes straight onto
            // the EDF queue
            if !flags.special() {
                cur.rt.lock().thread_status = ThreadStatus::Suspended;
                if local.put_runnable(cur).is_err() {
                    panic!("unexpected queue overflow in need_resched (periodic miss)");
                }
            }
        } else {
            // deadline met; the current deadline is in fact the arrival
            // time of the next period
            log::trace!("deadline met - enqueuing to pending");
            if !flags.special() {
                cur.rt.lock().thread_status = ThreadStatus::Suspended;
                if local.put_pending(cur).is_err() {
                    panic!("unexpected queue overflow in need_resched (periodic met)");
                }
            }
        }

        if local.have_rt() {
            if let Some(n) = local.next_rt() {
                return n;
            }
            log::error!("race detected: no RT threads found on switch from periodic on timeout");
        }
        // only aperiodics remain; handled by the common tail below
    } else {
        // slice not exhausted, but we may be in a special transition or an
        // earlier-deadline thread may have arrived
        log::trace!("periodic task not done yet");
        if local.have_rt() {
            let earlier = local
                .peek_rt()
                .map(|(key, _)| deadline > key)
                .unwrap_or(false);
            if flags.special() || earlier {
                if let Some(n) = local.next_rt() {
                    if !flags.special() {
                        // our deadline and run time do not change here
                        log::trace!("putting self back on RT run queue");
                        cur.rt.lock().thread_status = ThreadStatus::Suspended;
                        if local.put_runnable(cur).is_err() {
                            panic!("unexpected queue overflow in need_resched (periodic preempt)");
                        }
                    }
                    return n;
                }
                log::error!(
                    "race detected: no RT threads found on switch from periodic on preemption"
                );
            }
        }
    }

    // We are in a special transition with no real-time work, or we were
    // suspended above with no real-time work; either way, find an
    // aperiodic. Otherwise stick with the current thread.
    let suspended = cur.rt.lock().thread_status == ThreadStatus::Suspended;
    if flags.special() || suspended {
        local
            .next_aperiodic(platform)
            .unwrap_or_else(|| panic!("aperiodic queue empty: nothing to run"))
    } else {
        log::trace!("sticking with current periodic task");
        // mark suspended to meet the expectation of the outbound code
        cur.rt.lock().thread_status = ThreadStatus::Suspended;
        cur.clone()
    }
}

/// The constraint-change fast path: if the current thread was just
/// converted to a real-time class, it went through the pending queue and
/// the arrival pump above may already have moved it to the head of the
/// runnable queue. If so, take ourselves back off and keep running.
///
/// # Arguments
/// - `local`: this CPU's scheduler state, lock held
/// - `cur`: the thread currently on the CPU
/// - `flags`: its transition flags; only a CHANGING thread qualifies
///
/// # Returns
/// The dequeued current thread (marked Suspended, as if it had been
/// descheduled into the queue) when the fast path applies, None otherwise.
fn changing_fast_path(
    local: &mut LocalState,
    cur: &ThreadRef,
    flags: &EntryFlags,
) -> Option<ThreadRef> {
    if !flags.changing {
        return None;
    }
    let at_head = local
        .peek_rt()
        .map(|(_, t)| t.tid == cur.tid)
        .unwrap_or(false);
    if !at_head {
        return None;
    }
    let n = local.next_rt()?;
    // mark as if it had previously been descheduled into that queue; the
    // deadline was already updated by the arrival pump
    n.rt.lock().thread_status = ThreadStatus::Suspended;
    Some(n)
}

/// Commit the decision: install the next thread, re-arm the timer, and
/// reconcile thread statuses.
///
/// The status rules here close two races between the scheduler running in
/// thread context and in interrupt context:
///
/// - A thread being switched IN that is marked Waiting was preempted in
///   the middle of going to sleep. It must stay Waiting so the sleep is
///   retried when it runs; stomping it to Running would lose the sleep.
/// - A thread being switched AWAY FROM that is still marked Running (and
///   is not sleeping or exiting) indicates a lost transition somewhere.
///   That is diagnosed loudly but survived, as is switching to a thread
///   already marked Running.
///
/// Wrap-up of the voluntary transitions also lands here: a CHANGING
/// thread's admission becomes final, and an EXITING thread's exit time is
/// stamped.
///
/// # Arguments
/// - `local`: this CPU's scheduler state, lock held
/// - `platform`: timer and interrupt-priority intrinsics
/// - `cur`: the thread that was running when the engine was entered
/// - `next`: the class handler's pick (may be `cur` itself)
/// - `flags`: `cur`'s transition flags, snapshotted at engine entry
/// - `now`: the instant the timer arm is computed against
///
/// # Returns
/// - `Outcome::Switch(next)` when `next` differs from `cur`: statistics,
///   statuses, the timer, and the interrupt priority class are all set;
///   the caller performs the actual context switch
/// - `Outcome::NoChange` when the pick is the current thread: it is
///   re-marked Running (unless Waiting) and keeps the CPU
fn commit(
    local: &mut LocalState,
    platform: &dyn Platform,
    cur: ThreadRef,
    next: ThreadRef,
    flags: &EntryFlags,
    now: u64,
) -> Outcome {
    {
        let mut rt = cur.rt.lock();
        rt.stats.resched_long_count += 1;
        if flags.changing {
            log::trace!("thread {} constraint change complete", cur.tid);
            rt.status = RtStatus::Admitted;
        }
        if flags.going_to_exit {
            rt.exit_time = now;
        }
    }

    local.current = next.clone();

    // arm the timer according to the nature of the next thread
    set_timer(local, Some(&next), now, platform);

    if next.tid != cur.tid {
        {
            let mut nrt = next.rt.lock();
            if nrt.thread_status == ThreadStatus::Running {
                log::error!(
                    "switching to thread {} that is already marked running (old tid={})",
                    next.tid,
                    cur.tid
                );
            }
            // We may have preempted a thread in the middle of going to
            // sleep; its status must stay Waiting so the sleep is retried.
            if nrt.thread_status != ThreadStatus::Waiting {
                nrt.thread_status = ThreadStatus::Running;
            }
            nrt.stats.switch_in_count += 1;
            // we are switching threads; start accounting for the new one
            nrt.cur_run_time = 0;
        }
        {
            // catch races between the scheduler running in thread context
            // and in interrupt context
            let crt = cur.rt.lock();
            if crt.thread_status == ThreadStatus::Running
                && !flags.going_to_sleep
                && !flags.going_to_exit
            {
                log::error!(
                    "old thread {} (not sleeping or exiting) is still marked running (new tid={})",
                    cur.tid,
                    next.tid
                );
            }
        }

        log::trace!(
            "switching from {} ({}) to {} ({}) on {}",
            cur.tid,
            cur.display_name(),
            next.tid,
            next.display_name(),
            local.cpu
        );

        // instantiate the next thread's interrupt priority class
        set_interrupt_priority(platform, local.cpu, &next);

        Outcome::Switch(next)
    } else {
        let mut crt = cur.rt.lock();
        // the thread may be marked Waiting if we preempted it in the
        // middle of going to sleep
        if crt.thread_status != ThreadStatus::Suspended
            && crt.thread_status != ThreadStatus::Waiting
            && !flags.yielding
        {
            log::error!(
                "staying with thread {} but it is not marked suspended or waiting (status {:?})",
                cur.tid,
                crt.thread_status
            );
        }
        if crt.thread_status != ThreadStatus::Waiting {
            crt.thread_status = ThreadStatus::Running;
        }
        log::trace!("staying with current task {} ({})", cur.tid, cur.display_name());
        Outcome::NoChange
    }
}

/// Arm the one-shot timer for the next interesting event.
///
/// The next event is the earlier of the next pending arrival and the
/// moment the given thread exhausts its budget: one quantum for an
/// aperiodic thread, the remaining size for a sporadic, the remaining
/// slice for a periodic. The configured slack is added on top to absorb
/// scheduler overhead. An instant already in the past degrades to the
/// minimum possible arm so the interrupt still fires.
///
/// Also stamps the thread's `start_time`, which is what the next
/// accounting flush charges against.
///
/// # Arguments
/// - `local`: this CPU's scheduler state, lock held
/// - `thread`: the thread about to run, whose budget bounds the arm
/// - `now`: the instant the deltas are computed from
/// - `platform`: the one-shot timer intrinsic (if-earlier semantics)
pub(crate) fn set_timer(
    local: &mut LocalState,
    thread: Option<&ThreadRef>,
    now: u64,
    platform: &dyn Platform,
) {
    let next_arrival = local
        .pending
        .peek_min()
        .map(|(key, _)| key)
        .unwrap_or(u64::MAX);

    let mut next_preempt = u64::MAX;
    if let Some(t) = thread {
        let mut rt = t.rt.lock();
        next_preempt = match rt.constraints {
            Constraints::Aperiodic { .. } => now + local.cfg.aperiodic_quantum_ns,
            Constraints::Sporadic { size_ns, .. } => {
                now + size_ns.saturating_sub(rt.run_time)
            }
            Constraints::Periodic { slice_ns, .. } => {
                now + slice_ns.saturating_sub(rt.run_time)
            }
        };
        rt.start_time = now;
    }

    local.timer.start_time = now;
    local.timer.set_time = next_arrival.min(next_preempt);

    let mut delay = local
        .timer
        .set_time
        .saturating_sub(now)
        .saturating_add(local.cfg.slack_ns);

    if platform.now_ns() >= local.timer.set_time {
        log::trace!(
            "time of next event has already passed (now={}, set_time={})",
            platform.now_ns(),
            local.timer.set_time
        );
        delay = 1;
    }

    platform.set_oneshot_timer(local.cpu, delay);
}

/// Install the CPU's interrupt priority class for the thread being
/// switched in.
///
/// Under the interrupt-thread model only the interrupt thread takes
/// interrupts openly; everyone else masks all but the scheduling class.
/// Otherwise the class comes from the thread's own constraints.
fn set_interrupt_priority(platform: &dyn Platform, cpu: CpuId, thread: &ThreadRef) {
    #[cfg(feature = "interrupt-thread")]
    {
        if thread.is_intr() {
            platform.set_interrupt_priority(cpu, 0x0);
        } else {
            platform.set_interrupt_priority(cpu, 0xe);
        }
    }
    #[cfg(not(feature = "interrupt-thread"))]
    {
        let class = thread.rt.lock().constraints.interrupt_priority_class();
        platform.set_interrupt_priority(cpu, class);
    }
}

/// Drive a voluntary transition (yield, sleep, exit, constraint change)
/// through the engine.
///
/// The current thread's scheduler status is set to the requested
/// transition, the engine runs, and any resulting switch is performed
/// through the platform. On return the prior status has been restored,
/// unless the thread is gone for good (an exiting thread never returns
/// through here, so its EXITING status must survive for the reaper).
///
/// # Arguments
/// - `platform`: context-switch and stack-check intrinsics
/// - `cpu`: the CPU this transition is happening on
/// - `what`: which transition; must be one of Sleeping, Yielding,
///   Exiting, or Changing
/// - `guard`: ownership of the CPU lock; it is always released before any
///   context switch (interrupt state is the caller's business)
pub(crate) fn special_switch(
    platform: &dyn Platform,
    cpu: CpuId,
    what: RtStatus,
    mut guard: MutexGuard<'_, LocalState>,
) {
    debug_assert!(matches!(
        what,
        RtStatus::Sleeping | RtStatus::Yielding | RtStatus::Exiting | RtStatus::Changing
    ));

    let cur = guard.current.clone();

    log::trace!("{:?} {} \"{}\"", what, cur.tid, cur.name);

    #[cfg(feature = "stack-check")]
    {
        if !platform.stack_ok(cpu) {
            panic!(
                "thread {} ({}) has run off the end of its stack",
                cur.tid,
                cur.display_name()
            );
        }
    }

    let last_status = {
        let mut rt = cur.rt.lock();
        let s = rt.status;
        rt.status = what;
        s
    };

    match need_resched_locked(&mut guard, platform, ReschedSource::Direct) {
        Outcome::NoChange => {
            match what {
                RtStatus::Sleeping => {
                    log::error!("attempt to sleep resulted in no context switch")
                }
                RtStatus::Exiting => {
                    log::error!("attempt to exit resulted in no context switch")
                }
                RtStatus::Changing => log::trace!("constraint change completed - no switch"),
                RtStatus::Yielding => log::trace!("yield complete - no switch"),
                _ => {}
            }
            drop(guard);
        }
        Outcome::Switch(next) => {
            log::trace!("switching to {} \"{}\"", next.tid, next.name);
            // release the lock, but the local critical section continues;
            // whatever we switch to restores the interrupt state
            drop(guard);
            platform.switch_to(cpu, &next);
            log::trace!("after return from switch (back in {} \"{}\")", cur.tid, cur.name);
        }
    }

    // restore the status we had on entry; an exiting thread never returns
    // through here
    if what != RtStatus::Exiting {
        cur.rt.lock().status = last_status;
    }
}
