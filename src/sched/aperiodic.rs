/*
 * Aperiodic Scheduling Policies
 *
 * The aperiodic underlay runs whenever no real-time thread is runnable.
 * The policy is selected statically at build time, mirroring a kernel
 * configuration choice; all queue types are always compiled, but the
 * per-CPU state instantiates exactly one of them:
 *
 * - round-robin: plain FIFO rotation, no notion of priority.
 * - lottery: ticket lottery over the FIFO; tickets are the constraint
 *   priority, so a larger priority value draws more often.
 * - dynamic-quantum / dynamic-lifetime: a priority heap keyed by
 *   baseline priority plus run time (bounded by the quantum for the
 *   quantum variant), with a small random factor to keep rotating among
 *   similarly-behaving threads.
 *
 * For round-robin and lottery, the idle thread is skipped by queue logic
 * when any other thread is available. The dynamic policies instead force
 * the idle thread's key to the largest possible value, so no special
 * skipping is needed there.
 */

use crate::platform::Platform;

use super::state::LocalState;
use super::thread::ThreadRef;
#[cfg(not(feature = "aperiodic-round-robin"))]
use super::types::Constraints;
use super::types::{QueueKind, SchedError};

#[cfg(all(feature = "aperiodic-round-robin", feature = "aperiodic-lottery"))]
compile_error!("select exactly one aperiodic policy feature");
#[cfg(all(feature = "aperiodic-round-robin", feature = "aperiodic-dynamic-quantum"))]
compile_error!("select exactly one aperiodic policy feature");
#[cfg(all(feature = "aperiodic-round-robin", feature = "aperiodic-dynamic-lifetime"))]
compile_error!("select exactly one aperiodic policy feature");
#[cfg(all(feature = "aperiodic-lottery", feature = "aperiodic-dynamic-quantum"))]
compile_error!("select exactly one aperiodic policy feature");
#[cfg(all(feature = "aperiodic-lottery", feature = "aperiodic-dynamic-lifetime"))]
compile_error!("select exactly one aperiodic policy feature");
#[cfg(all(feature = "aperiodic-dynamic-quantum", feature = "aperiodic-dynamic-lifetime"))]
compile_error!("select exactly one aperiodic policy feature");
#[cfg(not(any(
    feature = "aperiodic-round-robin",
    feature = "aperiodic-lottery",
    feature = "aperiodic-dynamic-quantum",
    feature = "aperiodic-dynamic-lifetime"
)))]
compile_error!("no aperiodic policy selected");

#[cfg(feature = "aperiodic-round-robin")]
pub(crate) type AperiodicQueue = super::queue::RunQueue;
#[cfg(feature = "aperiodic-lottery")]
pub(crate) type AperiodicQueue = super::queue::LotteryQueue;
#[cfg(any(feature = "aperiodic-dynamic-quantum", feature = "aperiodic-dynamic-lifetime"))]
pub(crate) type AperiodicQueue = super::queue::DeadlineHeap;

#[cfg(feature = "aperiodic-round-robin")]
pub(crate) fn new_aperiodic_queue() -> AperiodicQueue {
    super::queue::RunQueue::new()
}
#[cfg(feature = "aperiodic-lottery")]
pub(crate) fn new_aperiodic_queue() -> AperiodicQueue {
    super::queue::LotteryQueue::new()
}
#[cfg(any(feature = "aperiodic-dynamic-quantum", feature = "aperiodic-dynamic-lifetime"))]
pub(crate) fn new_aperiodic_queue() -> AperiodicQueue {
    super::queue::DeadlineHeap::new("aperiodic")
}

/// Short policy tag for the core dump line
pub(crate) fn policy_name() -> &'static str {
    #[cfg(feature = "aperiodic-round-robin")]
    {
        "RR"
    }
    #[cfg(feature = "aperiodic-lottery")]
    {
        "LO"
    }
    #[cfg(feature = "aperiodic-dynamic-quantum")]
    {
        "DQ"
    }
    #[cfg(feature = "aperiodic-dynamic-lifetime")]
    {
        "DL"
    }
}

/// Headroom kept below the idle floor so the random tie-break factor can
/// never promote a regular thread past the idle thread (or wrap). The
/// factor is `now & 0xfff`, at most 4095, so the margin must cover it.
#[cfg(any(feature = "aperiodic-dynamic-quantum", feature = "aperiodic-dynamic-lifetime"))]
const DYNAMIC_CLAMP: u64 = u64::MAX - 4096;

impl LocalState {
    /// Recompute the dynamic priority key of an aperiodic thread.
    ///
    /// Under round-robin and lottery there is no key to update; putting
    /// the thread back on the queue is all the policy needs.
    #[cfg(any(feature = "aperiodic-round-robin", feature = "aperiodic-lottery"))]
    pub(crate) fn update_aperiodic(&self, _thread: &ThreadRef, _now: u64) {}

    /// Recompute the dynamic priority key of an aperiodic thread: its
    /// baseline priority plus the time it has run (this quantum or over
    /// its lifetime), plus a small random factor to keep rotating among
    /// similarly-behaving threads. The idle thread sits at the floor.
    #[cfg(any(feature = "aperiodic-dynamic-quantum", feature = "aperiodic-dynamic-lifetime"))]
    pub(crate) fn update_aperiodic(&self, thread: &ThreadRef, now: u64) {
        let mut rt = thread.rt.lock();
        let Constraints::Aperiodic { priority, .. } = rt.constraints else {
            return;
        };

        if thread.is_idle {
            // lowest possible priority
            rt.deadline = u64::MAX;
            return;
        }

        #[cfg(feature = "aperiodic-dynamic-quantum")]
        let mut key = priority.wrapping_add(rt.cur_run_time.min(self.cfg.aperiodic_quantum_ns));
        #[cfg(feature = "aperiodic-dynamic-lifetime")]
        let mut key = priority.wrapping_add(rt.run_time);

        // bounded below by the baseline priority and above by the idle
        // floor less the tie-break headroom
        if key < priority || key > DYNAMIC_CLAMP {
            // overflowed, or could hit the idle priority once the random
            // factor is added
            key = DYNAMIC_CLAMP;
        }
        // now & 0xfff stays within the clamp headroom, so this cannot
        // wrap nor hit the idle priority
        rt.deadline = key.wrapping_add(now & 0xfff);
    }

    /// Enqueue an aperiodic thread on the policy queue
    pub(crate) fn put_aperiodic(&mut self, thread: &ThreadRef) -> Result<(), SchedError> {
        #[cfg(feature = "aperiodic-round-robin")]
        {
            let mut rt = thread.rt.lock();
            self.aperiodic.enqueue(thread.clone())?;
            rt.q_kind = QueueKind::Aperiodic;
            Ok(())
        }

        #[cfg(feature = "aperiodic-lottery")]
        {
            let mut rt = thread.rt.lock();
            let tickets = match rt.constraints {
                Constraints::Aperiodic { priority, .. } => priority.max(1),
                _ => 1,
            };
            self.aperiodic.enqueue(tickets, thread.clone())?;
            rt.q_kind = QueueKind::Aperiodic;
            Ok(())
        }

        #[cfg(any(feature = "aperiodic-dynamic-quantum", feature = "aperiodic-dynamic-lifetime"))]
        {
            let mut rt = thread.rt.lock();
            let key = rt.deadline;
            self.aperiodic.enqueue(key, thread.clone())?;
            rt.q_kind = QueueKind::Aperiodic;
            Ok(())
        }
    }

    /// Take the next aperiodic thread to run, per the built-in policy
    pub(crate) fn next_aperiodic(&mut self, platform: &dyn Platform) -> Option<ThreadRef> {
        #[cfg(feature = "aperiodic-round-robin")]
        let picked = {
            let _ = platform;
            let r = self.aperiodic.dequeue()?;
            // skip the idle thread if anything else is queued behind it
            if r.is_idle && !self.aperiodic.is_empty() {
                let _ = self.aperiodic.enqueue(r);
                self.aperiodic.dequeue()
            } else {
                Some(r)
            }
        };

        #[cfg(feature = "aperiodic-lottery")]
        let picked = self.aperiodic.draw(platform.random());

        #[cfg(any(feature = "aperiodic-dynamic-quantum", feature = "aperiodic-dynamic-lifetime"))]
        let picked = {
            let _ = platform;
            self.aperiodic.dequeue()
        };

        let t = picked?;
        t.rt.lock().q_kind = QueueKind::Unqueued;
        Some(t)
    }

    /// Remove a specific thread from the aperiodic queue (migration path)
    pub(crate) fn remove_aperiodic(&mut self, thread: &ThreadRef) -> Option<ThreadRef> {
        let removed = self.aperiodic.remove(thread.tid)?;
        removed.rt.lock().q_kind = QueueKind::Unqueued;
        Some(removed)
    }

    pub(crate) fn have_aperiodic(&self) -> bool {
        !self.aperiodic.is_empty()
    }

    pub(crate) fn aperiodic_len(&self) -> usize {
        self.aperiodic.len()
    }

    /// Thread at `pos` of the aperiodic queue, in storage order; used by
    /// the work-stealing survey
    pub(crate) fn peek_aperiodic(&self, pos: usize) -> Option<&ThreadRef> {
        #[cfg(feature = "aperiodic-round-robin")]
        {
            self.aperiodic.peek(pos)
        }
        #[cfg(feature = "aperiodic-lottery")]
        {
            self.aperiodic.peek(pos)
        }
        #[cfg(any(feature = "aperiodic-dynamic-quantum", feature = "aperiodic-dynamic-lifetime"))]
        {
            self.aperiodic.peek_at(pos)
        }
    }

    pub(crate) fn dump_aperiodic(&self, pre: &str) {
        self.aperiodic.dump(pre);
    }
}
