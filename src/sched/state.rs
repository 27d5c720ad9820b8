/*
 * Per-CPU Scheduler State
 *
 * One LocalState per CPU, protected by a spin lock taken with interrupts
 * disabled. It owns the three scheduling queues, the currently running
 * thread, the timer bookkeeping, and the CPU's configuration.
 *
 * The runnable queue holds periodic and sporadic threads that have arrived
 * (EDF order on absolute deadline); the pending queue holds real-time
 * threads that have not yet arrived (ordered on next arrival time); the
 * aperiodic queue's concrete type is chosen at build time by the policy
 * features (see aperiodic.rs).
 */

use super::aperiodic::AperiodicQueue;
use super::queue::DeadlineHeap;
use super::thread::ThreadRef;
use super::types::{CpuId, QueueKind, SchedConfig, SchedError};

/// Timer bookkeeping for one CPU
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct TimerState {
    /// Time when the next timer interrupt should occur
    pub set_time: u64,
    /// Time from when the current thread starts running (exit from the
    /// reschedule engine)
    pub start_time: u64,
    /// ... to when it stops (entry to the reschedule engine)
    pub end_time: u64,
}

/// Per-CPU scheduler state; all fields are guarded by the owning CpuState
/// lock
pub(crate) struct LocalState {
    pub cpu: CpuId,
    pub cfg: SchedConfig,
    /// The thread executing on this CPU
    pub current: ThreadRef,
    /// Periodic and sporadic threads that have arrived (and are runnable)
    pub runnable: DeadlineHeap,
    /// Periodic and sporadic threads that have not yet arrived
    pub pending: DeadlineHeap,
    /// Aperiodic threads that are runnable
    pub aperiodic: AperiodicQueue,
    pub timer: TimerState,
    /// How many threads this CPU has successfully stolen
    pub num_thefts: u64,
}

impl LocalState {
    pub fn new(cpu: CpuId, cfg: SchedConfig, boot_thread: ThreadRef) -> Self {
        Self {
            cpu,
            cfg,
            current: boot_thread,
            runnable: DeadlineHeap::new("runnable"),
            pending: DeadlineHeap::new("pending"),
            aperiodic: super::aperiodic::new_aperiodic_queue(),
            timer: TimerState::default(),
            num_thefts: 0,
        }
    }

    /// Enqueue on the EDF runnable queue, keyed by the thread's current
    /// deadline
    pub fn put_runnable(&mut self, thread: &ThreadRef) -> Result<(), SchedError> {
        let mut rt = thread.rt.lock();
        let key = rt.deadline;
        self.runnable.enqueue(key, thread.clone())?;
        rt.q_kind = QueueKind::Runnable;
        Ok(())
    }

    /// Enqueue on the pending queue, keyed by the thread's next arrival
    /// time (stored in its deadline field)
    pub fn put_pending(&mut self, thread: &ThreadRef) -> Result<(), SchedError> {
        let mut rt = thread.rt.lock();
        let key = rt.deadline;
        self.pending.enqueue(key, thread.clone())?;
        rt.q_kind = QueueKind::Pending;
        Ok(())
    }

    pub fn have_rt(&self) -> bool {
        !self.runnable.is_empty()
    }

    /// Deadline of the earliest-deadline runnable thread
    pub fn peek_rt(&self) -> Option<(u64, &ThreadRef)> {
        self.runnable.peek_min()
    }

    /// Take the earliest-deadline runnable thread
    pub fn next_rt(&mut self) -> Option<ThreadRef> {
        let t = self.runnable.dequeue()?;
        t.rt.lock().q_kind = QueueKind::Unqueued;
        Some(t)
    }

    pub fn have_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Take the next-arriving pending thread
    pub fn next_pending(&mut self) -> Option<ThreadRef> {
        let t = self.pending.dequeue()?;
        t.rt.lock().q_kind = QueueKind::Unqueued;
        Some(t)
    }
}
