/*
 * Scheduler Thread State
 *
 * Per-thread state as the scheduler sees it, abstracted from the overall
 * thread context (stacks, wait queues, and events belong to the thread
 * subsystem proper). From this scheduler's perspective we only care about
 * constraints, where the thread is queued, and its timing accounting.
 *
 * Ownership model: a thread is a ThreadCell shared by Arc. The identity
 * fields are immutable, cross-CPU facts live in atomics, and everything the
 * reschedule engine mutates sits in one spin::Mutex<RtState>. Queues hold
 * owned Arc handles plus a key frozen at enqueue time, never borrows, so
 * heap maintenance does not take thread locks. Thread locks are only ever
 * taken one at a time, under the owning CPU's scheduler lock.
 */

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use super::types::{Constraints, CpuId, QueueKind, RtStatus, ThreadId, ThreadStatus};

/// Shared handle to a scheduler-visible thread
pub type ThreadRef = Arc<ThreadCell>;

/// Scheduling statistics, reset whenever constraints change
#[derive(Debug, Default, Copy, Clone)]
pub struct SchedStats {
    /// How many times it has arrived (always 1 for aperiodic)
    pub arrival_count: u64,
    /// How many times resched was invoked on this thread
    pub resched_count: u64,
    /// How many times the long path was taken for the thread
    pub resched_long_count: u64,
    /// Number of times switched to
    pub switch_in_count: u64,
    /// Number of deadline misses
    pub miss_count: u64,
    /// Sum of missed time
    pub miss_time_sum: u64,
    /// Sum of squares of missed time
    pub miss_time_sum2: u64,
}

/// Mutable scheduler state of one thread
#[derive(Debug)]
pub struct RtState {
    /// How this thread is to be scheduled
    pub constraints: Constraints,
    /// Scheduler-level status
    pub status: RtStatus,
    /// Which queue the thread is currently on
    pub q_kind: QueueKind,
    /// Thread-object status the switch machinery observes
    pub thread_status: ThreadStatus,

    /// When last started running
    pub start_time: u64,
    /// How long it has run without being preempted
    pub cur_run_time: u64,
    /// How long it has run so far: full duration for aperiodic and
    /// sporadic, the current slice for periodic
    pub run_time: u64,
    /// Current deadline / time of next arrival if pending; for an
    /// aperiodic thread this is its current dynamic priority
    pub deadline: u64,
    /// Time of actual completion
    pub exit_time: u64,

    pub stats: SchedStats,
}

impl RtState {
    fn new(constraints: Constraints) -> Self {
        Self {
            constraints,
            status: RtStatus::Arrived,
            q_kind: QueueKind::Unqueued,
            thread_status: ThreadStatus::Init,
            start_time: 0,
            cur_run_time: 0,
            run_time: 0,
            deadline: 0,
            exit_time: 0,
            stats: SchedStats::default(),
        }
    }

    /// Clear the timing fields; done on every admission
    pub fn reset_state(&mut self) {
        self.start_time = 0;
        self.cur_run_time = 0;
        self.run_time = 0;
        self.deadline = 0;
        self.exit_time = 0;
    }

    /// Clear the statistics; done on every admission. An aperiodic thread
    /// counts as having arrived once.
    pub fn reset_stats(&mut self) {
        self.stats = SchedStats::default();
        if self.constraints.is_aperiodic() {
            self.stats.arrival_count = 1;
        }
    }

    /// Record a deadline miss if `now` is past the thread's deadline.
    /// Non-fatal: the miss is counted and the caller decides what happens
    /// to the thread next.
    pub fn check_deadline(&mut self, now: u64) -> bool {
        if now > self.deadline {
            let late = now - self.deadline;
            log::debug!(
                "missed deadline {} by {} (now={})",
                self.deadline,
                late,
                now
            );
            self.stats.miss_count += 1;
            self.stats.miss_time_sum += late;
            self.stats.miss_time_sum2 += late * late;
            true
        } else {
            false
        }
    }
}

/// A scheduler-visible thread
///
/// Identity is immutable after creation; `current_cpu` is atomic because
/// migration rewrites it under the source CPU's lock while peers read it,
/// and `is_intr` is a one-way promotion flag.
pub struct ThreadCell {
    pub tid: ThreadId,
    pub name: String,
    pub is_idle: bool,
    /// CPU the thread is pinned to, if any; bound threads never migrate
    pub bound_cpu: Option<CpuId>,
    /// CPU whose scheduler currently owns the thread
    pub current_cpu: AtomicU32,
    /// This is an interrupt thread
    pub is_intr: AtomicBool,
    pub rt: Mutex<RtState>,
}

impl ThreadCell {
    pub fn new(
        tid: ThreadId,
        name: &str,
        constraints: Constraints,
        bound_cpu: Option<CpuId>,
        is_idle: bool,
    ) -> ThreadRef {
        Arc::new(Self {
            tid,
            name: String::from(name),
            is_idle,
            bound_cpu,
            current_cpu: AtomicU32::new(bound_cpu.map(|c| c.0).unwrap_or(0)),
            is_intr: AtomicBool::new(false),
            rt: Mutex::new(RtState::new(constraints)),
        })
    }

    pub fn current_cpu(&self) -> CpuId {
        CpuId(self.current_cpu.load(Ordering::SeqCst))
    }

    pub fn set_current_cpu(&self, cpu: CpuId) {
        self.current_cpu.store(cpu.0, Ordering::SeqCst);
    }

    pub fn is_intr(&self) -> bool {
        self.is_intr.load(Ordering::SeqCst)
    }

    /// Promote to interrupt thread
    pub fn mark_intr(&self) {
        self.is_intr.store(true, Ordering::SeqCst);
    }

    /// Display name, with the idle thread and nameless threads spelled out
    pub fn display_name(&self) -> &str {
        if self.is_idle {
            "(idle)"
        } else if self.name.is_empty() {
            "(noname)"
        } else {
            &self.name
        }
    }

    /// Cumulative run time
    pub fn runtime(&self) -> u64 {
        self.rt.lock().run_time
    }

    /// One-line state dump through the logger
    pub fn dump(&self, prefix: &str) {
        let rt = self.rt.lock();
        let status = match rt.thread_status {
            ThreadStatus::Init => "ini",
            ThreadStatus::Running => "RUN",
            ThreadStatus::Waiting => "wai",
            ThreadStatus::Suspended => "sus",
            ThreadStatus::Exited => "exi",
        };
        let rt_status = match rt.status {
            RtStatus::Arrived => "arr",
            RtStatus::Admitted => "adm",
            RtStatus::Changing => "cha",
            RtStatus::Yielding => "yie",
            RtStatus::Sleeping => "sle",
            RtStatus::Exiting => "exi",
            RtStatus::Denied => "den",
        };
        let cons = match rt.constraints {
            Constraints::Aperiodic {
                priority,
                interrupt_priority_class,
            } => {
                log::info!(
                    "{}: {}t {}c{} {} {} {} {}s {}c {}r {}d {}e aperiodic({}tp, {}) stats: {}a {}re {}rl {}sw {}m",
                    prefix,
                    self.tid,
                    self.current_cpu.load(Ordering::Relaxed),
                    if self.bound_cpu.is_some() { "b" } else { "" },
                    self.display_name(),
                    status,
                    rt_status,
                    rt.start_time,
                    rt.cur_run_time,
                    rt.run_time,
                    rt.deadline,
                    rt.exit_time,
                    interrupt_priority_class,
                    priority,
                    rt.stats.arrival_count,
                    rt.stats.resched_count,
                    rt.stats.resched_long_count,
                    rt.stats.switch_in_count,
                    rt.stats.miss_count,
                );
                return;
            }
            Constraints::Periodic {
                period_ns,
                slice_ns,
                interrupt_priority_class,
                ..
            } => ("periodic", period_ns, slice_ns, interrupt_priority_class),
            Constraints::Sporadic {
                size_ns,
                deadline_ns,
                interrupt_priority_class,
                ..
            } => ("sporadic", size_ns, deadline_ns, interrupt_priority_class),
        };
        log::info!(
            "{}: {}t {}c{} {} {} {} {}s {}c {}r {}d {}e {}({}tp, {},{}) stats: {}a {}re {}rl {}sw {}m",
            prefix,
            self.tid,
            self.current_cpu.load(Ordering::Relaxed),
            if self.bound_cpu.is_some() { "b" } else { "" },
            self.display_name(),
            status,
            rt_status,
            rt.start_time,
            rt.cur_run_time,
            rt.run_time,
            rt.deadline,
            rt.exit_time,
            cons.0,
            cons.3,
            cons.1,
            cons.2,
            rt.stats.arrival_count,
            rt.stats.resched_count,
            rt.stats.resched_long_count,
            rt.stats.switch_in_count,
            rt.stats.miss_count,
        );
    }
}

// fmt::Debug by hand: the rt lock must not be taken here, a thread may be
// formatted from a context that already holds it.
impl fmt::Debug for ThreadCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCell")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("is_idle", &self.is_idle)
            .field("bound_cpu", &self.bound_cpu)
            .finish()
    }
}
