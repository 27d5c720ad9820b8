/*
 * Per-CPU Real-Time Scheduler
 *
 * This module implements a per-CPU hard real-time scheduler based on the
 * model of Liu: threads are aperiodic (simple priority, not real-time),
 * periodic (phase, period, slice), or sporadic (phase, size, deadline).
 * On creation a thread is aperiodic with the configured default priority.
 *
 * ARCHITECTURE:
 * ============
 *
 * - System owns an array of per-CPU states indexed by CPU id plus the
 *   global thread registry. The kernel builds one System at boot and the
 *   test suite builds as many as it likes against a simulated platform.
 * - Each CPU's state is guarded by a spin lock taken with interrupts
 *   disabled on the locking CPU. Peers take it only for migration, work
 *   stealing, and diagnostics; no two CPU locks are ever held at once.
 * - All scheduling decisions happen in the reschedule engine
 *   (engine::need_resched_locked); this module provides the stable outer
 *   operations: init, make-runnable, yield/sleep/exit, kick, reaping,
 *   lookups, and the diagnostic dumps.
 *
 * INVARIANTS:
 * ==========
 *
 * - A thread is on at most one queue, and its queue tag says which.
 * - The runnable queue is EDF-ordered on absolute deadline; the pending
 *   queue is ordered on next arrival.
 * - The idle thread is aperiodic, bound to its CPU, and never displaces
 *   another runnable thread.
 * - The current pointer of a CPU always names the thread executing there,
 *   and its runtime is flushed before any decision is taken.
 */

pub mod admission;
pub mod aperiodic;
pub mod engine;
pub mod migrate;
pub mod queue;
pub mod registry;
pub mod state;
pub mod thread;
pub mod types;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::platform::Platform;

use engine::Outcome;
use registry::GlobalRegistry;
use state::LocalState;
use thread::{ThreadCell, ThreadRef};
use types::{Constraints, CpuId, Placement, ReschedSource, RtStatus, SchedConfig, SchedError,
            ThreadId, ThreadStatus};

/// One CPU's slot in the system: the lock and the state behind it
pub(crate) struct CpuState {
    pub sched: Mutex<LocalState>,
}

/// The scheduler system: per-CPU states, the global registry, and the
/// platform everything runs against
pub struct System {
    platform: Arc<dyn Platform>,
    cfg: SchedConfig,
    cpus: Vec<CpuState>,
    registry: GlobalRegistry,
    next_tid: AtomicU64,
}

impl System {
    /// Bring the scheduler up on every CPU.
    ///
    /// For each CPU this adopts a boot thread as the current thread, puts
    /// an idle thread on the aperiodic queue (and, under the
    /// interrupt-thread model, an interrupt thread placeholder), registers
    /// them globally, and arms the first timer. The bodies of the idle and
    /// interrupt threads belong to the embedding kernel; the reaper is
    /// driven by calling `reap` (see `reaper_loop`).
    pub fn new(platform: Arc<dyn Platform>, num_cpus: usize, cfg: SchedConfig) -> Self {
        assert!(num_cpus > 0, "scheduler needs at least one CPU");

        let mut sys = Self {
            platform,
            cfg,
            cpus: Vec::new(),
            registry: GlobalRegistry::new(),
            next_tid: AtomicU64::new(1),
        };

        log::info!("initializing scheduler ({} cpus)", num_cpus);

        for i in 0..num_cpus {
            let cpu = CpuId(i as u32);
            let state = sys.init_cpu(cpu, num_cpus);
            sys.cpus.push(CpuState {
                sched: Mutex::new(state),
            });
        }

        sys
    }

    /// Build one CPU's local state: boot thread as current, idle thread
    /// queued, timer armed
    fn init_cpu(&self, cpu: CpuId, num_cpus: usize) -> LocalState {
        let now = self.platform.now_ns();

        // the thread context we are called on becomes this CPU's boot
        // thread; it is already running
        let boot = ThreadCell::new(
            self.alloc_tid(),
            "(boot)",
            Constraints::Aperiodic {
                priority: self.cfg.aperiodic_default_priority,
                interrupt_priority_class: 0,
            },
            Some(cpu),
            false,
        );
        {
            let mut rt = boot.rt.lock();
            rt.thread_status = ThreadStatus::Running;
            rt.status = RtStatus::Admitted;
            rt.deadline = self.cfg.aperiodic_default_priority;
            rt.reset_stats();
            rt.start_time = now;
        }
        self.registry.post_create(&*self.platform, num_cpus, &boot);

        let mut local = LocalState::new(cpu, self.cfg, boot);

        // The idle thread: aperiodic, bound to this CPU, never allowed to
        // displace real work. Priority 1 is the minimal ticket share under
        // the lottery policy; the dynamic policies pin idle to the floor
        // regardless, and round-robin skips it whenever a peer is queued.
        let idle = ThreadCell::new(self.alloc_tid(), "(idle)", Constraints::aperiodic(1), Some(cpu), true);
        self.registry.post_create(&*self.platform, num_cpus, &idle);
        if make_runnable_locked(&mut local, &idle, true, now).is_err() {
            panic!("cannot enqueue the idle thread");
        }

        #[cfg(feature = "interrupt-thread")]
        {
            // the interrupt thread starts aperiodic; its body promotes
            // itself to periodic and marks itself via mark_intr
            let intr = ThreadCell::new(
                self.alloc_tid(),
                "(intr)",
                Constraints::Aperiodic {
                    priority: self.cfg.aperiodic_default_priority,
                    interrupt_priority_class: 0xe,
                },
                Some(cpu),
                false,
            );
            intr.mark_intr();
            self.registry.post_create(&*self.platform, num_cpus, &intr);
            if make_runnable_locked(&mut local, &intr, true, now).is_err() {
                panic!("cannot enqueue the interrupt thread");
            }
        }

        // arm the first quantum for the boot thread
        let boot_ref = local.current.clone();
        engine::set_timer(&mut local, Some(&boot_ref), now, &*self.platform);

        log::info!("scheduler up on {}", cpu);
        local
    }

    fn alloc_tid(&self) -> ThreadId {
        ThreadId(self.next_tid.fetch_add(1, Ordering::SeqCst))
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn config(&self) -> &SchedConfig {
        &self.cfg
    }

    pub(crate) fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    pub(crate) fn cpu_state(&self, cpu: CpuId) -> &CpuState {
        &self.cpus[cpu.as_usize()]
    }

    /// Create a scheduler-visible thread and register it globally.
    ///
    /// The thread arrives un-admitted; call `make_runnable` with
    /// `admit = true` to subject it to admission control and queue it.
    pub fn create_thread(
        &self,
        name: &str,
        constraints: Option<Constraints>,
        bound_cpu: Option<CpuId>,
    ) -> ThreadRef {
        let constraints = constraints.unwrap_or(Constraints::Aperiodic {
            priority: self.cfg.aperiodic_default_priority,
            interrupt_priority_class: 0,
        });
        let t = ThreadCell::new(self.alloc_tid(), name, constraints, bound_cpu, false);

        // a provisional deadline until admission installs the real one
        let now = self.platform.now_ns();
        {
            let mut rt = t.rt.lock();
            rt.deadline = match constraints {
                Constraints::Periodic { period_ns, .. } => now + period_ns,
                Constraints::Sporadic { deadline_ns, .. } => now + deadline_ns,
                Constraints::Aperiodic { .. } => 0,
            };
        }

        self.registry.post_create(&*self.platform, self.num_cpus(), &t);
        t
    }

    /// Unregister a thread ahead of destruction
    pub fn destroy_thread(&self, tid: ThreadId) -> Option<ThreadRef> {
        self.registry.pre_destroy(tid)
    }

    /// Optionally admit, then enqueue a thread.
    ///
    /// The thread must be suspended (not running anywhere). Placement
    /// resolves to the caller's CPU for `Local` and for out-of-range
    /// explicit ids.
    pub fn make_runnable(
        &self,
        caller: CpuId,
        thread: &ThreadRef,
        place: Placement,
        admit: bool,
    ) -> Result<(), SchedError> {
        let cpu = match place {
            Placement::Local => caller,
            Placement::Random => CpuId((self.platform.random() % self.num_cpus() as u64) as u32),
            Placement::On(c) if c.as_usize() < self.num_cpus() => c,
            Placement::On(_) => caller,
        };
        // the queue it lands on is the CPU that owns it from here on
        thread.set_current_cpu(cpu);

        let flags = self.platform.irq_save(caller);
        let result = {
            let mut local = self.cpus[cpu.as_usize()].sched.lock();
            make_runnable_locked(&mut local, thread, admit, self.platform.now_ns())
        };
        self.platform.irq_restore(caller, flags);
        result
    }

    /// The reschedule entry point, called from the timer ISR, the kick
    /// ISR, and voluntary paths.
    ///
    /// Returns the thread to switch to, or None when the current thread
    /// keeps the CPU. In both cases the timer has been re-armed for the
    /// next interesting event (unless the fast path ruled nothing could
    /// have changed).
    pub fn need_resched(&self, cpu: CpuId, source: ReschedSource) -> Option<ThreadRef> {
        let flags = self.platform.irq_save(cpu);
        let out = {
            let mut local = self.cpus[cpu.as_usize()].sched.lock();
            engine::need_resched_locked(&mut local, &*self.platform, source)
        };
        self.platform.irq_restore(cpu, flags);
        match out {
            Outcome::NoChange => None,
            Outcome::Switch(t) => Some(t),
        }
    }

    /// The currently running thread of a CPU
    pub fn current(&self, cpu: CpuId) -> ThreadRef {
        self.cpus[cpu.as_usize()].sched.lock().current.clone()
    }

    /// Schedule some other thread if appropriate. A thread yields only if
    /// it wants to remain runnable.
    pub fn yield_now(&self, cpu: CpuId) {
        self.special(cpu, RtStatus::Yielding);
    }

    /// Unconditionally schedule some other thread. A thread sleeps only
    /// if it wants to stop being runnable; waking it back up is the wait
    /// mechanism's `make_runnable` call.
    pub fn sleep(&self, cpu: CpuId) {
        self.special(cpu, RtStatus::Sleeping);
    }

    /// Take the current thread off the CPU for good. In the kernel proper
    /// the switch never returns; the thread is reaped later.
    pub fn exit(&self, cpu: CpuId) {
        {
            let cur = self.current(cpu);
            cur.rt.lock().thread_status = ThreadStatus::Exited;
        }
        self.special(cpu, RtStatus::Exiting);
    }

    fn special(&self, cpu: CpuId, what: RtStatus) {
        let flags = self.platform.irq_save(cpu);
        {
            let local = self.cpus[cpu.as_usize()].sched.lock();
            engine::special_switch(&*self.platform, cpu, what, local);
        }
        self.platform.irq_restore(cpu, flags);
    }

    /// Force a prompt reschedule on another CPU via IPI. A kick to the
    /// calling CPU is dropped: we cannot know whether it is safe to
    /// reschedule from here.
    pub fn kick_cpu(&self, caller: CpuId, cpu: CpuId) {
        if cpu != caller && cpu.as_usize() < self.num_cpus() {
            self.platform.kick(cpu);
        }
    }

    /// Free every exited thread. Safe to call from any CPU at any time.
    pub fn reap(&self) -> usize {
        self.registry.reap()
    }

    /// Body of the optional reaper thread: a lowest-priority aperiodic
    /// loop that wakes every `period_ns` and reaps
    pub fn reaper_loop(&self, period_ns: u64) -> ! {
        loop {
            log::debug!("reaper sleeping");
            self.platform.relax(period_ns);
            log::debug!("reaping threads");
            self.reap();
        }
    }

    pub fn find_thread_by_tid(&self, tid: ThreadId) -> Option<ThreadRef> {
        self.registry.find_by_tid(tid)
    }

    pub fn num_threads(&self) -> u64 {
        self.registry.num_threads()
    }

    /// Cumulative run time of a thread
    pub fn get_runtime(&self, thread: &ThreadRef) -> u64 {
        thread.runtime()
    }

    /// How many aperiodic threads a CPU has queued; work-stealing callers
    /// use this to size their requests
    pub fn aperiodic_backlog(&self, cpu: CpuId) -> usize {
        self.cpus[cpu.as_usize()].sched.lock().aperiodic_len()
    }

    /// One line per CPU: current thread, queue sizes, theft count, policy,
    /// and the utilisation configuration
    pub fn dump_cores(&self, which: Option<CpuId>) {
        #[cfg(feature = "interrupt-thread")]
        let intr_model = "it";
        #[cfg(not(feature = "interrupt-thread"))]
        let intr_model = "ip";

        for (i, cpu) in self.cpus.iter().enumerate() {
            if which.map(|c| c.as_usize() == i).unwrap_or(true) {
                let local = cpu.sched.lock();
                let cur = local.current.clone();
                let ipc = cur.rt.lock().constraints.interrupt_priority_class();
                log::info!(
                    "{}c {} {}t {} {}tp {}p {}r {}a {}m ({}) ({}ul {}sp {}ap {}aq {}adp)",
                    i,
                    intr_model,
                    cur.tid,
                    cur.display_name(),
                    ipc,
                    local.pending.len(),
                    local.runnable.len(),
                    local.aperiodic_len(),
                    local.num_thefts,
                    aperiodic::policy_name(),
                    local.cfg.util_limit,
                    local.cfg.sporadic_reservation,
                    local.cfg.aperiodic_reservation,
                    local.cfg.aperiodic_quantum_ns,
                    local.cfg.aperiodic_default_priority,
                );
            }
        }
    }

    /// One line per thread in the registry (optionally one CPU's threads)
    pub fn dump_threads(&self, cpu: Option<CpuId>) {
        self.registry.dump_threads(cpu);
    }

    /// One line per CPU of timer bookkeeping
    pub fn dump_time(&self, which: Option<CpuId>) {
        for (i, cpu) in self.cpus.iter().enumerate() {
            if which.map(|c| c.as_usize() == i).unwrap_or(true) {
                let local = cpu.sched.lock();
                log::info!(
                    "{}c {}ts {}st {}et {}sl",
                    i,
                    local.timer.set_time,
                    local.timer.start_time,
                    local.timer.end_time,
                    local.cfg.slack_ns,
                );
            }
        }
    }
}

/// Admit (optionally) and enqueue a thread on the locked CPU.
///
/// Admission resets the thread's state and statistics; on success the
/// thread is suspended on the queue its class calls for.
pub(crate) fn make_runnable_locked(
    local: &mut LocalState,
    thread: &ThreadRef,
    admit: bool,
    now: u64,
) -> Result<(), SchedError> {
    if admit {
        admission::admit(local, thread, now).map_err(|e| {
            log::debug!("failed to admit thread {}", thread.tid);
            thread.rt.lock().status = RtStatus::Denied;
            e
        })?;
        log::debug!("admitted thread {}", thread.tid);
    }

    let is_aperiodic = thread.rt.lock().constraints.is_aperiodic();
    if is_aperiodic {
        local.put_aperiodic(thread).map_err(|e| {
            log::error!(
                "failed to make non-RT thread runnable ({} queued)",
                local.aperiodic_len()
            );
            e
        })?;
    } else {
        local.put_pending(thread).map_err(|e| {
            log::error!("failed to make RT thread pending");
            e
        })?;
    }

    let mut rt = thread.rt.lock();
    rt.thread_status = ThreadStatus::Suspended;
    rt.status = RtStatus::Admitted;
    Ok(())
}
