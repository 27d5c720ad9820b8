/*
 * Fiber Scheduler
 *
 * A per-CPU cooperative user-level scheduler nested inside one "fiber
 * thread" per CPU. The fiber thread is an ordinary aperiodic thread at a
 * configured priority; it never runs in interrupt context, and the fibers
 * it hosts switch only when they ask to.
 *
 * Scheduling policy for fibers is pure FIFO round-robin; there is no
 * priority. Each CPU has a run queue, a current-fiber pointer, and an idle
 * fiber that soaks up the CPU when the queue is empty. How the fiber
 * thread quiesces when there is nothing to do is a configuration choice:
 * spin (yield forever), sleep (nap a fixed period), or wait (block until
 * `run` wakes it).
 *
 * Fiber stacks and register state are the platform's business: creating a
 * fiber builds a context that lands in `fiber_wrapper` on first switch,
 * and fork clones a bounded number of the parent's top frames, rewriting
 * the frame chain so the child's caller frame returns into cleanup. The
 * parent of a fork gets the child's handle; the child side observes a
 * zero return through its cloned context. A failed fork is an error value,
 * never a fake handle.
 */

pub mod fiber;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use crate::platform::Platform;
use crate::sched::types::CpuId;

use fiber::{Fiber, FiberFn, FiberRef, FiberStatus};

/// Default fiber stack size when the creator does not care
pub const FSTACK_DEFAULT: usize = 16 * 1024;

/// Where a fiber should land when queued to run
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FiberPlacement {
    /// The calling CPU
    Current,
    /// A uniformly random CPU
    Random,
    /// A specific CPU
    On(CpuId),
}

/// How the fiber thread quiesces when it has no fibers to run
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Quiescence {
    /// Yield in a loop, even with nothing to do
    Spin,
    /// Nap a fixed period; `run` wakes the thread early
    Sleep(u64),
    /// Block on a wait queue until `run` wakes the thread
    Wait,
}

/// Fiber subsystem configuration
#[derive(Debug, Copy, Clone)]
pub struct FiberConfig {
    pub stack_default: usize,
    /// Aperiodic priority the per-CPU fiber thread runs at
    pub thread_priority: u64,
    pub quiescence: Quiescence,
    /// Default landing CPU for forked fibers
    pub fork_cpu_default: FiberPlacement,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            stack_default: FSTACK_DEFAULT,
            thread_priority: 1_000,
            quiescence: Quiescence::Spin,
            fork_cpu_default: FiberPlacement::Current,
        }
    }
}

/// Errors reported to fiber callers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FiberError {
    /// The calling CPU has no fiber context set up
    NotFiberContext,
    /// The target fiber is not ready to be switched to
    NotReady,
    /// The target fiber is finished or exiting
    Exiting,
    /// Stack cloning or child placement failed
    ForkFailed,
    /// CPU out of range
    InvalidCpu,
}

/// What a yield accomplished
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum YieldOutcome {
    /// Switched to another fiber (possibly the idle fiber)
    Switched,
    /// Idle with an empty queue: nothing to do, no switch
    NothingToDo,
    /// The requested target was unavailable; a round-robin pick ran
    /// instead
    SwitchedElsewhere,
}

/// Per-CPU fiber state, all guarded by one lock
struct FiberLocal {
    run_queue: alloc::collections::VecDeque<FiberRef>,
    current: Option<FiberRef>,
    idle: Option<FiberRef>,
    fork_cpu: FiberPlacement,
}

struct FiberCpu {
    state: Mutex<FiberLocal>,
}

/// The fiber subsystem: per-CPU states plus configuration
pub struct FiberSystem {
    platform: Arc<dyn Platform>,
    cfg: FiberConfig,
    cpus: Vec<FiberCpu>,
    next_fid: AtomicU64,
}

fn idle_entry(_input: usize) -> usize {
    0
}

impl FiberSystem {
    pub fn new(platform: Arc<dyn Platform>, num_cpus: usize, cfg: FiberConfig) -> Self {
        log::info!("initializing fibers ({} cpus)", num_cpus);
        Self {
            platform,
            cfg,
            cpus: (0..num_cpus)
                .map(|_| FiberCpu {
                    state: Mutex::new(FiberLocal {
                        run_queue: alloc::collections::VecDeque::new(),
                        current: None,
                        idle: None,
                        fork_cpu: cfg.fork_cpu_default,
                    }),
                })
                .collect(),
            next_fid: AtomicU64::new(1),
        }
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn config(&self) -> &FiberConfig {
        &self.cfg
    }

    fn local(&self, cpu: CpuId) -> MutexGuard<'_, FiberLocal> {
        self.cpus[cpu.as_usize()].state.lock()
    }

    /// Set up the calling CPU's fiber context: build the idle fiber and
    /// make it current. Run by the fiber thread once it has changed its
    /// own constraints to the configured priority.
    pub fn startup(&self, cpu: CpuId) -> Result<(), FiberError> {
        if cpu.as_usize() >= self.cpus.len() {
            return Err(FiberError::InvalidCpu);
        }
        let idle = self.create(idle_entry, 0, None)?;
        idle.mark_idle();
        {
            let mut inner = idle.inner.lock();
            inner.curr_cpu = Some(cpu);
            inner.status = FiberStatus::Run;
        }
        let mut local = self.local(cpu);
        local.current = Some(idle.clone());
        local.idle = Some(idle);
        log::info!("fiber thread context up on {}", cpu);
        Ok(())
    }

    /// The fiber currently running on a CPU
    pub fn current(&self, cpu: CpuId) -> Option<FiberRef> {
        self.local(cpu).current.clone()
    }

    /// Create a fiber and set up its stack so the first switch into it
    /// lands in the wrapper that runs the routine and then exits
    pub fn create(
        &self,
        fun: FiberFn,
        input: usize,
        stack_size: Option<usize>,
    ) -> Result<FiberRef, FiberError> {
        let size = stack_size.unwrap_or(self.cfg.stack_default);
        let fid = self.next_fid.fetch_add(1, Ordering::SeqCst);
        let f = Fiber::new(fid, fun, input, size);
        self.platform.init_fiber_context(&f);
        Ok(f)
    }

    /// Queue a fiber to run on the chosen CPU and wake that CPU's fiber
    /// thread if it is quiescing
    pub fn run(&self, caller: CpuId, f: &FiberRef, target: FiberPlacement) -> Result<(), FiberError> {
        let cpu = self.resolve_placement(caller, target)?;

        {
            let mut inner = f.inner.lock();
            inner.curr_cpu = Some(cpu);
            inner.status = FiberStatus::Ready;
        }
        {
            let mut local = self.local(cpu);
            log::trace!("enqueueing fiber {} on {}", f.id, cpu);
            local.run_queue.push_back(f.clone());
        }

        // wake the fiber thread for the selected CPU (or do nothing if it
        // never sleeps)
        match self.cfg.quiescence {
            Quiescence::Spin => {}
            Quiescence::Sleep(_) | Quiescence::Wait => self.platform.wake_fiber_thread(cpu),
        }
        Ok(())
    }

    /// Create a fiber and queue it in one step
    pub fn start(
        &self,
        caller: CpuId,
        fun: FiberFn,
        input: usize,
        stack_size: Option<usize>,
        target: FiberPlacement,
    ) -> Result<FiberRef, FiberError> {
        let f = self.create(fun, input, stack_size)?;
        self.run(caller, &f, target)?;
        Ok(f)
    }

    fn resolve_placement(&self, caller: CpuId, target: FiberPlacement) -> Result<CpuId, FiberError> {
        match target {
            FiberPlacement::Current => Ok(caller),
            FiberPlacement::Random => {
                Ok(CpuId((self.platform.random() % self.cpus.len() as u64) as u32))
            }
            FiberPlacement::On(c) if c.as_usize() < self.cpus.len() => Ok(c),
            FiberPlacement::On(_) => Err(FiberError::InvalidCpu),
        }
    }

    /// Round-robin pick: the oldest fiber on the CPU's queue
    fn rr_policy(local: &mut FiberLocal) -> Option<FiberRef> {
        local.run_queue.pop_front()
    }

    /// Yield the calling fiber.
    ///
    /// Picks the head of the local queue (the idle fiber if the queue is
    /// empty), re-queues the caller unless it is the idle fiber, and
    /// switches. If the caller is idle and the queue is empty there is
    /// nothing to do and no switch occurs.
    pub fn yield_now(&self, cpu: CpuId) -> Result<YieldOutcome, FiberError> {
        let mut local = self.local(cpu);
        let cur = local.current.clone().ok_or(FiberError::NotFiberContext)?;

        let next = match Self::rr_policy(&mut local) {
            Some(f) => f,
            None => {
                if cur.is_idle() {
                    // idle with nothing queued: stay put
                    return Ok(YieldOutcome::NothingToDo);
                }
                local.idle.clone().ok_or(FiberError::NotFiberContext)?
            }
        };

        self.switch_fibers(local, cpu, &cur, &next);
        Ok(YieldOutcome::Switched)
    }

    /// Yield specifically to `target`.
    ///
    /// The target is extracted from whichever CPU's queue currently holds
    /// it. If it is not ready, `early_return` decides between reporting
    /// failure and falling back to an ordinary yield.
    pub fn yield_to(
        &self,
        cpu: CpuId,
        target: &FiberRef,
        early_return: bool,
    ) -> Result<YieldOutcome, FiberError> {
        let mut local = self.local(cpu);
        let cur = local.current.clone().ok_or(FiberError::NotFiberContext)?;

        if self.claim_fiber(&mut local, cpu, target) {
            self.switch_fibers(local, cpu, &cur, target);
            return Ok(YieldOutcome::Switched);
        }

        log::trace!("yield_to: fiber {} not found in any queue", target.id);

        if early_return {
            return Err(FiberError::NotReady);
        }

        // fall back to a round-robin pick
        let next = match Self::rr_policy(&mut local) {
            Some(f) => f,
            None => {
                if cur.is_idle() {
                    // nothing to switch to and we are already idle
                    return Ok(YieldOutcome::NothingToDo);
                }
                local.idle.clone().ok_or(FiberError::NotFiberContext)?
            }
        };
        self.switch_fibers(local, cpu, &cur, &next);
        Ok(YieldOutcome::SwitchedElsewhere)
    }

    /// Yield only when the supplied condition holds
    pub fn conditional_yield<F: FnOnce() -> bool>(
        &self,
        cpu: CpuId,
        cond: F,
    ) -> Result<YieldOutcome, FiberError> {
        if cond() {
            self.yield_now(cpu)
        } else {
            Ok(YieldOutcome::NothingToDo)
        }
    }

    /// Yield to a specific fiber only when the supplied condition holds
    pub fn conditional_yield_to<F: FnOnce() -> bool>(
        &self,
        cpu: CpuId,
        target: &FiberRef,
        early_return: bool,
        cond: F,
    ) -> Result<YieldOutcome, FiberError> {
        if cond() {
            self.yield_to(cpu, target, early_return)
        } else {
            Ok(YieldOutcome::NothingToDo)
        }
    }

    /// Extract a READY fiber from whichever queue holds it, so the caller
    /// can switch straight to it. Takes the target CPU's lock when the
    /// fiber lives elsewhere; the local queue is handled under the lock
    /// already held (locking it twice would spin forever).
    fn claim_fiber(&self, local: &mut FiberLocal, cpu: CpuId, target: &FiberRef) -> bool {
        let (ready, target_cpu) = {
            let inner = target.inner.lock();
            (inner.status == FiberStatus::Ready, inner.curr_cpu)
        };
        if !ready {
            return false;
        }
        let Some(target_cpu) = target_cpu else {
            return false;
        };

        if target_cpu == cpu {
            let before = local.run_queue.len();
            local.run_queue.retain(|f| f.id != target.id);
            local.run_queue.len() != before
        } else if target_cpu.as_usize() < self.cpus.len() {
            let mut other = self.local(target_cpu);
            let before = other.run_queue.len();
            other.run_queue.retain(|f| f.id != target.id);
            other.run_queue.len() != before
        } else {
            false
        }
    }

    /// Housekeeping common to every fiber-to-fiber switch: statuses, the
    /// current pointer, re-queueing the outgoing fiber, and the context
    /// switch itself (with the state lock released first)
    fn switch_fibers(
        &self,
        mut local: MutexGuard<'_, FiberLocal>,
        cpu: CpuId,
        from: &FiberRef,
        to: &FiberRef,
    ) {
        {
            let mut inner = from.inner.lock();
            if inner.status == FiberStatus::Ready && !from.is_idle() {
                inner.status = FiberStatus::Yield;
            }
        }
        {
            let mut inner = to.inner.lock();
            inner.curr_cpu = Some(cpu);
            inner.status = FiberStatus::Run;
        }
        local.current = Some(to.clone());

        // the outgoing fiber goes to the back of the queue, unless it is
        // the idle fiber
        if !from.is_idle() {
            {
                let mut inner = from.inner.lock();
                inner.status = FiberStatus::Ready;
                inner.curr_cpu = Some(cpu);
            }
            log::trace!("re-enqueueing fiber {}", from.id);
            local.run_queue.push_back(from.clone());
        }

        drop(local);
        self.platform.fiber_switch(cpu, from, to);
    }

    /// Park the calling fiber on `wait_on`'s wait queue until it exits.
    ///
    /// Fails if `wait_on` is already finished or exiting. The caller is
    /// marked WAIT and a switch happens without re-queueing it; `wait_on`
    /// pushes every waiter back into a scheduler queue when it exits.
    pub fn join(&self, cpu: CpuId, wait_on: &FiberRef) -> Result<(), FiberError> {
        let cur = self.current(cpu).ok_or(FiberError::NotFiberContext)?;

        log::trace!("fiber {} joining fiber {}", cur.id, wait_on.id);
        {
            let mut inner = wait_on.inner.lock();
            if inner.is_done || inner.status == FiberStatus::Exit {
                log::debug!("tried to join a fiber which is finished or exiting");
                return Err(FiberError::Exiting);
            }
            inner.waiters.push_back(cur.clone());
        }
        cur.inner.lock().status = FiberStatus::Wait;

        // switch away without re-queueing ourselves
        let mut local = self.local(cpu);
        let next = match Self::rr_policy(&mut local) {
            Some(f) => f,
            None => {
                if cur.is_idle() {
                    // the idle fiber must never block on a join
                    panic!("attempted to join from the idle fiber");
                }
                local.idle.clone().ok_or(FiberError::NotFiberContext)?
            }
        };
        {
            let mut inner = next.inner.lock();
            inner.curr_cpu = Some(cpu);
            inner.status = FiberStatus::Run;
        }
        local.current = Some(next.clone());
        drop(local);
        self.platform.fiber_switch(cpu, &cur, &next);
        Ok(())
    }

    /// Fork the current fiber.
    ///
    /// The child gets a stack of the same allocation with the parent's top
    /// frames cloned and its return path rewired into fiber cleanup; it is
    /// queued on the configured fork CPU. The parent receives the child's
    /// handle; the child side of the cloned context observes zero.
    pub fn fork(&self, cpu: CpuId) -> Result<FiberRef, FiberError> {
        let cur = self.current(cpu).ok_or(FiberError::NotFiberContext)?;

        let child = self.create(cur.fun, cur.input, Some(cur.stack_size))?;
        if self.platform.clone_fiber_stack(&cur, &child).is_err() {
            log::error!("could not clone stack; fork failed");
            return Err(FiberError::ForkFailed);
        }

        let place = self.local(cpu).fork_cpu;
        if self.run(cpu, &child, place).is_err() {
            return Err(FiberError::ForkFailed);
        }
        Ok(child)
    }

    /// Change the default landing CPU of forked fibers for this CPU
    pub fn set_fork_cpu(&self, cpu: CpuId, target: FiberPlacement) -> Result<(), FiberError> {
        if let FiberPlacement::On(c) = target {
            if c.as_usize() >= self.cpus.len() {
                return Err(FiberError::InvalidCpu);
            }
        }
        self.local(cpu).fork_cpu = target;
        Ok(())
    }

    /// Run a fiber's routine and exit it. The first switch into a fresh
    /// fiber lands here via the platform's initial context.
    pub fn fiber_wrapper(&self, cpu: CpuId, f: &FiberRef) {
        log::trace!("executing fiber routine of fiber {}", f.id);
        let out = (f.fun)(f.input);
        f.inner.lock().output = Some(out);
        self.exit_fiber(cpu, f);
    }

    /// Tear down an exiting fiber: release the joiners back into
    /// scheduler queues, free the stack, and switch onward without
    /// pushing anything onto the dead stack.
    pub fn exit_fiber(&self, cpu: CpuId, f: &FiberRef) {
        f.inner.lock().status = FiberStatus::Exit;

        log::trace!(
            "fiber {} exiting with {} waiters",
            f.id,
            f.waiter_count()
        );

        // every waiter goes back to a scheduler queue
        loop {
            let waiter = f.inner.lock().waiters.pop_front();
            match waiter {
                Some(w) => {
                    if self.run(cpu, &w, FiberPlacement::Random).is_err() {
                        log::error!("failed to restart waiter fiber {}", w.id);
                    }
                }
                None => break,
            }
        }

        f.inner.lock().is_done = true;

        let mut local = self.local(cpu);
        let next = match Self::rr_policy(&mut local) {
            Some(n) => n,
            None => local
                .idle
                .clone()
                .expect("fiber context exited with no idle fiber"),
        };
        {
            let mut inner = next.inner.lock();
            inner.curr_cpu = Some(cpu);
            inner.status = FiberStatus::Run;
        }
        local.current = Some(next.clone());
        drop(local);

        // free the stack, then jump without touching it
        *f.stack.lock() = None;
        self.platform.fiber_switch_final(cpu, &next);
    }

    /// Body of the idle fiber: yield forever, quiescing the fiber thread
    /// per configuration whenever the queue is empty
    pub fn idle_loop(&self, cpu: CpuId) -> ! {
        loop {
            let _ = self.yield_now(cpu);
            match self.cfg.quiescence {
                Quiescence::Spin => {}
                Quiescence::Sleep(period_ns) => {
                    if self.local(cpu).run_queue.is_empty() {
                        log::trace!("fiber thread going to sleep");
                        self.platform.relax(period_ns);
                    }
                }
                Quiescence::Wait => {
                    let empty = {
                        let local = self.local(cpu);
                        local.run_queue.is_empty()
                            && local.current.as_ref().map(|f| f.is_idle()).unwrap_or(false)
                    };
                    if empty {
                        log::trace!("fiber thread waiting for more fibers");
                        self.platform.fiber_thread_block(cpu);
                    }
                }
            }
        }
    }

    /// How many fibers are queued on a CPU (diagnostics)
    pub fn queue_len(&self, cpu: CpuId) -> usize {
        self.local(cpu).run_queue.len()
    }
}
