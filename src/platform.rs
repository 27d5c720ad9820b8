/*
 * Platform Boundary
 *
 * Everything architecture-specific the scheduling core relies on is behind
 * the Platform trait: the monotonic clock, the per-CPU one-shot timer, the
 * kick IPI, the NMI broadcast used by the world-stop path, the interrupt
 * priority class (CR8 on x86_64), the debug registers, entropy, and the
 * context-switch contracts for threads and fibers.
 *
 * The core above this line never names hardware. The kernel proper provides
 * the real implementation; SimPlatform below is the deterministic host
 * implementation the test suite drives, with a controllable clock, a seeded
 * RNG, and full recording of timer arms, kicks, and switches.
 */

use crate::fiber::fiber::FiberRef;
use crate::monitor::DebugRegs;
use crate::sched::thread::ThreadRef;
use crate::sched::types::CpuId;

/// The architecture contract the scheduling core is written against.
///
/// Context-switch semantics: `switch_to` suspends the calling context and
/// resumes `to`; it "returns" only when the caller is next switched in.
/// `fiber_switch_final` must not touch the outgoing fiber's stack, which is
/// already freed by the time it is called.
pub trait Platform: Send + Sync {
    /// Monotonic time in nanoseconds
    fn now_ns(&self) -> u64;

    /// Arm the CPU's one-shot timer `delay_ns` from now, keeping any
    /// earlier pending expiry (if-earlier semantics)
    fn set_oneshot_timer(&self, cpu: CpuId, delay_ns: u64);

    /// Send a reschedule kick IPI to `cpu`
    fn kick(&self, cpu: CpuId);

    /// NMI every CPU except `from`
    fn broadcast_nmi(&self, from: CpuId);

    /// Disable interrupts on `cpu`, returning the flags to restore
    fn irq_save(&self, cpu: CpuId) -> u8;

    /// Restore the interrupt state saved by `irq_save`
    fn irq_restore(&self, cpu: CpuId, flags: u8);

    /// Set the interrupt priority class (CR8 equivalent): interrupts at or
    /// below `class` are masked
    fn set_interrupt_priority(&self, cpu: CpuId, class: u8);

    /// Snapshot the CPU's debug registers
    fn read_debug_regs(&self, cpu: CpuId) -> DebugRegs;

    /// Install a debug register snapshot on the CPU
    fn write_debug_regs(&self, cpu: CpuId, regs: DebugRegs);

    /// Uniform random 64-bit value
    fn random(&self) -> u64;

    /// Switch the CPU to `to`; returns when the caller next runs
    fn switch_to(&self, cpu: CpuId, to: &ThreadRef);

    /// Busy-ish wait used by blocking retries and the reaper
    fn relax(&self, duration_ns: u64);

    /// Build the initial context of a fresh fiber so the first switch into
    /// it lands in the fiber wrapper
    fn init_fiber_context(&self, fiber: &FiberRef);

    /// Clone the top frames of `parent`'s stack into `child`, rewriting
    /// the frame chain so the child's caller frame returns into the fiber
    /// cleanup wrapper. Bounded depth; errors are reported, never faked.
    fn clone_fiber_stack(&self, parent: &FiberRef, child: &FiberRef) -> Result<(), ()>;

    /// Save `from`'s register and FP state on its own stack and resume `to`
    fn fiber_switch(&self, cpu: CpuId, from: &FiberRef, to: &FiberRef);

    /// Resume `to` without saving the outgoing context (the outgoing fiber
    /// is gone and its stack is freed)
    fn fiber_switch_final(&self, cpu: CpuId, to: &FiberRef);

    /// Wake the CPU's fiber thread if it is sleeping or waiting for work
    fn wake_fiber_thread(&self, cpu: CpuId);

    /// Block the CPU's fiber thread until `wake_fiber_thread` (wait-queue
    /// quiescence mode)
    fn fiber_thread_block(&self, _cpu: CpuId) {}

    /// Whether the currently executing context is still inside its stack
    /// bounds; consulted on the special-switch path when the stack check
    /// is compiled in
    fn stack_ok(&self, _cpu: CpuId) -> bool {
        true
    }
}

#[cfg(any(test, feature = "sim"))]
pub use self::sim::SimPlatform;

#[cfg(any(test, feature = "sim"))]
mod sim {
    use super::*;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use spin::Mutex;

    /// Deterministic host platform for the test suite.
    ///
    /// Time only moves when a test moves it (or through `relax`), the RNG
    /// is a seeded xorshift so lottery draws are reproducible, and every
    /// hardware-facing call is recorded for assertions.
    pub struct SimPlatform {
        num_cpus: usize,
        clock_ns: AtomicU64,
        rng_state: AtomicU64,
        irq_depth: Vec<AtomicU32>,
        nmi_pending: Vec<AtomicBool>,
        timer_arms: Mutex<Vec<(CpuId, u64)>>,
        kicks: Mutex<Vec<CpuId>>,
        switches: Mutex<Vec<(CpuId, crate::sched::types::ThreadId)>>,
        fiber_switches: Mutex<Vec<(CpuId, u64, u64)>>,
        fiber_wakes: Mutex<Vec<CpuId>>,
        debug_regs: Vec<Mutex<DebugRegs>>,
        interrupt_priority: Vec<AtomicU32>,
    }

    impl SimPlatform {
        pub fn new(num_cpus: usize) -> Self {
            Self::with_seed(num_cpus, 0x9e37_79b9_7f4a_7c15)
        }

        pub fn with_seed(num_cpus: usize, seed: u64) -> Self {
            Self {
                num_cpus,
                clock_ns: AtomicU64::new(0),
                rng_state: AtomicU64::new(if seed == 0 { 1 } else { seed }),
                irq_depth: (0..num_cpus).map(|_| AtomicU32::new(0)).collect(),
                nmi_pending: (0..num_cpus).map(|_| AtomicBool::new(false)).collect(),
                timer_arms: Mutex::new(Vec::new()),
                kicks: Mutex::new(Vec::new()),
                switches: Mutex::new(Vec::new()),
                fiber_switches: Mutex::new(Vec::new()),
                fiber_wakes: Mutex::new(Vec::new()),
                debug_regs: (0..num_cpus).map(|_| Mutex::new(DebugRegs::default())).collect(),
                interrupt_priority: (0..num_cpus).map(|_| AtomicU32::new(0)).collect(),
            }
        }

        /// Move the clock forward
        pub fn advance_ns(&self, ns: u64) {
            self.clock_ns.fetch_add(ns, Ordering::SeqCst);
        }

        /// Set the clock to an absolute instant (monotonic in tests' hands)
        pub fn set_time_ns(&self, ns: u64) {
            self.clock_ns.store(ns, Ordering::SeqCst);
        }

        /// Last timer arm for a CPU, as (delay from arm time)
        pub fn last_timer_arm(&self, cpu: CpuId) -> Option<u64> {
            self.timer_arms
                .lock()
                .iter()
                .rev()
                .find(|(c, _)| *c == cpu)
                .map(|(_, d)| *d)
        }

        pub fn timer_arm_count(&self, cpu: CpuId) -> usize {
            self.timer_arms.lock().iter().filter(|(c, _)| *c == cpu).count()
        }

        pub fn kicks_sent(&self) -> Vec<CpuId> {
            self.kicks.lock().clone()
        }

        pub fn switch_log(&self, cpu: CpuId) -> Vec<crate::sched::types::ThreadId> {
            self.switches
                .lock()
                .iter()
                .filter(|(c, _)| *c == cpu)
                .map(|(_, t)| *t)
                .collect()
        }

        pub fn fiber_switch_log(&self, cpu: CpuId) -> Vec<(u64, u64)> {
            self.fiber_switches
                .lock()
                .iter()
                .filter(|(c, _, _)| *c == cpu)
                .map(|(_, f, t)| (*f, *t))
                .collect()
        }

        pub fn fiber_wake_count(&self, cpu: CpuId) -> usize {
            self.fiber_wakes.lock().iter().filter(|c| **c == cpu).count()
        }

        /// Was an NMI delivered to this CPU? Clears the pending flag.
        pub fn take_nmi(&self, cpu: CpuId) -> bool {
            self.nmi_pending[cpu.as_usize()].swap(false, Ordering::SeqCst)
        }

        pub fn interrupt_priority_of(&self, cpu: CpuId) -> u8 {
            self.interrupt_priority[cpu.as_usize()].load(Ordering::SeqCst) as u8
        }

        pub fn debug_regs_of(&self, cpu: CpuId) -> DebugRegs {
            *self.debug_regs[cpu.as_usize()].lock()
        }
    }

    impl Platform for SimPlatform {
        fn now_ns(&self) -> u64 {
            self.clock_ns.load(Ordering::SeqCst)
        }

        fn set_oneshot_timer(&self, cpu: CpuId, delay_ns: u64) {
            self.timer_arms.lock().push((cpu, delay_ns));
        }

        fn kick(&self, cpu: CpuId) {
            self.kicks.lock().push(cpu);
        }

        fn broadcast_nmi(&self, from: CpuId) {
            for (i, pending) in self.nmi_pending.iter().enumerate() {
                if i != from.as_usize() {
                    pending.store(true, Ordering::SeqCst);
                }
            }
        }

        fn irq_save(&self, cpu: CpuId) -> u8 {
            let depth = self.irq_depth[cpu.as_usize()].fetch_add(1, Ordering::SeqCst);
            depth as u8
        }

        fn irq_restore(&self, cpu: CpuId, _flags: u8) {
            self.irq_depth[cpu.as_usize()].fetch_sub(1, Ordering::SeqCst);
        }

        fn set_interrupt_priority(&self, cpu: CpuId, class: u8) {
            self.interrupt_priority[cpu.as_usize()].store(class as u32, Ordering::SeqCst);
        }

        fn read_debug_regs(&self, cpu: CpuId) -> DebugRegs {
            *self.debug_regs[cpu.as_usize()].lock()
        }

        fn write_debug_regs(&self, cpu: CpuId, regs: DebugRegs) {
            *self.debug_regs[cpu.as_usize()].lock() = regs;
        }

        fn random(&self) -> u64 {
            // xorshift64*, seeded at construction
            let mut x = self.rng_state.load(Ordering::Relaxed);
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;
            self.rng_state.store(x, Ordering::Relaxed);
            x.wrapping_mul(0x2545_f491_4f6c_dd1d)
        }

        fn switch_to(&self, cpu: CpuId, to: &ThreadRef) {
            self.switches.lock().push((cpu, to.tid));
        }

        fn relax(&self, duration_ns: u64) {
            self.advance_ns(duration_ns);
        }

        fn init_fiber_context(&self, _fiber: &FiberRef) {}

        fn clone_fiber_stack(&self, _parent: &FiberRef, _child: &FiberRef) -> Result<(), ()> {
            Ok(())
        }

        fn fiber_switch(&self, cpu: CpuId, from: &FiberRef, to: &FiberRef) {
            self.fiber_switches.lock().push((cpu, from.id, to.id));
        }

        fn fiber_switch_final(&self, cpu: CpuId, to: &FiberRef) {
            self.fiber_switches.lock().push((cpu, u64::MAX, to.id));
        }

        fn wake_fiber_thread(&self, cpu: CpuId) {
            self.fiber_wakes.lock().push(cpu);
        }
    }
}
