/*
 * World-Stop Monitor Coordination
 *
 * The in-kernel monitor must be able to quiesce every CPU so that one CPU
 * can edit globally-observed state (the debug registers backing
 * breakpoints and watchpoints) and then resume the machine consistently.
 *
 * The protocol runs on three counting barriers, each initialised to the
 * number of online CPUs:
 *
 * 1. A CPU attempting entry CASes the entry flag from 0 to 1. Losers run
 *    the follower protocol and then try again, so overlapping entries
 *    serialise.
 * 2. The winner records itself as the entry CPU, NMIs every peer, and
 *    waits at the `entry` barrier. Each peer's NMI handler sees the flag
 *    set and joins the follower protocol.
 * 3. With everyone parked, the winner owns the machine. When it is done
 *    it publishes its debug registers into the shared snapshot, arrives
 *    at `update`, clears the entry flag, and waits at `exit`.
 * 4. Followers wait at `update` until the snapshot is ready, install it
 *    on their own CPU, and arrive at `exit`. No CPU leaves `exit` before
 *    every CPU has installed the winner's state.
 *
 * Interrupts are disabled on the winner for the whole cycle; followers
 * save and restore their own interrupt state around the follower path.
 */

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use alloc::sync::Arc;
use bitflags::bitflags;
use spin::Mutex;

use crate::platform::Platform;
use crate::sched::types::CpuId;

bitflags! {
    /// Debug-control register bits the monitor manipulates: per-breakpoint
    /// local/global enables plus the exact-detect bits
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Dr7Flags: u64 {
        const L0 = 1 << 0;
        const G0 = 1 << 1;
        const L1 = 1 << 2;
        const G1 = 1 << 3;
        const L2 = 1 << 4;
        const G2 = 1 << 5;
        const L3 = 1 << 6;
        const G3 = 1 << 7;
        const LE = 1 << 8;
        const GE = 1 << 9;
    }
}

impl Default for Dr7Flags {
    fn default() -> Self {
        Dr7Flags::empty()
    }
}

/// Snapshot of the debug registers the monitor propagates to every CPU
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct DebugRegs {
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr7: Dr7Flags,
}

/// A reusable sense-reversing counting barrier.
///
/// All `size` participants must arrive before any of them proceeds; the
/// barrier then resets itself for the next cycle.
pub struct CountingBarrier {
    size: usize,
    count: AtomicUsize,
    generation: AtomicUsize,
}

impl CountingBarrier {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            count: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
        }
    }

    /// Arrive and spin until everyone else has too
    pub fn arrive(&self) {
        let gen = self.generation.load(Ordering::Acquire);
        if self.count.fetch_add(1, Ordering::AcqRel) + 1 == self.size {
            // last one in resets the barrier and releases the others
            self.count.store(0, Ordering::Release);
            self.generation.fetch_add(1, Ordering::AcqRel);
        } else {
            while self.generation.load(Ordering::Acquire) == gen {
                core::hint::spin_loop();
            }
        }
    }
}

/// World-stop coordination state, one per system
pub struct Monitor {
    platform: Arc<dyn Platform>,
    num_cpus: usize,
    /// Some CPU is in the monitor if this is set
    entry_flag: AtomicU32,
    /// The CPU that caused the entry
    entry_cpu: AtomicU32,
    /// Stages of synchronising the CPUs on entry and exit
    entry: CountingBarrier,
    update: CountingBarrier,
    exit: CountingBarrier,
    /// The winner's debug registers, installed by every follower
    sync_regs: Mutex<DebugRegs>,
}

/// Handed to the winner while it owns the machine; `leave` consumes it
pub struct MonitorSession {
    cpu: CpuId,
    irq_flags: u8,
}

impl Monitor {
    pub fn new(platform: Arc<dyn Platform>, num_cpus: usize) -> Self {
        Self {
            platform,
            num_cpus,
            entry_flag: AtomicU32::new(0),
            entry_cpu: AtomicU32::new(0),
            entry: CountingBarrier::new(num_cpus),
            update: CountingBarrier::new(num_cpus),
            exit: CountingBarrier::new(num_cpus),
            sync_regs: Mutex::new(DebugRegs::default()),
        }
    }

    /// Is a monitor entry in progress, and on which CPU?
    pub fn check(&self) -> Option<CpuId> {
        if self.entry_flag.load(Ordering::SeqCst) != 0 {
            Some(CpuId(self.entry_cpu.load(Ordering::SeqCst)))
        } else {
            None
        }
    }

    /// Enter the monitor from `cpu`, quiescing every other CPU.
    ///
    /// Contending entries lose the flag race, serve as followers for the
    /// winner, and then take their own turn. Returns once all peers are
    /// parked at the entry rendezvous; the caller owns globally-observed
    /// state until `leave`.
    pub fn enter(&self, cpu: CpuId) -> MonitorSession {
        let irq_flags = self.platform.irq_save(cpu);

        while self
            .entry_flag
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // lost the entry game to another CPU: serve out its cycle as
            // a follower, then try again
            self.follower(cpu);
        }

        self.entry_cpu.store(cpu.0, Ordering::SeqCst);

        // force the other CPUs into the monitor
        self.platform.broadcast_nmi(cpu);
        self.entry.arrive();

        log::info!("monitor entered by {}", cpu);
        MonitorSession { cpu, irq_flags }
    }

    /// Wrap up the winner's use of the monitor and resume the machine.
    ///
    /// Publishes the winner's debug registers, releases the followers to
    /// install them, clears the entry flag, and waits until every CPU has
    /// the new state before returning.
    pub fn leave(&self, session: MonitorSession) {
        let cpu = session.cpu;

        // update the shared snapshot from the winner's registers
        *self.sync_regs.lock() = self.platform.read_debug_regs(cpu);

        // let the other CPUs know the state is now ready
        self.update.arrive();

        // reset the entry flag
        self.entry_flag.store(0, Ordering::SeqCst);

        // wait for the other CPUs to install the state
        self.exit.arrive();

        log::info!("monitor left by {}", cpu);
        self.platform.irq_restore(cpu, session.irq_flags);
    }

    /// NMI handler hook: every CPU's NMI path calls this, and if a
    /// monitor entry is in progress, the CPU serves as a follower.
    /// Returns whether this NMI belonged to the monitor.
    pub fn nmi_handler(&self, cpu: CpuId) -> bool {
        if self.entry_flag.load(Ordering::SeqCst) == 0 {
            return false;
        }
        let flags = self.platform.irq_save(cpu);
        self.follower(cpu);
        self.platform.irq_restore(cpu, flags);
        true
    }

    /// The follower protocol: wait for the winner to be done, install its
    /// debug-register state locally, and continue
    fn follower(&self, cpu: CpuId) {
        // let the other CPUs know this one is here
        self.entry.arrive();
        // nothing to do until the winner updates the state
        self.update.arrive();
        // update local state (debug registers)
        let regs = *self.sync_regs.lock();
        self.platform.write_debug_regs(cpu, regs);
        // let the winner know this CPU is ready to go
        self.exit.arrive();
    }

    /// Convenience: enter, run the edit closure on the winner, leave
    pub fn with<F: FnOnce()>(&self, cpu: CpuId, edit: F) {
        let session = self.enter(cpu);
        edit();
        self.leave(session);
    }

    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }
}
