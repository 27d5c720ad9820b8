/*
 * VELA Scheduler Core
 *
 * This crate is the real-time scheduling core of the VELA research kernel:
 * a per-CPU earliest-deadline-first scheduler with admission control, an
 * aperiodic underlay with a build-time-selected policy, a cooperative fiber
 * layer nested inside one kernel thread per CPU, and the world-stop
 * coordination the in-kernel monitor uses to quiesce every CPU while one of
 * them edits globally-observed debug state.
 *
 * Why this is important:
 * - Every other subsystem in the kernel runs under this scheduler; its
 *   invariants (one queue per thread, EDF ordering, utilisation bounds)
 *   directly decide whether real-time constraints hold
 * - The crate is no_std + alloc so the kernel proper can embed it
 * - All architecture-specific operations (one-shot timer, IPI kick, NMI
 *   broadcast, CR8, debug registers, context switches) sit behind the
 *   narrow Platform trait; the core never names hardware
 * - Hosted tests drive the complete decision logic against a simulated
 *   platform with a controllable clock and a seeded RNG
 *
 * Thread model:
 * - aperiodic  (simple priority, not real-time)
 * - periodic   (phase, period, slice)
 * - sporadic   (phase, size, deadline; completes into aperiodic)
 *
 * On creation a thread is aperiodic with the configured default priority.
 */

#![cfg_attr(not(test), no_std)]
#![allow(dead_code)]

extern crate alloc;

pub mod fiber;
pub mod monitor;
pub mod platform;
pub mod sched;

#[cfg(test)]
mod tests;

pub use platform::Platform;
pub use sched::types::{
    Constraints, CpuId, Placement, ReschedSource, RtStatus, SchedConfig, SchedError, ThreadId,
    ThreadStatus,
};
pub use sched::System;
