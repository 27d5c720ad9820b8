/*
 * Test Suite for the Scheduler Core
 *
 * Hosted tests that drive the complete decision logic against the
 * simulated platform: a controllable clock, a seeded RNG, and full
 * recording of timer arms, kicks, and context switches.
 *
 * ## Layout
 *
 * - queues:    heap ordering, FIFO rotation, lottery draws
 * - admission: utilisation bounds and rejection rules
 * - engine:    the reschedule decision procedure end to end
 * - lifecycle: create / admit / exit / reap round trips
 * - migrate:   constraint changes, migration, work stealing
 * - fiber:     fiber queueing, yields, join, fork, exit
 * - monitor:   the world-stop rendezvous on real threads
 */

mod admission;
mod engine;
mod fiber;
mod lifecycle;
mod queues;

use alloc::sync::Arc;

use crate::platform::SimPlatform;
use crate::sched::types::SchedConfig;
use crate::sched::System;

/// A system on the simulated platform with the default configuration
pub(crate) fn sim_system(num_cpus: usize) -> (Arc<SimPlatform>, System) {
    sim_system_with(num_cpus, SchedConfig::default())
}

pub(crate) fn sim_system_with(num_cpus: usize, cfg: SchedConfig) -> (Arc<SimPlatform>, System) {
    let platform = Arc::new(SimPlatform::new(num_cpus));
    let sys = System::new(platform.clone(), num_cpus, cfg);
    (platform, sys)
}

/// Milliseconds in nanoseconds, because every constraint in these tests
/// is stated in milliseconds
pub(crate) const MS: u64 = 1_000_000;
