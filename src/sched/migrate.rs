/*
 * Constraint Change, Migration, and Work Stealing
 *
 * Three higher-level operations built on the engine:
 *
 * - change_constraints: re-admit the current thread under new constraints.
 *   A real-time to real-time change first demotes the thread to aperiodic
 *   (always admissible) and cycles it through the scheduler so it leaves
 *   its queues cleanly. Not a fast path: leaving a queue is a
 *   drain-and-rebuild of the heap, all under the CPU lock.
 * - move_thread: migrate a suspended, unbound, aperiodic thread to another
 *   CPU. Only the source CPU's lock is held while the thread is extracted;
 *   re-admission on the destination takes the destination lock afterwards,
 *   so no two CPU locks are ever held together.
 * - mug: steal up to a requested number of aperiodic threads from a victim
 *   CPU, chosen explicitly or by power-of-two random choices. Individual
 *   moves race with the victim's scheduler and may fail; that is fine.
 */

use alloc::vec::Vec;

use super::engine;
use super::thread::ThreadRef;
use super::types::{Constraints, CpuId, Placement, RtStatus, SchedError, ThreadStatus};
use super::{make_runnable_locked, System};

impl System {
    /// Change the constraints of the CPU's current thread.
    ///
    /// On success the new constraints are in effect before this returns;
    /// on admission failure the thread is re-admitted aperiodic (with the
    /// constraints it held going into the final admission attempt) and an
    /// error is returned.
    pub fn change_constraints(
        &self,
        cpu: CpuId,
        constraints: Constraints,
    ) -> Result<(), SchedError> {
        let platform = self.platform();
        let flags = platform.irq_save(cpu);

        let mut guard = self.cpu_state(cpu).sched.lock();
        let t = guard.current.clone();

        log::debug!("changing constraints of {} \"{}\"", t.tid, t.name);

        let was_rt = !t.rt.lock().constraints.is_aperiodic();
        if was_rt && !constraints.is_aperiodic() {
            // Transition through aperiodic so we exit the RT queues; this
            // admission is for aperiodic, which is always yes, and fast.
            log::debug!("transitioning {} \"{}\" temporarily to aperiodic", t.tid, t.name);
            {
                let mut rt = t.rt.lock();
                rt.constraints = Constraints::Aperiodic {
                    priority: guard.cfg.aperiodic_default_priority,
                    interrupt_priority_class: 0,
                };
            }
            let now = platform.now_ns();
            if make_runnable_locked(&mut guard, &t, true, now).is_err() {
                log::error!("failed to re-admit {} \"{}\" as aperiodic", t.tid, t.name);
                panic!("unable to change thread's constraints to aperiodic");
            }
            // we are now on the aperiodic run queue, so get running again
            // before retrying with the new constraints
            engine::special_switch(platform, cpu, RtStatus::Changing, guard);
            guard = self.cpu_state(cpu).sched.lock();
        }

        // now we are aperiodic, with the lock held and interrupts off
        let old = t.rt.lock().constraints;
        t.rt.lock().constraints = constraints;

        let now = platform.now_ns();
        let result = if make_runnable_locked(&mut guard, &t, true, now).is_err() {
            log::debug!(
                "failed to re-admit {} \"{}\" with new constraints",
                t.tid,
                t.name
            );
            // bring it back up as aperiodic again; this should just work
            t.rt.lock().constraints = old;
            if make_runnable_locked(&mut guard, &t, true, now).is_err() {
                panic!("failed to recover to aperiodic when changing constraints");
            }
            log::debug!("readmitted {} \"{}\" with old constraints", t.tid, t.name);
            // we are on the run queue again, so kick ourselves off the CPU
            engine::special_switch(platform, cpu, RtStatus::Changing, guard);
            Err(SchedError::AdmissionDenied)
        } else {
            log::debug!(
                "succeeded in admitting {} \"{}\" with new constraints",
                t.tid,
                t.name
            );
            engine::special_switch(platform, cpu, RtStatus::Changing, guard);
            Ok(())
        };

        platform.irq_restore(cpu, flags);
        result
    }

    /// Migrate a thread to another CPU.
    ///
    /// The thread must not be running, must not be bound, and must be
    /// aperiodic. With `block` set the call retries (a quantum at a time)
    /// until the thread is in a migratable state; without it the first
    /// obstacle is returned as an error.
    pub fn move_thread(
        &self,
        caller: CpuId,
        thread: &ThreadRef,
        new_cpu: CpuId,
        block: bool,
    ) -> Result<(), SchedError> {
        if thread.bound_cpu.is_some() {
            log::error!("cannot move a bound thread");
            return Err(SchedError::MigrationRefused("thread is bound"));
        }
        if new_cpu.as_usize() >= self.num_cpus() {
            log::error!("impossible migration to {}", new_cpu);
            return Err(SchedError::InvalidCpu);
        }
        let old_cpu = thread.current_cpu();
        if old_cpu == new_cpu {
            return Ok(());
        }
        if !thread.rt.lock().constraints.is_aperiodic() {
            log::error!("currently only non-RT threads can be migrated");
            return Err(SchedError::MigrationRefused("thread is not aperiodic"));
        }

        let platform = self.platform();
        let quantum = self.config().aperiodic_quantum_ns;

        loop {
            // own the thread by owning its scheduler
            let flags = platform.irq_save(caller);
            let mut os = self.cpu_state(old_cpu).sched.lock();

            if thread.current_cpu() != old_cpu {
                // someone else moved it underneath us; should never happen
                log::error!("race to move thread");
                drop(os);
                platform.irq_restore(caller, flags);
                return Err(SchedError::MigrationRefused("lost a migration race"));
            }

            let migratable = {
                let rt = thread.rt.lock();
                rt.thread_status == ThreadStatus::Suspended && rt.status == RtStatus::Admitted
            };

            let extracted = if !migratable {
                log::debug!("thread cannot be migrated as it is not suspended");
                false
            } else if os.remove_aperiodic(thread).is_none() {
                log::debug!("thread cannot be migrated as it is not in the aperiodic ready queue");
                false
            } else {
                // it is ours; move it while we still own the source
                thread.set_current_cpu(new_cpu);
                true
            };

            drop(os);
            platform.irq_restore(caller, flags);

            if !extracted {
                if block {
                    // wait a quantum and try again
                    log::debug!("going to sleep before migration retry");
                    platform.relax(quantum);
                    continue;
                }
                return Err(SchedError::MigrationRefused("thread is not migratable"));
            }

            // already admitted and aperiodic: just get it onto the
            // destination queue
            log::debug!("making thread runnable on new CPU");
            return match self.make_runnable(caller, thread, Placement::On(new_cpu), false) {
                Ok(()) => Ok(()),
                Err(_) => {
                    log::error!("failed to make thread runnable on destination - attempting fallback");
                    thread.set_current_cpu(old_cpu);
                    if self
                        .make_runnable(caller, thread, Placement::On(old_cpu), false)
                        .is_err()
                    {
                        log::error!("cannot move thread back to original cpu");
                        panic!("failed to make migrated task runnable on destination or source");
                    }
                    Err(SchedError::MigrationRefused("destination refused the thread"))
                }
            };
        }
    }

    /// Power-of-two-choices victim selection: sample two random CPUs other
    /// than the stealer and pick the one with the larger aperiodic queue
    fn select_victim(&self, new_cpu: CpuId) -> Result<CpuId, SchedError> {
        if self.num_cpus() < 2 {
            return Err(SchedError::InvalidCpu);
        }
        let n = self.num_cpus() as u64;
        let platform = self.platform();
        let (a, b) = loop {
            let a = CpuId((platform.random() % n) as u32);
            let b = CpuId((platform.random() % n) as u32);
            if a != new_cpu && b != new_cpu {
                break (a, b);
            }
        };
        let a_size = self.cpu_state(a).sched.lock().aperiodic_len();
        let b_size = self.cpu_state(b).sched.lock().aperiodic_len();
        Ok(if a_size > b_size { a } else { b })
    }

    /// Steal up to `maxcount` aperiodic threads from a victim CPU onto the
    /// calling CPU.
    ///
    /// With no explicit victim, one is picked by power-of-two choices. The
    /// theft aborts (successfully, stealing nothing) when the victim has
    /// no more threads than the stealer. Individual moves may race with
    /// the victim's scheduler and fail silently; the count of threads that
    /// actually moved is returned.
    pub fn mug(
        &self,
        new_cpu: CpuId,
        victim: Option<CpuId>,
        maxcount: usize,
    ) -> Result<usize, SchedError> {
        let old_cpu = match victim {
            Some(c) => c,
            None => self.select_victim(new_cpu)?,
        };

        if old_cpu == new_cpu {
            log::error!("cannot steal from self");
            return Err(SchedError::MigrationRefused("cannot steal from self"));
        }
        if old_cpu.as_usize() >= self.num_cpus() {
            log::error!("cannot steal from {} (out of range)", old_cpu);
            return Err(SchedError::InvalidCpu);
        }

        log::debug!("work stealing: selected victim is {}", old_cpu);

        let victim_size = self.cpu_state(old_cpu).sched.lock().aperiodic_len();
        let my_size = self.cpu_state(new_cpu).sched.lock().aperiodic_len();
        if victim_size <= my_size {
            log::debug!("avoiding theft from insufficiently rich CPU");
            return Ok(0);
        }

        // phase one: grab control of the remote scheduler and survey it
        // for prospective threads
        let platform = self.platform();
        let mut prospects: Vec<ThreadRef> = Vec::new();
        {
            let flags = platform.irq_save(new_cpu);
            let os = self.cpu_state(old_cpu).sched.lock();
            for pos in 0..os.aperiodic_len() {
                if let Some(t) = os.peek_aperiodic(pos) {
                    // never steal the idle thread, an interrupt thread, or
                    // a bound thread
                    if !t.is_idle && !t.is_intr() && t.bound_cpu.is_none() {
                        log::debug!("found thread {} {}", t.tid, t.display_name());
                        prospects.push(t.clone());
                        if prospects.len() >= maxcount {
                            break;
                        }
                    }
                }
            }
            drop(os);
            platform.irq_restore(new_cpu, flags);
        }

        // phase two: attempt to move them over. The remote scheduler races
        // with us, so these moves can fail; those failures are OK.
        let mut actual = 0;
        for t in prospects {
            log::debug!(
                "attempting to move thread {} {} to {}",
                t.tid,
                t.display_name(),
                new_cpu
            );
            if self.move_thread(new_cpu, &t, new_cpu, false).is_ok() {
                log::debug!("stole thread {} {}", t.tid, t.display_name());
                actual += 1;
            } else {
                log::debug!("could not steal thread {} {}", t.tid, t.display_name());
            }
        }

        self.cpu_state(new_cpu).sched.lock().num_thefts += actual as u64;

        log::debug!("thread theft complete");
        Ok(actual)
    }
}
