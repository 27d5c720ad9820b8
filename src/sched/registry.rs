/*
 * Global Thread Registry
 *
 * A single list of every scheduler-visible thread, shared by all CPUs and
 * guarded by its own lock. It exists for enumeration (thread dumps), tid
 * lookup, and reaping; per-CPU scheduling never touches it.
 *
 * Reaping is two-phase: collect the dead under the registry lock, then
 * destroy them after releasing it, because destruction wants the lock
 * again. A reaping-in-progress flag keeps concurrent reapers on other
 * CPUs from doubling the work.
 */

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::platform::Platform;

use super::thread::ThreadRef;
use super::types::{CpuId, RtStatus, ThreadId, ThreadStatus};

pub(crate) struct GlobalRegistry {
    list: Mutex<Vec<ThreadRef>>,
    num_threads: AtomicU64,
    reaping: AtomicBool,
}

impl GlobalRegistry {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
            num_threads: AtomicU64::new(0),
            reaping: AtomicBool::new(false),
        }
    }

    /// Register a freshly created thread and give it its initial CPU:
    /// the CPU it is bound to if any, a random one otherwise.
    pub fn post_create(&self, platform: &dyn Platform, num_cpus: usize, thread: &ThreadRef) {
        let cpu = match thread.bound_cpu {
            Some(cpu) => cpu,
            None => CpuId((platform.random() % num_cpus as u64) as u32),
        };
        thread.set_current_cpu(cpu);

        self.list.lock().push(thread.clone());
        let n = self.num_threads.fetch_add(1, Ordering::SeqCst) + 1;

        log::debug!(
            "post create of thread {} ({}) [numthreads={}]",
            thread.tid,
            thread.display_name(),
            n
        );
    }

    /// Remove a thread from the registry ahead of destruction
    pub fn pre_destroy(&self, tid: ThreadId) -> Option<ThreadRef> {
        let mut list = self.list.lock();
        let pos = list.iter().position(|t| t.tid == tid);
        match pos {
            Some(i) => {
                let t = list.remove(i);
                self.num_threads.fetch_sub(1, Ordering::SeqCst);
                Some(t)
            }
            None => {
                log::error!("failed to remove thread {} from global list", tid);
                None
            }
        }
    }

    pub fn num_threads(&self) -> u64 {
        self.num_threads.load(Ordering::SeqCst)
    }

    /// Look a thread up by tid
    pub fn find_by_tid(&self, tid: ThreadId) -> Option<ThreadRef> {
        self.list.lock().iter().find(|t| t.tid == tid).cloned()
    }

    /// Free every thread that has exited and whose scheduler state agrees.
    ///
    /// Returns how many threads were reaped. Runs at most once at a time
    /// across all CPUs; a second caller returns immediately with 0.
    pub fn reap(&self) -> usize {
        if self
            .reaping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // reaping is already in progress elsewhere
            return 0;
        }

        // phase one: collect under the lock
        let mut dead: Vec<ThreadRef> = Vec::new();
        {
            let list = self.list.lock();
            for t in list.iter() {
                let rt = t.rt.lock();
                if rt.thread_status == ThreadStatus::Exited && rt.status == RtStatus::Exiting {
                    log::debug!("reaping tid {} ({})", t.tid, t.display_name());
                    dead.push(t.clone());
                }
            }
        }

        // phase two: destroy each one, re-taking the lock per thread
        let count = dead.len();
        for t in dead {
            self.pre_destroy(t.tid);
        }

        // done; another CPU can now go
        self.reaping.store(false, Ordering::SeqCst);

        count
    }

    /// Log a line for every registered thread, optionally restricted to
    /// the threads currently assigned to one CPU
    pub fn dump_threads(&self, cpu: Option<CpuId>) {
        let list = self.list.lock();
        for t in list.iter() {
            if cpu.map(|c| t.current_cpu() == c).unwrap_or(true) {
                t.dump("thread");
            }
        }
    }
}
