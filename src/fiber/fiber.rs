/*
 * Fiber Records
 *
 * A fiber is a cooperative user-level task scheduled inside one kernel
 * thread per CPU. It owns its stack outright; the saved register context
 * lives on that stack and is managed by the platform's fiber context
 * intrinsics. Everything the fiber scheduler mutates sits behind one lock
 * per fiber.
 */

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::sched::types::CpuId;

/// Shared handle to a fiber
pub type FiberRef = Arc<Fiber>;

/// A fiber routine: takes the input word, returns the output word
pub type FiberFn = fn(usize) -> usize;

/// Fiber life cycle
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FiberStatus {
    /// Created, never run
    Init,
    /// On some CPU's fiber run queue
    Ready,
    /// Executing
    Run,
    /// On another fiber's wait queue (joining)
    Wait,
    /// Mid-yield
    Yield,
    /// Exiting; do not touch
    Exit,
}

/// Mutable fiber state, guarded by the fiber's lock
pub struct FiberInner {
    pub status: FiberStatus,
    /// CPU whose run queue holds the fiber (or ran it last); None while
    /// parked on a wait queue
    pub curr_cpu: Option<CpuId>,
    /// Fibers joined on this one, released when it exits
    pub waiters: VecDeque<FiberRef>,
    /// The routine has completed
    pub is_done: bool,
    /// Output word stored by the wrapper when the routine returns
    pub output: Option<usize>,
}

pub struct Fiber {
    pub id: u64,
    pub fun: FiberFn,
    pub input: usize,
    pub stack_size: usize,
    /// Owned stack; taken on exit so the final switch never touches it
    pub stack: Mutex<Option<Box<[u8]>>>,
    /// Set once, by the fiber thread, on its idle fiber
    is_idle: AtomicBool,
    pub inner: Mutex<FiberInner>,
}

impl Fiber {
    pub fn new(id: u64, fun: FiberFn, input: usize, stack_size: usize) -> FiberRef {
        let stack = vec![0u8; stack_size].into_boxed_slice();
        Arc::new(Self {
            id,
            fun,
            input,
            stack_size,
            stack: Mutex::new(Some(stack)),
            is_idle: AtomicBool::new(false),
            inner: Mutex::new(FiberInner {
                status: FiberStatus::Init,
                curr_cpu: None,
                waiters: VecDeque::new(),
                is_done: false,
                output: None,
            }),
        })
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle.load(Ordering::SeqCst)
    }

    pub fn mark_idle(&self) {
        self.is_idle.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> FiberStatus {
        self.inner.lock().status
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().is_done
    }

    /// Output word, once the routine has completed
    pub fn output(&self) -> Option<usize> {
        self.inner.lock().output
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("stack_size", &self.stack_size)
            .field("is_idle", &self.is_idle.load(Ordering::Relaxed))
            .finish()
    }
}
