/*
 * Scheduler Queues
 *
 * Three bounded containers tailored to the scheduler:
 *
 * - DeadlineHeap: binary min-heap keyed by a u64 frozen at enqueue time.
 *   Used for the runnable queue (key = absolute deadline, EDF order), the
 *   pending queue (key = next arrival time), and the aperiodic queue under
 *   the dynamic policies (key = dynamic priority).
 * - RunQueue: circular FIFO, used for round-robin aperiodic scheduling.
 * - LotteryQueue: FIFO storage plus a running ticket total, used for
 *   lottery aperiodic scheduling.
 *
 * Keys are frozen because a thread's deadline only changes while it is off
 * every queue; heap maintenance therefore never takes a thread lock.
 *
 * Remove-by-identity on the heap is drain-and-rebuild, O(n log n). That is
 * acceptable because it only runs on rare paths (constraint change,
 * migration), always under the owning CPU's lock.
 */

use heapless::{Deque, Vec as BoundedVec};

use super::thread::ThreadRef;
use super::types::{SchedError, ThreadId, MAX_QUEUE};

/// One heap entry: the ordering key and the owned thread handle
pub struct HeapSlot {
    pub key: u64,
    pub thread: ThreadRef,
}

/// Fixed-capacity binary min-heap of threads
///
/// The head is the thread with the minimum key (earliest deadline, next
/// arrival, or highest dynamic priority depending on which queue this is).
pub struct DeadlineHeap {
    name: &'static str,
    slots: BoundedVec<HeapSlot, MAX_QUEUE>,
}

impl DeadlineHeap {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: BoundedVec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insert a thread with a frozen key. O(log n).
    pub fn enqueue(&mut self, key: u64, thread: ThreadRef) -> Result<(), SchedError> {
        if self
            .slots
            .push(HeapSlot { key, thread })
            .is_err()
        {
            log::error!("too many threads for priority queue {}", self.name);
            return Err(SchedError::QueueFull);
        }
        let mut pos = self.slots.len() - 1;
        while pos > 0 {
            let parent = (pos - 1) >> 1;
            if self.slots[parent].key > self.slots[pos].key {
                self.slots.swap(parent, pos);
                pos = parent;
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Remove and return the minimum-key thread. O(log n).
    pub fn dequeue(&mut self) -> Option<ThreadRef> {
        if self.slots.is_empty() {
            return None;
        }
        let last = self.slots.len() - 1;
        self.slots.swap(0, last);
        let slot = self.slots.pop().unwrap();
        self.sift_down(0);
        Some(slot.thread)
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.slots.len();
        loop {
            let left = (pos << 1) + 1;
            let right = left + 1;
            if left >= len {
                break;
            }
            let mut child = left;
            if right < len && self.slots[right].key < self.slots[left].key {
                child = right;
            }
            if self.slots[pos].key > self.slots[child].key {
                self.slots.swap(pos, child);
                pos = child;
            } else {
                break;
            }
        }
    }

    /// Key and thread at the head, without removing
    pub fn peek_min(&self) -> Option<(u64, &ThreadRef)> {
        self.slots.first().map(|s| (s.key, &s.thread))
    }

    /// Thread at `pos` in heap (array) order; used for utilisation walks
    /// and work-stealing surveys, which do not care about ordering
    pub fn peek_at(&self, pos: usize) -> Option<&ThreadRef> {
        self.slots.get(pos).map(|s| &s.thread)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeapSlot> {
        self.slots.iter()
    }

    /// Remove a specific thread by identity. Drain-and-rebuild; O(n log n).
    pub fn remove(&mut self, tid: ThreadId) -> Option<ThreadRef> {
        let mut found = None;
        let drained = core::mem::take(&mut self.slots);
        for slot in drained {
            if found.is_none() && slot.thread.tid == tid {
                found = Some(slot.thread);
            } else if self.enqueue(slot.key, slot.thread).is_err() {
                // cannot happen, we just removed at least one element
                log::error!("failed to re-enqueue in removal process");
            }
        }
        found
    }

    pub fn dump(&self, pre: &str) {
        log::debug!("======{}==BEGIN=====", pre);
        for slot in self.slots.iter() {
            log::debug!(
                "   {} {} ({})",
                slot.thread.tid,
                slot.thread.display_name(),
                slot.key
            );
        }
        log::debug!("======{}==END=====", pre);
    }
}

/// Fixed-capacity circular FIFO of threads
///
/// Enqueue at the head (newest), dequeue from the tail (oldest).
pub struct RunQueue {
    slots: Deque<ThreadRef, MAX_QUEUE>,
}

impl RunQueue {
    pub const fn new() -> Self {
        Self { slots: Deque::new() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn enqueue(&mut self, thread: ThreadRef) -> Result<(), SchedError> {
        if self.slots.push_back(thread).is_err() {
            log::error!("run queue overflow ({} entries)", self.slots.len());
            return Err(SchedError::QueueFull);
        }
        Ok(())
    }

    /// Oldest thread
    pub fn dequeue(&mut self) -> Option<ThreadRef> {
        self.slots.pop_front()
    }

    /// Thread at `pos`, oldest first
    pub fn peek(&self, pos: usize) -> Option<&ThreadRef> {
        self.slots.iter().nth(pos)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadRef> {
        self.slots.iter()
    }

    /// Remove a specific thread, compacting in place (a full rotation that
    /// drops the match keeps the relative order of everything else)
    pub fn remove(&mut self, tid: ThreadId) -> Option<ThreadRef> {
        let mut found = None;
        for _ in 0..self.slots.len() {
            let t = self.slots.pop_front().unwrap();
            if found.is_none() && t.tid == tid {
                found = Some(t);
            } else {
                let _ = self.slots.push_back(t);
            }
        }
        found
    }

    pub fn dump(&self, pre: &str) {
        log::debug!("======{}==BEGIN=====", pre);
        for t in self.slots.iter() {
            log::debug!("   {} {}", t.tid, t.display_name());
        }
        log::debug!("======{}==END=====", pre);
    }
}

/// One lottery entry: the ticket count cached at enqueue time
struct Ticketed {
    tickets: u64,
    thread: ThreadRef,
}

/// Lottery run queue: FIFO storage plus the running ticket total
///
/// Tickets are the thread's aperiodic priority, so under this policy a
/// larger priority value means a more likely pick. The idle thread holds
/// tickets like everyone else but is skipped whenever the draw lands on it
/// and another thread exists.
pub struct LotteryQueue {
    slots: Deque<Ticketed, MAX_QUEUE>,
    total_tickets: u64,
}

impl LotteryQueue {
    pub const fn new() -> Self {
        Self {
            slots: Deque::new(),
            total_tickets: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn total_tickets(&self) -> u64 {
        self.total_tickets
    }

    pub fn enqueue(&mut self, tickets: u64, thread: ThreadRef) -> Result<(), SchedError> {
        if self.slots.push_back(Ticketed { tickets, thread }).is_err() {
            log::error!("lottery queue overflow ({} entries)", self.slots.len());
            return Err(SchedError::QueueFull);
        }
        self.total_tickets += tickets;
        Ok(())
    }

    /// Run one lottery draw with the supplied random value.
    ///
    /// Scans oldest to newest accumulating tickets and picks the first
    /// thread whose cumulative count crosses the target. If that thread is
    /// the idle thread and there is any other, the adjacent thread is
    /// picked instead so idle never starves peers.
    pub fn draw(&mut self, random: u64) -> Option<ThreadRef> {
        if self.slots.is_empty() {
            return None;
        }
        if self.total_tickets == 0 {
            log::error!("lottery queue has threads but no tickets");
            return self.pop_at(0);
        }
        let target = random % self.total_tickets;
        let size = self.slots.len();
        let mut cum = 0u64;
        let mut chosen = None;
        for (cur, entry) in self.slots.iter().enumerate() {
            cum += entry.tickets;
            if cum >= target {
                let mut pick = cur;
                if entry.thread.is_idle && size > 1 {
                    // there is at least one other thread; prefer the very
                    // next one, else the previous one
                    if cur < size - 1 {
                        pick = cur + 1;
                    } else {
                        pick = cur - 1;
                    }
                }
                chosen = Some(pick);
                break;
            }
        }
        let pick = match chosen {
            Some(p) => p,
            None => panic!("lottery draw failed to cross the ticket total"),
        };
        self.pop_at(pick)
    }

    /// Remove the entry at logical position `pos` (oldest = 0), keeping
    /// the order of everything else
    fn pop_at(&mut self, pos: usize) -> Option<ThreadRef> {
        let mut found = None;
        for i in 0..self.slots.len() {
            let e = self.slots.pop_front().unwrap();
            if i == pos {
                found = Some(e);
            } else {
                let _ = self.slots.push_back(e);
            }
        }
        // the rotation above walked the original length; when an entry was
        // taken the remaining entries are already back in order
        found.map(|e| {
            self.total_tickets -= e.tickets;
            e.thread
        })
    }

    pub fn peek(&self, pos: usize) -> Option<&ThreadRef> {
        self.slots.iter().nth(pos).map(|e| &e.thread)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadRef> {
        self.slots.iter().map(|e| &e.thread)
    }

    pub fn remove(&mut self, tid: ThreadId) -> Option<ThreadRef> {
        let mut found: Option<Ticketed> = None;
        for _ in 0..self.slots.len() {
            let e = self.slots.pop_front().unwrap();
            if found.is_none() && e.thread.tid == tid {
                found = Some(e);
            } else {
                let _ = self.slots.push_back(e);
            }
        }
        found.map(|e| {
            self.total_tickets -= e.tickets;
            e.thread
        })
    }

    pub fn dump(&self, pre: &str) {
        log::debug!("======{}==BEGIN=====", pre);
        for e in self.slots.iter() {
            log::debug!(
                "   {} {} ({} tickets)",
                e.thread.tid,
                e.thread.display_name(),
                e.tickets
            );
        }
        log::debug!("======{}==END=====", pre);
    }
}
