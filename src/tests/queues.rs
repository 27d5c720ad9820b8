/*
 * Queue Tests
 *
 * The three bounded containers in isolation: heap ordering, identity
 * removal, FIFO rotation, and the lottery draw (distribution and the
 * idle-avoidance rule) with the seeded simulator RNG.
 */

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::platform::{Platform, SimPlatform};
use crate::sched::queue::{DeadlineHeap, LotteryQueue, RunQueue};
use crate::sched::thread::{ThreadCell, ThreadRef};
use crate::sched::types::{Constraints, ThreadId};

fn mk_thread(tid: u64, priority: u64, idle: bool) -> ThreadRef {
    ThreadCell::new(
        ThreadId(tid),
        "q",
        Constraints::aperiodic(priority),
        None,
        idle,
    )
}

#[test]
fn heap_orders_by_key() {
    let mut heap = DeadlineHeap::new("test");
    let keys = [50u64, 10, 90, 30, 70, 20, 80];
    for (i, &k) in keys.iter().enumerate() {
        heap.enqueue(k, mk_thread(i as u64, 0, false)).unwrap();
    }
    assert_eq!(heap.len(), keys.len());
    assert_eq!(heap.peek_min().unwrap().0, 10);

    let mut seen = Vec::new();
    let mut sorted = keys;
    sorted.sort_unstable();
    while let Some((k, _)) = heap.peek_min() {
        seen.push(k);
        heap.dequeue().unwrap();
    }
    assert_eq!(seen, sorted);
}

#[test]
fn heap_remove_by_identity_preserves_order() {
    let mut heap = DeadlineHeap::new("test");
    for i in 0..8u64 {
        heap.enqueue(i * 10, mk_thread(i, 0, false)).unwrap();
    }
    let gone = heap.remove(ThreadId(3)).expect("thread 3 is in the heap");
    assert_eq!(gone.tid, ThreadId(3));
    assert!(heap.remove(ThreadId(3)).is_none());

    let mut keys = Vec::new();
    while let Some((k, _)) = heap.peek_min() {
        keys.push(k);
        heap.dequeue();
    }
    assert_eq!(keys, [0, 10, 20, 40, 50, 60, 70]);
}

#[test]
fn heap_rejects_overflow() {
    let mut heap = DeadlineHeap::new("test");
    for i in 0..crate::sched::types::MAX_QUEUE as u64 {
        heap.enqueue(i, mk_thread(i, 0, false)).unwrap();
    }
    assert!(heap.enqueue(999, mk_thread(999, 0, false)).is_err());
}

#[test]
fn run_queue_is_fifo_with_identity_removal() {
    let mut q = RunQueue::new();
    for i in 0..5u64 {
        q.enqueue(mk_thread(i, 0, false)).unwrap();
    }
    let gone = q.remove(ThreadId(2)).expect("thread 2 is queued");
    assert_eq!(gone.tid, ThreadId(2));

    let order: Vec<u64> = core::iter::from_fn(|| q.dequeue()).map(|t| t.tid.0).collect();
    assert_eq!(order, [0, 1, 3, 4]);
}

#[test]
fn lottery_distribution_tracks_tickets() {
    // three threads with tickets 10/20/70 plus the idle thread; over many
    // draws with the deterministic RNG the counts approximate the ticket
    // shares and idle is never picked
    let platform = Arc::new(SimPlatform::with_seed(1, 0xdead_beef));
    let mut q = LotteryQueue::new();
    let threads = [
        mk_thread(1, 10, false),
        mk_thread(2, 20, false),
        mk_thread(3, 70, false),
    ];
    let idle = mk_thread(0, 1, true);

    for t in threads.iter() {
        q.enqueue(tickets_of(t), t.clone()).unwrap();
    }
    q.enqueue(1, idle.clone()).unwrap();

    let mut counts = [0usize; 4];
    for _ in 0..1000 {
        let picked = q.draw(platform.random()).expect("queue is never empty");
        assert!(!picked.is_idle, "the idle thread must never win a draw");
        counts[picked.tid.0 as usize] += 1;
        q.enqueue(tickets_of(&picked), picked).unwrap();
    }

    assert_eq!(counts[0], 0);
    // generous bounds; the point is the ordering and rough proportion
    assert!(counts[3] > counts[2] && counts[2] > counts[1]);
    assert!(counts[3] > 500, "70-ticket thread won only {}", counts[3]);
    assert!(counts[1] < 250, "10-ticket thread won {}", counts[1]);
}

#[test]
fn lottery_skips_idle_when_alone_with_one_peer() {
    // with only the idle thread and one aperiodic, the draw never returns
    // idle
    let platform = Arc::new(SimPlatform::with_seed(1, 7));
    let mut q = LotteryQueue::new();
    let idle = mk_thread(0, 1, true);
    let worker = mk_thread(1, 1, false);
    q.enqueue(1, idle).unwrap();
    q.enqueue(1, worker).unwrap();

    for _ in 0..100 {
        let picked = q.draw(platform.random()).unwrap();
        assert!(!picked.is_idle);
        q.enqueue(1, picked).unwrap();
    }
}

fn tickets_of(t: &ThreadRef) -> u64 {
    match t.rt.lock().constraints {
        Constraints::Aperiodic { priority, .. } => priority.max(1),
        _ => 1,
    }
}
