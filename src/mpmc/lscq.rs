//! LSCQ: unbounded MPMC pointer queue chaining bounded SCQP nodes.
//!
//! Producers work the tail node until it fills, then one of them finalizes it
//! (a one-shot flag), allocates a successor through the internal object pool,
//! and links it. Consumers drain the head node and advance `head` once the
//! node is both finalized and empty, recycling it through the pool.
//!
//! Node recycling replaces the epoch-based reclamation of earlier revisions;
//! a `closing` flag plus an operation counter lets the destructor quiesce
//! in-flight calls without a global lock.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::ebr::EbrManager;
use crate::mpmc::Scqp;
use crate::pool::ObjectPool;

// Bounded enqueue retries; exhausting them under extreme contention reports
// failure to the caller rather than spinning unboundedly.
const MAX_ENQ_RETRIES: usize = 16;

// Bounded wait for a finalized node's successor to be linked.
const MAX_WAIT_RETRIES: usize = 1024;

// Dequeue attempts against a finalized node before trusting its emptiness;
// rides out SCQP threshold false negatives.
const NODE_DRAIN_RETRIES: usize = 8;

const CLOSE_ACTIVE_OPS_TIMEOUT: Duration = Duration::from_millis(500);

struct Node<T> {
    scqp: Scqp<T>,
    next: CachePadded<AtomicPtr<Node<T>>>,
    finalized: CachePadded<AtomicBool>,
}

impl<T> Node<T> {
    fn new(scqsize: usize) -> Self {
        Self {
            scqp: Scqp::new(scqsize),
            next: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            finalized: CachePadded::new(AtomicBool::new(false)),
        }
    }
}

/// Unbounded MPMC queue over `*mut T`.
///
/// `enqueue` rejects null and can report `false` when its bounded retry
/// budget is exhausted under extreme contention (or while the queue is being
/// destroyed); `dequeue` returns null on empty. The queue never touches the
/// pointees; their lifetime stays with the caller.
///
/// The underlying SCQP threshold heuristic is tuned for ongoing concurrency;
/// see [`Scqp::dequeue`] for the batch-drain caveat. `dequeue` internally
/// retries around transient false negatives on finalized nodes.
pub struct Lscq<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    pool: ObjectPool<Node<T>>,
    closing: AtomicBool,
    active_ops: AtomicIsize,
}

unsafe impl<T: Send> Send for Lscq<T> {}
unsafe impl<T: Send> Sync for Lscq<T> {}

struct OpGuard<'a, T> {
    queue: &'a Lscq<T>,
    active: bool,
}

impl<'a, T> OpGuard<'a, T> {
    fn enter(queue: &'a Lscq<T>) -> Self {
        if queue.closing.load(Ordering::Acquire) {
            return Self {
                queue,
                active: false,
            };
        }
        queue.active_ops.fetch_add(1, Ordering::AcqRel);
        if queue.closing.load(Ordering::Acquire) {
            queue.active_ops.fetch_sub(1, Ordering::AcqRel);
            return Self {
                queue,
                active: false,
            };
        }
        Self {
            queue,
            active: true,
        }
    }
}

impl<T> Drop for OpGuard<'_, T> {
    fn drop(&mut self) {
        if self.active {
            self.queue.active_ops.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl<T: Send + 'static> Lscq<T> {
    /// Create a queue whose nodes each hold an SCQP ring of `scqsize` slots.
    pub fn new(scqsize: usize) -> Self {
        let pool = ObjectPool::new(move || Box::into_raw(Box::new(Node::<T>::new(scqsize))));

        let initial = pool.get();
        assert!(!initial.is_null(), "initial node allocation");

        Self {
            head: CachePadded::new(AtomicPtr::new(initial)),
            tail: CachePadded::new(AtomicPtr::new(initial)),
            pool,
            closing: AtomicBool::new(false),
            active_ops: AtomicIsize::new(0),
        }
    }

    /// Source-compatibility constructor from the EBR-based revision. The
    /// manager argument is ignored; nodes are recycled through the internal
    /// object pool.
    pub fn new_with_legacy_ebr(_ebr: &EbrManager, scqsize: usize) -> Self {
        Self::new(scqsize)
    }

    /// Enqueue a pointer. Returns false on null, while closing, or after the
    /// bounded retry budget is exhausted.
    pub fn enqueue(&self, ptr: *mut T) -> bool {
        if ptr.is_null() {
            return false;
        }
        let guard = OpGuard::enter(self);
        if !guard.active {
            return false;
        }

        for _ in 0..MAX_ENQ_RETRIES {
            let tail = self.tail.load(Ordering::Acquire);
            let tail_ref = unsafe { &*tail };

            if tail_ref.scqp.enqueue(ptr) {
                return true;
            }

            // Node is full. Exactly one producer wins the finalize and is
            // responsible for installing a successor.
            if tail_ref
                .finalized
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let new_node = self.pool.get();
                if new_node.is_null() {
                    // Pool is closing under us.
                    return false;
                }
                if tail_ref
                    .next
                    .compare_exchange(
                        ptr::null_mut(),
                        new_node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    // Another producer already linked a node.
                    self.pool.put(new_node);
                }
            }

            let next = tail_ref.next.load(Ordering::Acquire);
            if !next.is_null() {
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            } else {
                // Successor not visible yet; let the finalizing thread run.
                thread::yield_now();
            }
        }

        false
    }

    /// Dequeue a pointer, or null when the queue is empty (or closing).
    pub fn dequeue(&self) -> *mut T {
        let guard = OpGuard::enter(self);
        if !guard.active {
            return ptr::null_mut();
        }

        let mut wait_retries = 0;
        loop {
            let head = self.head.load(Ordering::Acquire);
            let head_ref = unsafe { &*head };

            let result = head_ref.scqp.dequeue();
            if !result.is_null() {
                return result;
            }

            let next = head_ref.next.load(Ordering::Acquire);
            if next.is_null() {
                if !head_ref.finalized.load(Ordering::Acquire) {
                    // No successor and still accepting enqueues: truly empty.
                    return ptr::null_mut();
                }
                // Finalized but the successor is not linked yet; wait a
                // bounded number of yields for the enqueuing thread.
                wait_retries += 1;
                if wait_retries > MAX_WAIT_RETRIES {
                    return ptr::null_mut();
                }
                thread::yield_now();
                continue;
            }
            wait_retries = 0;

            // A successor exists, so the head node is sealed. Its dequeue
            // just failed, but the threshold heuristic can report transient
            // empties; drain stragglers before advancing past it.
            if !head_ref.scqp.is_empty() {
                let mut drained = ptr::null_mut();
                for _ in 0..NODE_DRAIN_RETRIES {
                    drained = head_ref.scqp.dequeue();
                    if !drained.is_null() {
                        break;
                    }
                    thread::yield_now();
                }
                if !drained.is_null() {
                    return drained;
                }
                if !head_ref.scqp.is_empty() {
                    // Still holds values; keep working this node.
                    continue;
                }
            }

            // Drained and sealed: advance head and recycle the old node.
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.recycle_node(head);
            }
        }
    }

    /// Approximate number of drained nodes currently cached for reuse.
    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    // Return a drained node to the pool in its construction-time state. A
    // node whose ring cannot be reset (a straggling enqueue landed after the
    // final emptiness check) is freed instead of recycled.
    fn recycle_node(&self, node: *mut Node<T>) {
        let node_ref = unsafe { &*node };
        node_ref.next.store(ptr::null_mut(), Ordering::Release);
        node_ref.finalized.store(false, Ordering::Release);
        if node_ref.scqp.reset_for_reuse() {
            self.pool.put(node);
        } else {
            unsafe { drop(Box::from_raw(node)) };
        }
    }

    #[cfg(test)]
    fn node_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            count += 1;
            cur = unsafe { (*cur).next.load(Ordering::Acquire) };
        }
        count
    }
}

impl<T> Lscq<T> {
    fn wait_for_active_ops(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.active_ops.load(Ordering::Acquire) <= 0 {
                return true;
            }
            thread::yield_now();
        }
        self.active_ops.load(Ordering::Acquire) <= 0
    }
}

impl<T> Drop for Lscq<T> {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        // Bounded: a runaway caller cannot hang destruction forever.
        let _ = self.wait_for_active_ops(CLOSE_ACTIVE_OPS_TIMEOUT);

        // Return every still-linked node to the pool; the pool then frees
        // them (and all cached nodes) as it drops.
        let mut cur = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            unsafe {
                (*cur).next.store(ptr::null_mut(), Ordering::Relaxed);
                (*cur).finalized.store(false, Ordering::Relaxed);
            }
            if unsafe { (*cur).scqp.reset_for_reuse() } {
                self.pool.put(cur);
            } else {
                unsafe { drop(Box::from_raw(cur)) };
            }
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_expansion_links_new_nodes() {
        let queue = Lscq::<u64>::new(16);
        let values: Vec<u64> = (0..128).collect();

        for v in &values {
            assert!(queue.enqueue(v as *const u64 as *mut u64));
        }
        assert!(queue.node_count() > 1);

        for v in &values {
            let p = queue.dequeue();
            assert_eq!(p, v as *const u64 as *mut u64);
        }
        assert!(queue.dequeue().is_null());
    }

    #[test]
    fn drained_nodes_are_recycled_through_the_pool() {
        let queue = Lscq::<u64>::new(16);
        let values: Vec<u64> = (0..256).collect();

        for round in 0..2 {
            for v in &values {
                assert!(queue.enqueue(v as *const u64 as *mut u64));
            }
            for v in &values {
                assert_eq!(queue.dequeue(), v as *const u64 as *mut u64);
            }
            assert!(queue.dequeue().is_null());

            if round == 0 {
                assert!(queue.pool_size() > 0, "drained nodes should be pooled");
            }
        }
    }
}
