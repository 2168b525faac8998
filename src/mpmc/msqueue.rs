//! Michael–Scott lock-free queue, kept as a comparison baseline.
//!
//! Dequeued nodes are not reclaimed immediately (that would need hazard
//! pointers or epochs); they are pushed onto an internal retired list and
//! freed when the queue is dropped. Callers must not race destruction.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

struct Node<T> {
    data: Option<T>,
    next: AtomicPtr<Node<T>>,
    retired_next: *mut Node<T>,
}

impl<T> Node<T> {
    fn new(data: Option<T>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            data,
            next: AtomicPtr::new(ptr::null_mut()),
            retired_next: ptr::null_mut(),
        }))
    }
}

/// Unbounded MPMC queue (Michael & Scott 1996), deferred reclamation.
pub struct MsQueue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    retired: CachePadded<AtomicPtr<Node<T>>>,
}

unsafe impl<T: Send> Send for MsQueue<T> {}
unsafe impl<T: Send> Sync for MsQueue<T> {}

impl<T> Default for MsQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MsQueue<T> {
    /// Create an empty queue (one internal dummy node).
    pub fn new() -> Self {
        let dummy = Node::new(None);
        Self {
            head: CachePadded::new(AtomicPtr::new(dummy)),
            tail: CachePadded::new(AtomicPtr::new(dummy)),
            retired: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Enqueue a value. Always succeeds (allocates a node).
    pub fn enqueue(&self, value: T) -> bool {
        let node = Node::new(Some(value));

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };

            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }

            if next.is_null() {
                if unsafe { &(*tail).next }
                    .compare_exchange(
                        ptr::null_mut(),
                        node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    let _ = self.tail.compare_exchange(
                        tail,
                        node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    return true;
                }
            } else {
                // Help a lagging enqueuer swing the tail.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire);
            }
        }
    }

    /// Dequeue into `out`. Returns false when the queue is empty.
    pub fn dequeue(&self, out: &mut T) -> bool {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*head).next.load(Ordering::Acquire) };

            if head != self.head.load(Ordering::Acquire) {
                continue;
            }

            if next.is_null() {
                return false;
            }

            if head == tail {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire);
                continue;
            }

            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Winning the head CAS grants exclusive rights to this
                // node's payload.
                let data = unsafe { (*ptr::addr_of_mut!((*next).data)).take() };
                *out = data.expect("non-dummy node carries a value");
                self.retire_node(head);
                return true;
            }
        }
    }

    /// Size in bytes of one internal node allocation.
    pub const fn node_size_bytes() -> usize {
        std::mem::size_of::<Node<T>>()
    }

    fn retire_node(&self, node: *mut Node<T>) {
        loop {
            let head = self.retired.load(Ordering::Acquire);
            unsafe { (*node).retired_next = head };
            if self
                .retired
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl<T> Drop for MsQueue<T> {
    fn drop(&mut self) {
        // Live chain (dummy plus any unconsumed values).
        let mut cur = self.head.load(Ordering::Relaxed);
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            unsafe { drop(Box::from_raw(cur)) };
            cur = next;
        }

        // Retired chain (payloads already taken).
        let mut cur = self.retired.load(Ordering::Relaxed);
        while !cur.is_null() {
            let next = unsafe { (*cur).retired_next };
            unsafe { drop(Box::from_raw(cur)) };
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_and_empty() {
        let q = MsQueue::new();
        let mut out = 0u64;
        assert!(!q.dequeue(&mut out));

        for i in 0..50u64 {
            assert!(q.enqueue(i));
        }
        for i in 0..50u64 {
            assert!(q.dequeue(&mut out));
            assert_eq!(out, i);
        }
        assert!(!q.dequeue(&mut out));
    }

    #[test]
    fn drop_with_unconsumed_values() {
        let q = MsQueue::new();
        for i in 0..10 {
            q.enqueue(vec![i; 4]);
        }
        let mut out = Vec::new();
        assert!(q.dequeue(&mut out));
        // Remaining nodes (and their payloads) are freed by drop.
    }
}
