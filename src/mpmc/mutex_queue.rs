//! Single-mutex FIFO, the simplest possible comparison baseline.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// Classic FIFO behind one mutex.
pub struct MutexQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> Default for MutexQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MutexQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Capacity is accepted for API compatibility with the bounded queues.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Enqueue a value; always succeeds.
    pub fn enqueue(&self, value: T) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(value);
        true
    }

    /// Dequeue into `out`. Returns false when the queue is empty.
    pub fn dequeue(&self, out: &mut T) -> bool {
        match self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            Some(value) => {
                *out = value;
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = MutexQueue::new();
        assert!(q.is_empty());
        for i in 0..5u32 {
            assert!(q.enqueue(i));
        }
        let mut out = 0;
        for i in 0..5u32 {
            assert!(q.dequeue(&mut out));
            assert_eq!(out, i);
        }
        assert!(!q.dequeue(&mut out));
        assert!(q.is_empty());
    }
}
