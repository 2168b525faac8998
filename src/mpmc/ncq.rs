//! NCQ: the naive circular queue from the SCQ paper (Figure 5).
//!
//! Kept as the didactic baseline and as a regression target for the
//! tail-helping logic. NCQ has a known liveness hazard: a producer that
//! stalls between claiming a ticket and writing its slot can make dequeuers
//! observe a wrong-cycle slot indefinitely. SCQ resolves this with the safe
//! bit and the dynamic threshold.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::cas2::{cas2, entry_load, Entry};
use crate::mpmc::{cache_remap, EntryArray, IndexType, CACHE_LINE_SIZE};
use crate::IndexQueue;

/// Bounded MPMC ring over unsigned integer values.
///
/// `enqueue` never reports "full": when the ring is full it spins until a
/// consumer makes room. `dequeue` returns [`IndexType::EMPTY`] when empty.
pub struct Ncq<T: IndexType> {
    entries: EntryArray,
    capacity: usize,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: IndexType> Ncq<T> {
    /// Create a ring with (at least) `capacity` slots.
    ///
    /// The capacity is clamped to a minimum of one cache line worth of
    /// entries and rounded up to a multiple of four so the remapping stays a
    /// bijection.
    pub fn new(capacity: usize) -> Self {
        let entries_per_line = CACHE_LINE_SIZE / std::mem::size_of::<Entry>(); // 4
        let mut capacity = capacity.max(1).max(entries_per_line);
        capacity = capacity.div_ceil(entries_per_line) * entries_per_line;

        let entries = EntryArray::new(capacity, Entry::new(0, 0));

        // Figure 5 initialization: head = tail = n (cycle 1) while all slots
        // start at cycle 0; the off-by-one-cycle gap is what makes the empty
        // state detectable.
        Self {
            entries,
            capacity,
            head: CachePadded::new(AtomicU64::new(capacity as u64)),
            tail: CachePadded::new(AtomicU64::new(capacity as u64)),
            _marker: std::marker::PhantomData,
        }
    }

    /// Enqueue a value. Returns false only when `value` is the reserved
    /// sentinel; a full ring spins instead of failing.
    pub fn enqueue(&self, value: T) -> bool {
        if value == T::EMPTY {
            return false;
        }

        let n = self.capacity as u64;
        loop {
            let t = self.tail.load(Ordering::Acquire);
            let cycle_t = t / n;
            let j = cache_remap((t % n) as usize, self.capacity);
            let slot = self.entries.slot(j);

            let ent = entry_load(slot);
            let cycle_e = ent.cycle_flags;

            if cycle_e == cycle_t {
                // Another producer owns this ticket; help move tail.
                let _ = self.tail.compare_exchange_weak(
                    t,
                    t + 1,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                continue;
            }

            if cycle_e.wrapping_add(1) != cycle_t {
                // Tail is already stale.
                continue;
            }

            let mut expected = ent;
            let desired = Entry::new(cycle_t, value.to_u64());
            if cas2(slot, &mut expected, desired) {
                let _ = self.tail.compare_exchange_weak(
                    t,
                    t + 1,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                return true;
            }
        }
    }

    /// Dequeue a value, or [`IndexType::EMPTY`] when the queue is empty.
    pub fn dequeue(&self) -> T {
        let n = self.capacity as u64;
        loop {
            let h = self.head.load(Ordering::Acquire);
            let cycle_h = h / n;
            let j = cache_remap((h % n) as usize, self.capacity);

            let ent = entry_load(self.entries.slot(j));
            let cycle_e = ent.cycle_flags;

            if cycle_e != cycle_h {
                if cycle_e.wrapping_add(1) == cycle_h {
                    return T::EMPTY;
                }
                continue; // Head is already stale.
            }

            if self
                .head
                .compare_exchange_weak(h, h + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return T::from_u64(ent.index_or_ptr);
            }
        }
    }

    /// Moment-in-time emptiness check; may be stale under concurrency.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) >= self.tail.load(Ordering::Relaxed)
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: IndexType> IndexQueue<T> for Ncq<T> {
    fn enqueue(&self, value: T) -> bool {
        Ncq::enqueue(self, value)
    }

    fn dequeue(&self) -> T {
        Ncq::dequeue(self)
    }

    fn is_empty(&self) -> bool {
        Ncq::is_empty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_capacities_clamp_to_a_cache_line() {
        assert_eq!(Ncq::<u64>::new(0).capacity(), 4);
        assert_eq!(Ncq::<u64>::new(1).capacity(), 4);
        assert_eq!(Ncq::<u64>::new(5).capacity(), 8);
    }

    #[test]
    fn rejects_sentinel() {
        let q = Ncq::<u64>::new(16);
        assert!(!q.enqueue(u64::MAX));
        assert!(q.is_empty());
    }

    #[test]
    fn fifo_single_thread() {
        let q = Ncq::<u64>::new(16);
        for i in 0..10 {
            assert!(q.enqueue(i));
        }
        for i in 0..10 {
            assert_eq!(q.dequeue(), i);
        }
        assert_eq!(q.dequeue(), u64::MAX);
        assert!(q.is_empty());
    }

    #[test]
    fn wraps_around_the_ring() {
        let q = Ncq::<u32>::new(8);
        for round in 0..5u32 {
            for i in 0..8 {
                assert!(q.enqueue(round * 8 + i));
            }
            for i in 0..8 {
                assert_eq!(q.dequeue(), round * 8 + i);
            }
        }
        assert_eq!(q.dequeue(), u32::MAX);
    }
}
