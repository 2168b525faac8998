//! SCQ: Scalable Circular Queue (paper: arXiv:1908.04511, Figure 8).
//!
//! A bounded MPMC ring of `scqsize` (2n) slots with a usable capacity of
//! `qsize` (n). Each slot packs `(cycle << 1) | is_safe` next to the value;
//! the safe bit stops enqueuers from overwriting a slot a lagging dequeuer is
//! still inspecting, and the dynamic threshold bounds the work wasted by
//! dequeues against an empty queue.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::cas2::{cas2, entry_load, payload_fetch_or, Entry};
use crate::mpmc::{cache_remap, cycle_less, round_up_pow2, EntryArray, IndexType};
use crate::IndexQueue;

#[inline]
pub(crate) const fn pack_cycle_flags(cycle: u64, is_safe: bool) -> u64 {
    (cycle << 1) | is_safe as u64
}

#[inline]
pub(crate) const fn unpack_cycle(cycle_flags: u64) -> u64 {
    cycle_flags >> 1
}

#[inline]
pub(crate) const fn unpack_is_safe(cycle_flags: u64) -> bool {
    cycle_flags & 1 != 0
}

/// Bounded MPMC ring over unsigned integer values with the SCQ slot protocol.
///
/// Like [`Ncq`](crate::Ncq), `enqueue` spins rather than reporting "full";
/// unlike NCQ it stays live when producers stall mid-operation.
pub struct Scq<T: IndexType> {
    entries: EntryArray,
    scqsize: usize,
    qsize: usize,
    bottom: u64, // ⊥ marker; doubles as the ticket mask (scqsize - 1).
    shift: u32,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    threshold: CachePadded<AtomicI64>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: IndexType> Scq<T> {
    /// Create a ring of `scqsize` slots (clamped to ≥ 4 and rounded up to a
    /// power of two). The usable capacity is `scqsize / 2`.
    pub fn new(scqsize: usize) -> Self {
        let scqsize = round_up_pow2(scqsize.max(4));
        let qsize = scqsize / 2;
        let bottom = (scqsize - 1) as u64;

        let entries = EntryArray::new(scqsize, Entry::new(pack_cycle_flags(0, true), bottom));

        Self {
            entries,
            scqsize,
            qsize,
            bottom,
            shift: scqsize.trailing_zeros(),
            // Head/tail start at scqsize (cycle 1) against slots at cycle 0.
            head: CachePadded::new(AtomicU64::new(scqsize as u64)),
            tail: CachePadded::new(AtomicU64::new(scqsize as u64)),
            threshold: CachePadded::new(AtomicI64::new(Self::threshold_reset(scqsize))),
            _marker: std::marker::PhantomData,
        }
    }

    // 3 * qsize - 1, with qsize = scqsize / 2.
    #[inline]
    fn threshold_reset(scqsize: usize) -> i64 {
        (scqsize as u64 + (scqsize as u64 >> 1) - 1) as i64
    }

    /// Enqueue a value. Returns false when `value` is the sentinel or not
    /// representable below the ⊥ marker; spins when the ring is full.
    pub fn enqueue(&self, value: T) -> bool {
        if value == T::EMPTY {
            return false;
        }
        let value = value.to_u64();
        if value >= self.bottom {
            return false;
        }

        let threshold_reset = Self::threshold_reset(self.scqsize);

        loop {
            let t = self.tail.fetch_add(1, Ordering::AcqRel);
            let cycle_t = t >> self.shift;
            let j = cache_remap((t & self.bottom) as usize, self.scqsize);
            let slot = self.entries.slot(j);

            loop {
                let ent = entry_load(slot);
                let cycle_e = unpack_cycle(ent.cycle_flags);

                if cycle_less(cycle_e, cycle_t) && ent.index_or_ptr == self.bottom {
                    let is_safe = unpack_is_safe(ent.cycle_flags);
                    if is_safe || self.head.load(Ordering::Acquire) <= t {
                        let mut expected = ent;
                        let desired = Entry::new(pack_cycle_flags(cycle_t, true), value);
                        if cas2(slot, &mut expected, desired) {
                            if self.threshold.load(Ordering::Relaxed) != threshold_reset {
                                self.threshold.store(threshold_reset, Ordering::Release);
                            }
                            return true;
                        }
                        continue; // Retry the same slot (Figure 8 line 19).
                    }
                }

                break; // Give up on this ticket and claim a fresh tail.
            }
        }
    }

    /// Dequeue a value, or [`IndexType::EMPTY`] when the queue is empty.
    pub fn dequeue(&self) -> T {
        let threshold_reset = Self::threshold_reset(self.scqsize);

        // Figure 8 line 24: negative threshold is the fast empty exit, but
        // only after confirming tail has not moved past head (producers may
        // have finished a burst since the threshold drained).
        if self.threshold.load(Ordering::Acquire) < 0 {
            let head_now = self.head.load(Ordering::Acquire);
            let tail_now = self.tail.load(Ordering::Acquire);
            if tail_now > head_now {
                self.threshold.store(threshold_reset, Ordering::Release);
            } else {
                return T::EMPTY;
            }
        }

        loop {
            let h = self.head.fetch_add(1, Ordering::AcqRel);
            let cycle_h = h >> self.shift;
            let j = cache_remap((h & self.bottom) as usize, self.scqsize);
            let slot = self.entries.slot(j);

            loop {
                let ent = entry_load(slot);
                let cycle_e = unpack_cycle(ent.cycle_flags);

                if cycle_e == cycle_h {
                    if !unpack_is_safe(ent.cycle_flags) {
                        continue;
                    }
                    let value = ent.index_or_ptr;
                    if value == self.bottom {
                        break;
                    }
                    // Consume: set every value bit, preserving cycle/safe.
                    payload_fetch_or(slot, self.bottom);
                    return T::from_u64(value);
                }

                // Default: clear the safe bit (Figure 8 line 33); an empty
                // slot instead has its cycle bumped to cycle_h, safe bit
                // preserved (line 35).
                let desired = if ent.index_or_ptr == self.bottom {
                    Entry::new(
                        pack_cycle_flags(cycle_h, unpack_is_safe(ent.cycle_flags)),
                        self.bottom,
                    )
                } else {
                    Entry::new(
                        pack_cycle_flags(cycle_e, false),
                        ent.index_or_ptr,
                    )
                };

                if cycle_less(cycle_e, cycle_h) {
                    let mut expected = ent;
                    if !cas2(slot, &mut expected, desired) {
                        continue;
                    }
                }
                break;
            }

            let t = self.tail.load(Ordering::Acquire);
            if t <= h + 1 {
                // Nothing ahead of us: penalize the threshold and report
                // empty; catch tail up first if it lags far behind head.
                let next = self.threshold.fetch_sub(1, Ordering::AcqRel) - 1;
                if next <= 0 {
                    self.recheck_threshold(threshold_reset);
                }
                return T::EMPTY;
            }

            let next = self.threshold.fetch_sub(1, Ordering::AcqRel) - 1;
            if next <= 0 {
                self.recheck_threshold(threshold_reset);
                return T::EMPTY;
            }
        }
    }

    // Threshold crossed zero: either the queue refilled (reset and let the
    // caller's next dequeue run) or head ran far past tail and the invariant
    // tail - head <= scqsize needs repair.
    fn recheck_threshold(&self, threshold_reset: i64) {
        let head_now = self.head.load(Ordering::Acquire);
        let tail_now = self.tail.load(Ordering::Acquire);

        if tail_now > head_now {
            self.threshold.store(threshold_reset, Ordering::Release);
        } else if head_now > tail_now && head_now - tail_now > self.scqsize as u64 {
            self.fix_state();
            self.threshold.store(threshold_reset, Ordering::Release);
        }
    }

    // Catch tail up to head after a burst of empty dequeues drove head far
    // ahead (Figure 8 catchup).
    fn fix_state(&self) {
        loop {
            let h = self.head.load(Ordering::Acquire);
            let t = self.tail.load(Ordering::Acquire);

            if h <= t || h - t <= self.scqsize as u64 {
                return;
            }

            if self
                .tail
                .compare_exchange_weak(t, h, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Moment-in-time emptiness check; may be stale under concurrency.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) >= self.tail.load(Ordering::Relaxed)
    }

    /// Ring size (2n).
    pub fn scqsize(&self) -> usize {
        self.scqsize
    }

    /// Usable capacity (n).
    pub fn qsize(&self) -> usize {
        self.qsize
    }
}

impl<T: IndexType> IndexQueue<T> for Scq<T> {
    fn enqueue(&self, value: T) -> bool {
        Scq::enqueue(self, value)
    }

    fn dequeue(&self) -> T {
        Scq::dequeue(self)
    }

    fn is_empty(&self) -> bool {
        Scq::is_empty(self)
    }
}
