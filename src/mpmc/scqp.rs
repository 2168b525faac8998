//! SCQP: SCQ variant that stores raw pointers.
//!
//! Two payload modes, chosen at construction. When the native 16-byte CAS is
//! available, slots carry `(cycle_flags, pointer bits)` directly and null
//! marks an empty slot. Otherwise the ring falls back to index-valued slots
//! plus a side array of atomic pointers holding the payloads.
//!
//! Unlike NCQ/SCQ this queue exposes boundedness: `enqueue` fast-fails with
//! `false` when `scqsize` values are in flight.

use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::cas2::{cas2, entry_load, has_cas2_support, payload_swap, Entry};
use crate::mpmc::scq::{pack_cycle_flags, unpack_cycle, unpack_is_safe};
use crate::mpmc::{cache_remap, cycle_less, round_up_pow2, EntryArray};

// Empty sentinel for the fallback (index) payload.
const EMPTY_INDEX: u64 = u64::MAX;

// Safety valve: bound the spin on a cycle-matched slot whose safe bit is
// down before abandoning the ticket.
const MAX_INNER_RETRIES: usize = 1024;

/// Bounded MPMC queue over `*mut T`.
///
/// `enqueue` rejects null and reports "full" as `false`; `dequeue` returns
/// null when empty.
///
/// The fast-empty path is tuned for ongoing producer/consumer concurrency:
/// under a strict enqueue-all-then-dequeue-all pattern a dequeue can observe
/// a transient false negative right after the threshold drains. Callers that
/// drain in a single-threaded phase should confirm with [`Scqp::is_empty`]
/// before treating null as final.
pub struct Scqp<T> {
    entries: EntryArray,
    ptr_array: Option<Box<[AtomicPtr<T>]>>,
    scqsize: usize,
    qsize: usize,
    bottom: u64, // Ticket mask: scqsize - 1.
    shift: u32,
    using_fallback: bool,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    threshold: CachePadded<AtomicI64>,
    deq_success: CachePadded<AtomicU64>,
    enq_success: CachePadded<AtomicU64>,
}

unsafe impl<T: Send> Send for Scqp<T> {}
unsafe impl<T: Send> Sync for Scqp<T> {}

#[inline]
fn queue_is_full(head: u64, tail: u64, scqsize: u64) -> bool {
    tail >= head && tail - head >= scqsize
}

impl<T> Scqp<T> {
    /// Create a ring of `scqsize` slots (clamped ≥ 4, rounded up to a power
    /// of two), picking the pointer fast path when the CPU supports it.
    pub fn new(scqsize: usize) -> Self {
        Self::with_mode(scqsize, false)
    }

    /// Like [`Scqp::new`], but `force_fallback` pins the index+side-array
    /// mode even when the native 16-byte CAS is available.
    pub fn with_mode(scqsize: usize, force_fallback: bool) -> Self {
        let scqsize = round_up_pow2(scqsize.max(4));
        let qsize = scqsize / 2;
        let bottom = (scqsize - 1) as u64;
        let using_fallback = force_fallback || !has_cas2_support();

        let (entries, ptr_array) = if using_fallback {
            let entries =
                EntryArray::new(scqsize, Entry::new(pack_cycle_flags(0, true), EMPTY_INDEX));
            let ptr_array = (0..scqsize)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect::<Vec<_>>()
                .into_boxed_slice();
            (entries, Some(ptr_array))
        } else {
            // Pointer mode: payload word holds the pointer bits, null = empty.
            let entries = EntryArray::new(scqsize, Entry::new(pack_cycle_flags(0, true), 0));
            (entries, None)
        };

        Self {
            entries,
            ptr_array,
            scqsize,
            qsize,
            bottom,
            shift: scqsize.trailing_zeros(),
            using_fallback,
            head: CachePadded::new(AtomicU64::new(scqsize as u64)),
            tail: CachePadded::new(AtomicU64::new(scqsize as u64)),
            threshold: CachePadded::new(AtomicI64::new(Self::threshold_reset(scqsize))),
            deq_success: CachePadded::new(AtomicU64::new(0)),
            enq_success: CachePadded::new(AtomicU64::new(0)),
        }
    }

    // 4 * qsize - 1, with qsize = scqsize / 2.
    #[inline]
    fn threshold_reset(scqsize: usize) -> i64 {
        ((scqsize as u64) * 2 - 1) as i64
    }

    /// Enqueue a pointer. Returns false on null or when the queue is full.
    pub fn enqueue(&self, ptr: *mut T) -> bool {
        if ptr.is_null() {
            return false;
        }
        if self.using_fallback {
            self.enqueue_index(ptr)
        } else {
            self.enqueue_ptr(ptr)
        }
    }

    /// Dequeue a pointer, or null when the queue is empty.
    pub fn dequeue(&self) -> *mut T {
        if self.using_fallback {
            self.dequeue_index()
        } else {
            self.dequeue_ptr()
        }
    }

    fn enqueue_ptr(&self, ptr: *mut T) -> bool {
        let scqsize = self.scqsize as u64;
        let threshold_reset = Self::threshold_reset(self.scqsize);

        loop {
            let head = self.deq_success.load(Ordering::Acquire);
            let tail = self.enq_success.load(Ordering::Acquire);
            if queue_is_full(head, tail, scqsize) {
                return false;
            }

            let t = self.tail.fetch_add(1, Ordering::AcqRel);
            let cycle_t = t >> self.shift;
            let j = cache_remap((t & self.bottom) as usize, self.scqsize);
            let slot = self.entries.slot(j);

            loop {
                let ent = entry_load(slot);
                let cycle_e = unpack_cycle(ent.cycle_flags);

                if cycle_less(cycle_e, cycle_t) && ent.index_or_ptr == 0 {
                    let is_safe = unpack_is_safe(ent.cycle_flags);
                    if is_safe || self.head.load(Ordering::Acquire) <= t {
                        let mut expected = ent;
                        let desired = Entry::new(pack_cycle_flags(cycle_t, true), ptr as u64);
                        if cas2(slot, &mut expected, desired) {
                            if self.threshold.load(Ordering::Relaxed) != threshold_reset {
                                self.threshold.store(threshold_reset, Ordering::Release);
                            }
                            self.enq_success.fetch_add(1, Ordering::Relaxed);
                            return true;
                        }
                        continue;
                    }
                }
                break;
            }
        }
    }

    fn dequeue_ptr(&self) -> *mut T {
        let threshold_reset = Self::threshold_reset(self.scqsize);

        if self.threshold.load(Ordering::Acquire) < 0 {
            let head_now = self.head.load(Ordering::Acquire);
            let tail_now = self.tail.load(Ordering::Acquire);
            if tail_now > head_now {
                self.threshold.store(threshold_reset, Ordering::Release);
            } else {
                return ptr::null_mut();
            }
        }

        loop {
            let h = self.head.fetch_add(1, Ordering::AcqRel);
            let cycle_h = h >> self.shift;
            let j = cache_remap((h & self.bottom) as usize, self.scqsize);
            let slot = self.entries.slot(j);

            let mut inner_retries = 0;
            loop {
                let ent = entry_load(slot);
                let cycle_e = unpack_cycle(ent.cycle_flags);

                if cycle_e == cycle_h {
                    // Pointer first: an empty slot carries no value no matter
                    // the safe bit.
                    if ent.index_or_ptr == 0 {
                        break;
                    }
                    if !unpack_is_safe(ent.cycle_flags) {
                        inner_retries += 1;
                        if inner_retries > MAX_INNER_RETRIES {
                            break;
                        }
                        continue;
                    }
                    let value = payload_swap(slot, 0) as *mut T;
                    self.deq_success.fetch_add(1, Ordering::Relaxed);
                    return value;
                }

                let desired = if ent.index_or_ptr == 0 {
                    Entry::new(pack_cycle_flags(cycle_h, unpack_is_safe(ent.cycle_flags)), 0)
                } else {
                    Entry::new(pack_cycle_flags(cycle_e, false), ent.index_or_ptr)
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
                let next = self.threshold.fetch_sub(1, Ordering::AcqRel) - 1;
                if next <= 0 {
                    self.fix_if_lagging(threshold_reset);
                }
                return ptr::null_mut();
            }

            let next = self.threshold.fetch_sub(1, Ordering::AcqRel) - 1;
            if next <= 0 {
                let head_now = self.head.load(Ordering::Acquire);
                let tail_now = self.tail.load(Ordering::Acquire);

                if tail_now > head_now {
                    // Queue refilled while the threshold drained: retry.
                    self.threshold.store(threshold_reset, Ordering::Release);
                    continue;
                }
                if head_now > tail_now && head_now - tail_now > self.scqsize as u64 {
                    self.fix_state();
                    self.threshold.store(threshold_reset, Ordering::Release);
                }
                return ptr::null_mut();
            }
        }
    }

    fn enqueue_index(&self, ptr: *mut T) -> bool {
        let scqsize = self.scqsize as u64;
        let threshold_reset = Self::threshold_reset(self.scqsize);
        let ptr_array = self.ptr_array.as_ref().expect("fallback mode");

        loop {
            let head = self.deq_success.load(Ordering::Acquire);
            let tail = self.enq_success.load(Ordering::Acquire);
            if queue_is_full(head, tail, scqsize) {
                return false;
            }

            let t = self.tail.fetch_add(1, Ordering::AcqRel);
            let cycle_t = t >> self.shift;
            let j = cache_remap((t & self.bottom) as usize, self.scqsize);
            let slot = self.entries.slot(j);

            loop {
                let ent = entry_load(slot);
                let cycle_e = unpack_cycle(ent.cycle_flags);

                if cycle_less(cycle_e, cycle_t) && ent.index_or_ptr == EMPTY_INDEX {
                    let is_safe = unpack_is_safe(ent.cycle_flags);
                    if is_safe || self.head.load(Ordering::Acquire) <= t {
                        // Publish the payload into the side slot first; the
                        // ring entry then only carries its index.
                        if ptr_array[j]
                            .compare_exchange(
                                ptr::null_mut(),
                                ptr,
                                Ordering::AcqRel,
                                Ordering::Relaxed,
                            )
                            .is_err()
                        {
                            break;
                        }

                        let mut expected = ent;
                        let desired = Entry::new(pack_cycle_flags(cycle_t, true), j as u64);
                        if cas2(slot, &mut expected, desired) {
                            if self.threshold.load(Ordering::Relaxed) != threshold_reset {
                                self.threshold.store(threshold_reset, Ordering::Release);
                            }
                            self.enq_success.fetch_add(1, Ordering::Relaxed);
                            return true;
                        }

                        // Ring CAS lost: roll the side slot back.
                        let _ = ptr_array[j].compare_exchange(
                            ptr,
                            ptr::null_mut(),
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        );
                        continue;
                    }
                }
                break;
            }
        }
    }

    fn dequeue_index(&self) -> *mut T {
        let threshold_reset = Self::threshold_reset(self.scqsize);
        let ptr_array = self.ptr_array.as_ref().expect("fallback mode");

        if self.threshold.load(Ordering::Acquire) < 0 {
            let head_now = self.head.load(Ordering::Acquire);
            let tail_now = self.tail.load(Ordering::Acquire);
            if tail_now > head_now {
                self.threshold.store(threshold_reset, Ordering::Release);
            } else {
                return ptr::null_mut();
            }
        }

        loop {
            let h = self.head.fetch_add(1, Ordering::AcqRel);
            let cycle_h = h >> self.shift;
            let j = cache_remap((h & self.bottom) as usize, self.scqsize);
            let slot = self.entries.slot(j);

            let mut inner_retries = 0;
            loop {
                let ent = entry_load(slot);
                let cycle_e = unpack_cycle(ent.cycle_flags);

                if cycle_e == cycle_h {
                    let idx = ent.index_or_ptr;
                    if idx == EMPTY_INDEX {
                        break;
                    }
                    if !unpack_is_safe(ent.cycle_flags) {
                        inner_retries += 1;
                        if inner_retries > MAX_INNER_RETRIES {
                            break;
                        }
                        continue;
                    }
                    let value = ptr_array[idx as usize].swap(ptr::null_mut(), Ordering::AcqRel);
                    payload_swap(slot, EMPTY_INDEX);
                    self.deq_success.fetch_add(1, Ordering::Relaxed);
                    return value;
                }

                let desired = if ent.index_or_ptr == EMPTY_INDEX {
                    Entry::new(
                        pack_cycle_flags(cycle_h, unpack_is_safe(ent.cycle_flags)),
                        EMPTY_INDEX,
                    )
                } else {
                    Entry::new(pack_cycle_flags(cycle_e, false), ent.index_or_ptr)
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
                let next = self.threshold.fetch_sub(1, Ordering::AcqRel) - 1;
                if next <= 0 {
                    self.fix_if_lagging(threshold_reset);
                }
                return ptr::null_mut();
            }

            let next = self.threshold.fetch_sub(1, Ordering::AcqRel) - 1;
            if next <= 0 {
                let head_now = self.head.load(Ordering::Acquire);
                let tail_now = self.tail.load(Ordering::Acquire);

                if tail_now > head_now {
                    self.threshold.store(threshold_reset, Ordering::Release);
                    continue;
                }
                if head_now > tail_now && head_now - tail_now > self.scqsize as u64 {
                    self.fix_state();
                    self.threshold.store(threshold_reset, Ordering::Release);
                }
                return ptr::null_mut();
            }
        }
    }

    fn fix_if_lagging(&self, threshold_reset: i64) {
        let head_now = self.head.load(Ordering::Acquire);
        let tail_now = self.tail.load(Ordering::Acquire);
        if head_now > tail_now && head_now - tail_now > self.scqsize as u64 {
            self.fix_state();
            self.threshold.store(threshold_reset, Ordering::Release);
        }
    }

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

    /// Best-effort emptiness, derived from the success counters so it agrees
    /// with the full-queue fast-fail.
    pub fn is_empty(&self) -> bool {
        let head = self.deq_success.load(Ordering::Relaxed);
        let tail = self.enq_success.load(Ordering::Relaxed);
        tail <= head
    }

    /// Whether the index+side-array fallback is active.
    pub fn is_using_fallback(&self) -> bool {
        self.using_fallback
    }

    /// Ring size (2n).
    pub fn scqsize(&self) -> usize {
        self.scqsize
    }

    /// Usable capacity (n).
    pub fn qsize(&self) -> usize {
        self.qsize
    }

    /// Restore the construction-time state of an empty ring so it can be
    /// recycled without reallocating.
    ///
    /// Contract: the ring must be empty and the caller must hold exclusive
    /// access (no concurrent enqueue/dequeue). Returns false, leaving the
    /// state untouched, when a residual payload is found.
    pub fn reset_for_reuse(&self) -> bool {
        if !self.is_empty() {
            return false;
        }

        if let Some(ptr_array) = self.ptr_array.as_ref() {
            for i in 0..self.scqsize {
                let ent = entry_load(self.entries.slot(i));
                if ent.index_or_ptr != EMPTY_INDEX
                    || !ptr_array[i].load(Ordering::Relaxed).is_null()
                {
                    return false;
                }
            }
        } else {
            for i in 0..self.scqsize {
                if entry_load(self.entries.slot(i)).index_or_ptr != 0 {
                    return false;
                }
            }
        }

        if let Some(ptr_array) = self.ptr_array.as_ref() {
            self.entries
                .fill(Entry::new(pack_cycle_flags(0, true), EMPTY_INDEX));
            for slot in ptr_array.iter() {
                slot.store(ptr::null_mut(), Ordering::Relaxed);
            }
        } else {
            self.entries.fill(Entry::new(pack_cycle_flags(0, true), 0));
        }

        let scqsize = self.scqsize as u64;
        self.head.store(scqsize, Ordering::Relaxed);
        self.tail.store(scqsize, Ordering::Relaxed);
        self.threshold
            .store(Self::threshold_reset(self.scqsize), Ordering::Relaxed);
        self.deq_success.store(0, Ordering::Relaxed);
        self.enq_success.store(0, Ordering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(v: u64) -> *mut u64 {
        Box::into_raw(Box::new(v))
    }

    unsafe fn unbox(p: *mut u64) -> u64 {
        *Box::from_raw(p)
    }

    #[test]
    fn rejects_null() {
        let q = Scqp::<u64>::new(16);
        assert!(!q.enqueue(ptr::null_mut()));
        assert!(q.is_empty());
    }

    #[test]
    fn round_trips_pointers_in_both_modes() {
        for force_fallback in [false, true] {
            let q = Scqp::<u64>::with_mode(16, force_fallback);
            assert_eq!(q.is_using_fallback(), force_fallback || !has_cas2_support());

            let p = boxed(7);
            assert!(q.enqueue(p));
            assert!(!q.is_empty());
            let out = q.dequeue();
            assert_eq!(out, p);
            assert_eq!(unsafe { unbox(out) }, 7);
            assert!(q.is_empty());
            assert!(q.dequeue().is_null());
        }
    }

    #[test]
    fn reports_full_without_blocking() {
        for force_fallback in [false, true] {
            let q = Scqp::<u64>::with_mode(4, force_fallback);
            let mut ptrs = Vec::new();
            let mut stored = 0;
            // Push until the bounded fast-fail kicks in.
            loop {
                let p = boxed(stored);
                if q.enqueue(p) {
                    ptrs.push(p);
                    stored += 1;
                    assert!(stored <= q.scqsize() as u64);
                } else {
                    unsafe { drop(Box::from_raw(p)) };
                    break;
                }
            }
            assert!(stored >= q.qsize() as u64);
            for p in ptrs {
                assert_eq!(q.dequeue(), p);
                unsafe { drop(Box::from_raw(p)) };
            }
        }
    }

    #[test]
    fn reset_for_reuse_requires_empty() {
        for force_fallback in [false, true] {
            let q = Scqp::<u64>::with_mode(16, force_fallback);
            let p = boxed(1);
            assert!(q.enqueue(p));
            assert!(!q.reset_for_reuse());

            assert_eq!(q.dequeue(), p);
            unsafe { drop(Box::from_raw(p)) };
            assert!(q.reset_for_reuse());

            // Indistinguishable from a fresh queue of the same size.
            let p = boxed(2);
            assert!(q.enqueue(p));
            assert_eq!(q.dequeue(), p);
            unsafe { drop(Box::from_raw(p)) };
            assert!(q.dequeue().is_null());
        }
    }
}
