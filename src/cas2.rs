//! 16-byte (double-word) compare-and-swap used by the SCQ-family slot protocol.
//!
//! The fast path maps a slot onto a `portable_atomic::AtomicU128`, which lowers
//! to CMPXCHG16B on x86_64 and CASP/LDAXP-STLXP on aarch64. Whether that
//! lowering is lock-free is probed once at runtime and cached by
//! portable-atomic; when it is not (or when a slot is misaligned), operations
//! take a process-global striped mutex keyed on the slot address instead.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crossbeam_utils::CachePadded;
use portable_atomic::AtomicU128;

/// 16-byte slot payload updated as a unit by [`cas2`].
///
/// `cycle_flags` packs the slot's cycle counter plus small flags in the low
/// bits (NCQ uses the bare cycle; SCQ/SCQP pack `(cycle << 1) | is_safe`).
/// `index_or_ptr` carries the payload: an index value, a ring-slot index, or
/// raw pointer bits depending on the queue.
#[repr(C, align(16))]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Entry {
    pub cycle_flags: u64,
    pub index_or_ptr: u64,
}

const _: () = assert!(mem::size_of::<Entry>() == 16);
const _: () = assert!(mem::align_of::<Entry>() == 16);

impl Entry {
    #[inline]
    pub const fn new(cycle_flags: u64, index_or_ptr: u64) -> Self {
        Self {
            cycle_flags,
            index_or_ptr,
        }
    }

    // Both words share memory with the u128 view used on the native path, so
    // the conversion must go through the in-memory representation rather than
    // shifts (which would bake in an endianness).
    #[inline]
    fn into_bits(self) -> u128 {
        unsafe { mem::transmute(self) }
    }

    #[inline]
    fn from_bits(bits: u128) -> Self {
        unsafe { mem::transmute(bits) }
    }
}

const STRIPE_COUNT: usize = 32;
const _: () = assert!(STRIPE_COUNT.is_power_of_two());

static STRIPES: [CachePadded<Mutex<()>>; STRIPE_COUNT] =
    [const { CachePadded::new(Mutex::new(())) }; STRIPE_COUNT];

// Shift by 4 to ignore the alignment bits, mask with N-1 (N power of two).
#[inline]
fn stripe_for(ptr: *const Entry) -> &'static Mutex<()> {
    &STRIPES[((ptr as usize) >> 4) & (STRIPE_COUNT - 1)]
}

#[inline]
fn is_aligned_16(ptr: *const Entry) -> bool {
    (ptr as usize) & 15 == 0
}

/// Whether this process can use the native 16-byte CAS fast path.
///
/// portable-atomic caches its CPU probe, so this is cheap enough for hot
/// paths.
#[inline]
pub fn has_cas2_support() -> bool {
    AtomicU128::is_lock_free()
}

#[inline]
fn use_native(ptr: *const Entry) -> bool {
    has_cas2_support() && is_aligned_16(ptr)
}

/// Atomically compare-and-swap a 16-byte [`Entry`].
///
/// If `*ptr == *expected`, writes `desired` and returns true. Otherwise
/// overwrites `*expected` with the observed value and returns false. A null
/// `ptr` returns false with `expected` untouched.
///
/// Never fails spuriously from the caller's perspective beyond the normal
/// compare mismatch; the fallback path blocks on a stripe mutex instead.
pub fn cas2(ptr: *mut Entry, expected: &mut Entry, desired: Entry) -> bool {
    if ptr.is_null() {
        return false;
    }
    if use_native(ptr) {
        cas2_native(ptr, expected, desired)
    } else {
        cas2_mutex(ptr, expected, desired)
    }
}

fn cas2_native(ptr: *mut Entry, expected: &mut Entry, desired: Entry) -> bool {
    // AtomicU128 is a repr(C, align(16)) wrapper over the same 16 bytes; ptr
    // is non-null and 16-aligned here, and every access to a given slot uses
    // the same view.
    let atom = unsafe { &*(ptr as *const AtomicU128) };
    match atom.compare_exchange(
        expected.into_bits(),
        desired.into_bits(),
        Ordering::SeqCst,
        Ordering::SeqCst,
    ) {
        Ok(_) => true,
        Err(observed) => {
            *expected = Entry::from_bits(observed);
            false
        }
    }
}

fn cas2_mutex(ptr: *mut Entry, expected: &mut Entry, desired: Entry) -> bool {
    let _guard = stripe_for(ptr)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    // Unaligned reads are legal here; misaligned slots only ever reach the
    // mutex path, so all access to them serializes on the same stripe.
    let current = unsafe { ptr::read_unaligned(ptr) };
    if current != *expected {
        *expected = current;
        return false;
    }
    unsafe { ptr::write_unaligned(ptr, desired) };
    true
}

/// Atomic 16-byte read of a slot.
pub(crate) fn entry_load(ptr: *mut Entry) -> Entry {
    if use_native(ptr) {
        let atom = unsafe { &*(ptr as *const AtomicU128) };
        Entry::from_bits(atom.load(Ordering::SeqCst))
    } else {
        let _guard = stripe_for(ptr)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        unsafe { ptr::read_unaligned(ptr) }
    }
}

// A 64-bit view of the payload half of a slot. The SCQ/SCQP consume paths
// RMW only `index_or_ptr` while leaving `cycle_flags` intact; doing that as a
// single-word atomic avoids spurious cas2 failures against concurrent cycle
// updates (same trick as lfring's __lfring_array_entry).
#[inline]
unsafe fn payload_word<'a>(ptr: *mut Entry) -> &'a AtomicU64 {
    &*((ptr as *mut u8).add(mem::offset_of!(Entry, index_or_ptr)) as *const AtomicU64)
}

/// Atomic `fetch_or` on the payload word of a slot, preserving `cycle_flags`.
pub(crate) fn payload_fetch_or(ptr: *mut Entry, bits: u64) -> u64 {
    if use_native(ptr) {
        unsafe { payload_word(ptr) }.fetch_or(bits, Ordering::SeqCst)
    } else {
        let _guard = stripe_for(ptr)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut current = unsafe { ptr::read_unaligned(ptr) };
        let old = current.index_or_ptr;
        current.index_or_ptr = old | bits;
        unsafe { ptr::write_unaligned(ptr, current) };
        old
    }
}

/// Atomic exchange on the payload word of a slot, preserving `cycle_flags`.
pub(crate) fn payload_swap(ptr: *mut Entry, value: u64) -> u64 {
    if use_native(ptr) {
        unsafe { payload_word(ptr) }.swap(value, Ordering::SeqCst)
    } else {
        let _guard = stripe_for(ptr)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut current = unsafe { ptr::read_unaligned(ptr) };
        let old = current.index_or_ptr;
        current.index_or_ptr = value;
        unsafe { ptr::write_unaligned(ptr, current) };
        old
    }
}
