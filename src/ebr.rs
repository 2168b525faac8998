//! Epoch-based reclamation, kept for the legacy
//! [`Lscq::new_with_legacy_ebr`](crate::Lscq::new_with_legacy_ebr)
//! constructor and for comparison. The shipped LSCQ recycles nodes through
//! the object pool instead.
//!
//! Three-generation scheme: a pointer retired in epoch `e` lands in bucket
//! `e % 3` and is freed once the global epoch has advanced two past `e`,
//! which requires every active thread to have observed the newer epochs.

use std::cell::Cell;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crossbeam_utils::CachePadded;

const NUM_GENERATIONS: usize = 3;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

struct RetiredNode {
    ptr: *mut u8,
    deleter: Box<dyn FnOnce(*mut u8) + Send>,
    epoch: u64,
}

unsafe impl Send for RetiredNode {}

struct ThreadState {
    epoch: AtomicU64,
    active: AtomicBool,
}

thread_local! {
    // (manager id, state). The id check keeps a stale record from one
    // manager from being dereferenced against another.
    static TLS_EBR: Cell<(u64, *const ThreadState)> = const { Cell::new((0, std::ptr::null())) };
}

/// Epoch-based reclamation manager (legacy).
///
/// Threads bracket access to protected structures with
/// [`enter_critical`](EbrManager::enter_critical) /
/// [`exit_critical`](EbrManager::exit_critical), or an [`EpochGuard`].
/// Retired pointers are freed by [`try_reclaim`](EbrManager::try_reclaim)
/// once no active thread can still hold them, or at manager drop.
pub struct EbrManager {
    id: u64,
    global_epoch: CachePadded<AtomicU64>,
    retired: Mutex<[Vec<RetiredNode>; NUM_GENERATIONS]>,
    thread_states: Mutex<Vec<Box<ThreadState>>>,
}

unsafe impl Send for EbrManager {}
unsafe impl Sync for EbrManager {}

impl Default for EbrManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EbrManager {
    pub fn new() -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            global_epoch: CachePadded::new(AtomicU64::new(0)),
            retired: Mutex::new([Vec::new(), Vec::new(), Vec::new()]),
            thread_states: Mutex::new(Vec::new()),
        }
    }

    fn state_for_current_thread(&self) -> *const ThreadState {
        let (id, state) = TLS_EBR.with(Cell::get);
        if id == self.id && !state.is_null() {
            return state;
        }

        let boxed = Box::new(ThreadState {
            epoch: AtomicU64::new(0),
            active: AtomicBool::new(false),
        });
        let raw = &*boxed as *const ThreadState;
        self.thread_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(boxed);
        TLS_EBR.with(|cell| cell.set((self.id, raw)));
        raw
    }

    /// Announce this thread as active inside an EBR-protected region.
    pub fn enter_critical(&self) {
        let state = unsafe { &*self.state_for_current_thread() };
        state
            .epoch
            .store(self.global_epoch.load(Ordering::Acquire), Ordering::Relaxed);
        state.active.store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    /// Leave the EBR-protected region entered by
    /// [`enter_critical`](EbrManager::enter_critical).
    pub fn exit_critical(&self) {
        let state = unsafe { &*self.state_for_current_thread() };
        fence(Ordering::SeqCst);
        state.active.store(false, Ordering::Relaxed);
    }

    /// Retire a pointer with an explicit deleter, run once reclamation is
    /// safe.
    ///
    /// # Safety
    /// `ptr` must be valid for the deleter and must not be retired twice.
    pub unsafe fn retire_with(&self, ptr: *mut u8, deleter: Box<dyn FnOnce(*mut u8) + Send>) {
        if ptr.is_null() {
            return;
        }
        let epoch = self.global_epoch.load(Ordering::Acquire);
        let gen_idx = (epoch % NUM_GENERATIONS as u64) as usize;
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)[gen_idx]
            .push(RetiredNode {
                ptr,
                deleter,
                epoch,
            });
    }

    /// Retire a `Box`-allocated pointer, freed with its real type.
    ///
    /// # Safety
    /// `ptr` must come from `Box::into_raw` and must not be retired twice.
    pub unsafe fn retire<T: Send + 'static>(&self, ptr: *mut T) {
        unsafe {
            self.retire_with(
                ptr as *mut u8,
                Box::new(|p| drop(Box::from_raw(p as *mut T))),
            );
        }
    }

    /// Advance the epoch if every active thread has observed it, then free
    /// whatever became unreachable. Returns the number of pointers freed.
    pub fn try_reclaim(&self) -> usize {
        if self.can_advance_epoch() {
            self.global_epoch.fetch_add(1, Ordering::Release);
        }

        let current = self.global_epoch.load(Ordering::Acquire);
        if current < 2 {
            return 0;
        }
        let safe_epoch = current - 2;

        let mut to_delete = Vec::new();
        {
            let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
            for generation in retired.iter_mut() {
                let mut i = 0;
                while i < generation.len() {
                    if generation[i].epoch <= safe_epoch {
                        to_delete.push(generation.swap_remove(i));
                    } else {
                        i += 1;
                    }
                }
            }
        }

        let reclaimed = to_delete.len();
        for node in to_delete {
            (node.deleter)(node.ptr);
        }
        reclaimed
    }

    pub fn current_epoch(&self) -> u64 {
        self.global_epoch.load(Ordering::Acquire)
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    pub fn pending_count(&self) -> usize {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(Vec::len)
            .sum()
    }

    fn can_advance_epoch(&self) -> bool {
        let current = self.global_epoch.load(Ordering::Acquire);
        let states = self
            .thread_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        states.iter().all(|state| {
            !state.active.load(Ordering::Relaxed) || state.epoch.load(Ordering::Relaxed) >= current
        })
    }
}

impl Drop for EbrManager {
    fn drop(&mut self) {
        let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        for generation in retired.iter_mut() {
            for node in generation.drain(..) {
                (node.deleter)(node.ptr);
            }
        }
    }
}

/// RAII bracket around [`EbrManager::enter_critical`] /
/// [`EbrManager::exit_critical`].
pub struct EpochGuard<'a> {
    ebr: &'a EbrManager,
}

impl<'a> EpochGuard<'a> {
    pub fn new(ebr: &'a EbrManager) -> Self {
        ebr.enter_critical();
        Self { ebr }
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.ebr.exit_critical();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn retire_and_reclaim_frees_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));

        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let ebr = EbrManager::new();
        unsafe { ebr.retire(Box::into_raw(Box::new(Tracked(drops.clone())))) };
        assert!(ebr.has_pending());
        assert_eq!(ebr.pending_count(), 1);

        // No thread is active, so three reclaim calls advance the epoch far
        // enough to free the retirement.
        let mut reclaimed = 0;
        for _ in 0..4 {
            reclaimed += ebr.try_reclaim();
        }
        assert_eq!(reclaimed, 1);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert!(!ebr.has_pending());
    }

    #[test]
    fn active_reader_blocks_epoch_advance() {
        let ebr = EbrManager::new();

        ebr.enter_critical();
        let before = ebr.current_epoch();
        // The reader observed `before`; one advance is allowed, further ones
        // stall until it exits.
        ebr.try_reclaim();
        ebr.try_reclaim();
        let stalled = ebr.current_epoch();
        assert!(stalled <= before + 1);
        ebr.exit_critical();

        ebr.try_reclaim();
        assert!(ebr.current_epoch() > stalled);
    }

    #[test]
    fn drop_frees_pending_retirements() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let ebr = EbrManager::new();
            let d = drops.clone();
            unsafe {
                ebr.retire_with(
                    Box::into_raw(Box::new(7u64)) as *mut u8,
                    Box::new(move |p| {
                        d.fetch_add(1, Ordering::Relaxed);
                        drop(Box::from_raw(p as *mut u64));
                    }),
                );
            }
        }
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
