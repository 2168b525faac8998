//! One shard of the shared pool storage: a mutex-protected free list plus an
//! approximate size counter readable without the lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

pub(crate) struct Shard<T> {
    objects: Mutex<Vec<*mut T>>,
    approx_size: AtomicUsize,
}

unsafe impl<T: Send> Send for Shard<T> {}
unsafe impl<T: Send> Sync for Shard<T> {}

impl<T> Shard<T> {
    pub(crate) fn new() -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
            approx_size: AtomicUsize::new(0),
        }
    }

    /// Pop up to `out.len()` objects under the shard lock.
    pub(crate) fn get_batch(&self, out: &mut [*mut T]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let count = out.len().min(objects.len());
        for slot in out.iter_mut().take(count) {
            *slot = objects.pop().expect("counted above");
        }
        if count > 0 {
            self.approx_size.fetch_sub(count, Ordering::Relaxed);
        }
        count
    }

    /// Store a batch, skipping null entries. Returns the number stored.
    pub(crate) fn put_batch(&self, items: &[*mut T]) -> usize {
        if items.is_empty() {
            return 0;
        }
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects.reserve(items.len());
        let mut stored = 0;
        for &obj in items {
            if obj.is_null() {
                continue;
            }
            objects.push(obj);
            stored += 1;
        }
        if stored > 0 {
            self.approx_size.fetch_add(stored, Ordering::Relaxed);
        }
        stored
    }

    /// Like [`Shard::get_batch`] but gives up immediately when the shard lock
    /// is contended; used when stealing from peer shards.
    pub(crate) fn try_steal_batch(&self, out: &mut [*mut T]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let Ok(mut objects) = self.objects.try_lock() else {
            return 0;
        };
        let count = out.len().min(objects.len());
        for slot in out.iter_mut().take(count) {
            *slot = objects.pop().expect("counted above");
        }
        if count > 0 {
            self.approx_size.fetch_sub(count, Ordering::Relaxed);
        }
        count
    }

    /// Drain every stored object; the caller takes ownership (and usually
    /// frees them).
    pub(crate) fn drain(&self) -> Vec<*mut T> {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        self.approx_size.store(0, Ordering::Relaxed);
        std::mem::take(&mut *objects)
    }

    pub(crate) fn approx_size(&self) -> usize {
        self.approx_size.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn lock_for_test(&self) -> std::sync::MutexGuard<'_, Vec<*mut T>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
