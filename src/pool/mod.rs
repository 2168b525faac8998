//! Object pool with a three-tier access path:
//!
//! - L1: per-thread fast slot (one object, a single atomic pointer)
//! - L2: per-thread batch array with an adaptively-sized fill level
//! - L3: shared sharded storage with try-lock work stealing ([`core`])
//!
//! Batch refills and flushes amortize the shard lock; an op-guard plus a
//! `closing` gate lets the destructor quiesce concurrent callers without a
//! global lock. Each thread owns at most one local cache, claimed by the
//! first pool that touches the thread; other pools sharing that thread fall
//! back to the shared tiers.

mod core;
mod shard;

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use self::core::{Factory, PoolCore};

// Batch tier sizing: the array is fixed, the fill level adapts within
// [BATCH_MIN, BATCH_CAPACITY] on the recent hit ratio.
const BATCH_CAPACITY: usize = 16;
const BATCH_DEFAULT: usize = 8;
const BATCH_MIN: usize = 4;
const ADAPTIVE_CHECK_INTERVAL: usize = 64;

const CLEAR_ACTIVE_OPS_TIMEOUT: Duration = Duration::from_millis(200);
const CLOSE_ACTIVE_OPS_TIMEOUT: Duration = Duration::from_millis(500);

// Per-thread cache record. Type-erased (slots hold `*mut u8`) so one
// non-generic `thread_local!` serves every pool instantiation; the `owner`
// gate guarantees the erased pointers always belong to the claiming pool's
// object type.
//
// `owner` holds a raw `Arc<PoolInner<T>>` reference (one strong count), so
// the pool state outlives the cache no matter when this thread exits; the
// single swap-to-null in either the thread-exit or the pool-close path
// decides who releases that count.
struct LocalCache {
    owner: AtomicPtr<()>,
    fast_slot: AtomicPtr<u8>,
    batch: [AtomicPtr<u8>; BATCH_CAPACITY],
    batch_count: AtomicUsize,
    effective_batch: AtomicUsize,
    hits: AtomicUsize,
    misses: AtomicUsize,
    ops: AtomicUsize,
    // Monomorphized thread-exit drain for the owning pool. Written and read
    // only by the cache's own thread.
    drain_fn: Cell<Option<unsafe fn(*const (), *const LocalCache)>>,
}

impl LocalCache {
    fn new() -> Self {
        Self {
            owner: AtomicPtr::new(ptr::null_mut()),
            fast_slot: AtomicPtr::new(ptr::null_mut()),
            batch: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            batch_count: AtomicUsize::new(0),
            effective_batch: AtomicUsize::new(BATCH_DEFAULT),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            ops: AtomicUsize::new(0),
            drain_fn: Cell::new(None),
        }
    }

    fn effective_batch_size(&self) -> usize {
        self.effective_batch
            .load(Ordering::Relaxed)
            .clamp(BATCH_MIN, BATCH_CAPACITY)
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        let ops = self.ops.fetch_add(1, Ordering::Relaxed) + 1;
        if ops < ADAPTIVE_CHECK_INTERVAL {
            return;
        }
        self.ops.store(0, Ordering::Relaxed);

        let hits = self.hits.swap(0, Ordering::Relaxed);
        let misses = self.misses.swap(0, Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return;
        }

        let current = self.effective_batch.load(Ordering::Relaxed);
        if hits * 4 >= total * 3 && current < BATCH_CAPACITY {
            self.effective_batch.store(current + 1, Ordering::Relaxed);
        } else if hits * 4 <= total && current > BATCH_MIN {
            self.effective_batch.store(current - 1, Ordering::Relaxed);
        }
    }

    fn try_pop_batch(&self) -> *mut u8 {
        let mut count = self.batch_count.load(Ordering::Acquire).min(BATCH_CAPACITY);
        while count > 0 {
            match self.batch_count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let p = self.batch[count - 1].swap(ptr::null_mut(), Ordering::AcqRel);
                    if !p.is_null() {
                        return p;
                    }
                    count = self.batch_count.load(Ordering::Acquire).min(BATCH_CAPACITY);
                }
                Err(observed) => count = observed.min(BATCH_CAPACITY),
            }
        }

        // The count can go stale against a concurrent clear; sweep the slots
        // once before reporting the batch empty.
        for slot in &self.batch {
            let p = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                return p;
            }
        }
        self.batch_count.store(0, Ordering::Release);
        ptr::null_mut()
    }

    fn try_push_batch(&self, obj: *mut u8) -> bool {
        let limit = self.effective_batch_size();
        if self.batch_count.load(Ordering::Relaxed) >= limit {
            return false;
        }
        for slot in self.batch.iter().take(limit) {
            if slot
                .compare_exchange(ptr::null_mut(), obj, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let prev = self.batch_count.fetch_add(1, Ordering::AcqRel);
                if prev >= BATCH_CAPACITY {
                    self.batch_count.store(BATCH_CAPACITY, Ordering::Release);
                }
                return true;
            }
        }
        false
    }

    fn drain_batch(&self, out: &mut [*mut u8]) -> usize {
        let mut count = 0;
        for slot in &self.batch {
            if count == out.len() {
                break;
            }
            let p = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                out[count] = p;
                count += 1;
            }
        }
        self.batch_count.store(0, Ordering::Release);
        count
    }
}

struct TlsCacheHolder {
    cache: Box<LocalCache>,
}

impl Drop for TlsCacheHolder {
    fn drop(&mut self) {
        // Whoever swaps the owner out (this thread or a closing pool) is
        // responsible for releasing the Arc count it carries.
        let owner = self.cache.owner.swap(ptr::null_mut(), Ordering::AcqRel);
        if owner.is_null() {
            return;
        }
        if let Some(drain) = self.cache.drain_fn.get() {
            unsafe { drain(owner, &*self.cache) };
        }
    }
}

thread_local! {
    static TLS_CACHE: TlsCacheHolder = TlsCacheHolder {
        cache: Box::new(LocalCache::new()),
    };
}

// Runs `f` against this thread's cache; None during thread teardown.
fn with_local<R>(f: impl FnOnce(&LocalCache) -> R) -> Option<R> {
    TLS_CACHE.try_with(|holder| f(&holder.cache)).ok()
}

// Consumes the strong count the cache held on its owning pool.
unsafe fn on_thread_exit_raw<T>(inner: *const (), cache: *const LocalCache) {
    let inner = Arc::from_raw(inner as *const PoolInner<T>);
    inner.on_thread_exit(&*cache);
}

// Shared pool state. Lives behind an `Arc` so its address is a stable
// identity even when the owning `ObjectPool` handle is moved, and so
// thread-exit drains stay valid after the handle is dropped.
struct PoolInner<T> {
    core: PoolCore<T>,
    registry: Mutex<Vec<*const LocalCache>>,
    closing: AtomicBool,
    active_ops: AtomicIsize,
}

unsafe impl<T: Send> Send for PoolInner<T> {}
unsafe impl<T: Send> Sync for PoolInner<T> {}

struct OpGuard<'a, T> {
    inner: &'a PoolInner<T>,
    active: bool,
}

impl<'a, T> OpGuard<'a, T> {
    fn enter(handle: &'a Arc<PoolInner<T>>) -> Self {
        let inner: &'a PoolInner<T> = handle;
        if inner.closing.load(Ordering::Acquire) {
            return Self {
                inner,
                active: false,
            };
        }
        inner.active_ops.fetch_add(1, Ordering::AcqRel);
        if inner.closing.load(Ordering::Acquire) {
            inner.active_ops.fetch_sub(1, Ordering::AcqRel);
            return Self {
                inner,
                active: false,
            };
        }
        Self {
            inner,
            active: true,
        }
    }

    fn active(&self) -> bool {
        self.active
    }
}

impl<T> Drop for OpGuard<'_, T> {
    fn drop(&mut self) {
        if self.active {
            self.inner.active_ops.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl<T> PoolInner<T> {
    #[inline]
    fn identity(self: &Arc<Self>) -> *mut () {
        Arc::as_ptr(self) as *mut ()
    }

    fn ensure_registered(self: &Arc<Self>, cache: &LocalCache) {
        if cache.owner.load(Ordering::Acquire) == self.identity() {
            return;
        }

        // Claiming hands the cache one strong count on the pool state.
        let raw = Arc::into_raw(Arc::clone(self)) as *mut ();
        if cache
            .owner
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Claimed by another pool; this thread uses the shared tiers.
            unsafe { drop(Arc::from_raw(raw as *const Self)) };
            return;
        }

        cache.drain_fn.set(Some(on_thread_exit_raw::<T>));
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cache as *const LocalCache);
    }

    fn unregister(&self, cache: *const LocalCache) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|&c| c != cache);
    }

    // Thread-exit path: hand the cache contents back to the shared tiers (or
    // free them when the pool is closing) and drop the registration. The
    // caller already swapped `owner` to null.
    fn on_thread_exit(&self, cache: &LocalCache) {
        self.active_ops.fetch_add(1, Ordering::AcqRel);

        let mut erased = [ptr::null_mut::<u8>(); BATCH_CAPACITY + 1];
        let mut count = 0;
        let p = cache.fast_slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if !p.is_null() {
            erased[count] = p;
            count += 1;
        }
        count += cache.drain_batch(&mut erased[count..]);

        if count > 0 {
            if !self.closing.load(Ordering::Acquire) {
                let mut items = [ptr::null_mut::<T>(); BATCH_CAPACITY + 1];
                for i in 0..count {
                    items[i] = erased[i] as *mut T;
                }
                self.core.put_shared_batch(&items[..count]);
            } else {
                for &p in erased.iter().take(count) {
                    unsafe { drop(Box::from_raw(p as *mut T)) };
                }
            }
        }

        self.unregister(cache as *const LocalCache);
        self.active_ops.fetch_sub(1, Ordering::AcqRel);
    }

    // Delete everything in one registered cache (registry lock held by the
    // caller).
    unsafe fn drain_cache_deleting(self: &Arc<Self>, cache: &LocalCache) {
        if cache.owner.load(Ordering::Acquire) != self.identity() {
            return;
        }
        let p = cache.fast_slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if !p.is_null() {
            drop(Box::from_raw(p as *mut T));
        }
        for slot in &cache.batch {
            let p = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                drop(Box::from_raw(p as *mut T));
            }
        }
        cache.batch_count.store(0, Ordering::Release);
    }

    fn wait_for_active_ops_at_most(&self, threshold: isize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.active_ops.load(Ordering::Acquire) <= threshold {
                return true;
            }
            std::thread::yield_now();
        }
        self.active_ops.load(Ordering::Acquire) <= threshold
    }

    fn close_and_clear(self: &Arc<Self>) {
        self.closing.store(true, Ordering::Release);
        // Bounded wait; a runaway caller cannot hang destruction forever.
        let _ = self.wait_for_active_ops_at_most(0, CLOSE_ACTIVE_OPS_TIMEOUT);

        {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            for &cache in registry.iter() {
                let cache = unsafe { &*cache };
                // Winning the CAS releases the cache's claim (and the
                // strong count it carried); the thread-exit path then sees
                // null and skips its drain.
                if cache
                    .owner
                    .compare_exchange(
                        self.identity(),
                        ptr::null_mut(),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    unsafe {
                        drop(Arc::from_raw(Arc::as_ptr(self)));
                        self.drain_cache_closing(cache);
                    }
                }
            }
            registry.clear();
        }

        self.core.clear_shared();
    }

    // Like drain_cache_deleting but without the owner check (the caller just
    // swapped the owner out).
    unsafe fn drain_cache_closing(&self, cache: &LocalCache) {
        let p = cache.fast_slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if !p.is_null() {
            drop(Box::from_raw(p as *mut T));
        }
        for slot in &cache.batch {
            let p = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                drop(Box::from_raw(p as *mut T));
            }
        }
        cache.batch_count.store(0, Ordering::Release);
    }
}

/// Thread-safe object pool recycling heap objects through `get`/`put`.
///
/// Ownership model:
/// - the factory must hand out `Box::into_raw` allocations (or null on
///   failure);
/// - `get` transfers ownership of the returned object to the caller;
/// - after `put(obj)` the caller must not touch `obj` again;
/// - objects still inside the pool are freed by `clear` or on drop.
pub struct ObjectPool<T> {
    inner: Arc<PoolInner<T>>,
}

unsafe impl<T: Send> Send for ObjectPool<T> {}
unsafe impl<T: Send> Sync for ObjectPool<T> {}

impl<T> ObjectPool<T> {
    /// Create a pool with the default shard count
    /// (`2 × available_parallelism`).
    pub fn new(factory: impl Fn() -> *mut T + Send + Sync + 'static) -> Self {
        Self::with_shards(factory, PoolCore::<T>::default_shard_count())
    }

    /// Create a pool with an explicit shard count (0 is treated as 1).
    pub fn with_shards(
        factory: impl Fn() -> *mut T + Send + Sync + 'static,
        shard_count: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                core: PoolCore::new(Box::new(factory) as Factory<T>, shard_count),
                registry: Mutex::new(Vec::new()),
                closing: AtomicBool::new(false),
                active_ops: AtomicIsize::new(0),
            }),
        }
    }

    /// Get an object: local tiers first, then the shared shards, then the
    /// factory. Returns null when the pool is closing (or the factory fails).
    pub fn get(&self) -> *mut T {
        let inner = &self.inner;
        let guard = OpGuard::enter(inner);
        if !guard.active() {
            return ptr::null_mut();
        }

        let cached = with_local(|cache| {
            inner.ensure_registered(cache);
            if cache.owner.load(Ordering::Acquire) != inner.identity() {
                return None;
            }

            if !cache.fast_slot.load(Ordering::Relaxed).is_null() {
                let p = cache.fast_slot.swap(ptr::null_mut(), Ordering::AcqRel);
                if !p.is_null() {
                    cache.record(true);
                    return Some(p as *mut T);
                }
            }

            let p = cache.try_pop_batch();
            if !p.is_null() {
                cache.record(true);
                return Some(p as *mut T);
            }

            // Refill the batch from the shared tiers; the last object of the
            // refill is the one handed out.
            let target = cache.effective_batch_size();
            let mut batch = [ptr::null_mut::<T>(); BATCH_CAPACITY];
            let got = inner.core.get_shared_batch(&mut batch[..target]);
            cache.record(false);
            if got > 0 {
                let result = batch[got - 1];
                let cached_count = got - 1;
                for (i, slot) in cache.batch.iter().enumerate() {
                    let p = if i < cached_count {
                        batch[i] as *mut u8
                    } else {
                        ptr::null_mut()
                    };
                    slot.store(p, Ordering::Release);
                }
                cache.batch_count.store(cached_count, Ordering::Release);
                return Some(result);
            }
            None
        })
        .flatten();

        match cached {
            Some(p) => p,
            None => inner.core.get_shared(),
        }
    }

    /// Return an object to the pool. Null is ignored; when the pool is
    /// closing the object is freed instead of stored.
    pub fn put(&self, obj: *mut T) {
        if obj.is_null() {
            return;
        }

        let inner = &self.inner;
        let guard = OpGuard::enter(inner);
        if !guard.active() {
            unsafe { drop(Box::from_raw(obj)) };
            return;
        }

        let stored = with_local(|cache| {
            inner.ensure_registered(cache);
            if cache.owner.load(Ordering::Acquire) != inner.identity() {
                return false;
            }

            if cache
                .fast_slot
                .compare_exchange(
                    ptr::null_mut(),
                    obj as *mut u8,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                cache.record(true);
                return true;
            }

            if cache.try_push_batch(obj as *mut u8) {
                cache.record(true);
                return true;
            }

            // Batch full: flush it, together with the new object, to the
            // local shard in one locked operation.
            cache.record(false);
            let mut erased = [ptr::null_mut::<u8>(); BATCH_CAPACITY + 1];
            let count = cache.drain_batch(&mut erased[..BATCH_CAPACITY]);
            erased[count] = obj as *mut u8;
            let mut items = [ptr::null_mut::<T>(); BATCH_CAPACITY + 1];
            for i in 0..=count {
                items[i] = erased[i] as *mut T;
            }
            inner.core.put_shared_batch(&items[..=count]);
            true
        })
        .unwrap_or(false);

        if !stored {
            inner.core.put_shared(obj);
        }
    }

    /// Free every pooled object, draining registered thread caches first.
    /// Safe to call concurrently with `get`/`put`.
    pub fn clear(&self) {
        let inner = &self.inner;
        let guard = OpGuard::enter(inner);
        if !guard.active() {
            return;
        }

        {
            let registry = inner.registry.lock().unwrap_or_else(PoisonError::into_inner);
            for &cache in registry.iter() {
                unsafe { inner.drain_cache_deleting(&*cache) };
            }
        }

        // Our own guard keeps active_ops at one.
        inner.wait_for_active_ops_at_most(1, CLEAR_ACTIVE_OPS_TIMEOUT);
        inner.core.clear_shared();
    }

    /// Approximate number of pooled objects (shards plus thread caches).
    pub fn size(&self) -> usize {
        let inner = &self.inner;
        let mut total = inner.core.size_approx();
        let registry = inner.registry.lock().unwrap_or_else(PoisonError::into_inner);
        for &cache in registry.iter() {
            let cache = unsafe { &*cache };
            if cache.owner.load(Ordering::Acquire) != inner.identity() {
                continue;
            }
            if !cache.fast_slot.load(Ordering::Relaxed).is_null() {
                total += 1;
            }
            for slot in &cache.batch {
                if !slot.load(Ordering::Relaxed).is_null() {
                    total += 1;
                }
            }
        }
        total
    }
}

impl<T> Drop for ObjectPool<T> {
    fn drop(&mut self) {
        self.inner.close_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Tracked {
        _v: u64,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn tracked_pool(shards: usize) -> (Arc<AtomicUsize>, Arc<AtomicUsize>, ObjectPool<Tracked>) {
        let makes = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        let m = makes.clone();
        let d = drops.clone();
        let pool = ObjectPool::with_shards(
            move || {
                m.fetch_add(1, Ordering::Relaxed);
                Box::into_raw(Box::new(Tracked {
                    _v: 0,
                    drops: d.clone(),
                }))
            },
            shards,
        );
        (makes, drops, pool)
    }

    #[test]
    fn get_put_get_returns_the_same_object() {
        let (makes, _drops, pool) = tracked_pool(2);
        let p = pool.get();
        assert!(!p.is_null());
        assert_eq!(makes.load(Ordering::Relaxed), 1);

        pool.put(p);
        let q = pool.get();
        assert_eq!(q, p, "fast slot should hand back the cached object");
        assert_eq!(makes.load(Ordering::Relaxed), 1);
        pool.put(q);
    }

    #[test]
    fn steals_from_peer_shards_before_calling_the_factory() {
        let (makes, drops, pool) = tracked_pool(4);
        let local = pool.inner.core.current_shard_index();
        let peer = (local + 1) % 4;

        // Seed a peer shard directly; the local shard stays empty.
        let obj = Box::into_raw(Box::new(Tracked {
            _v: 7,
            drops: drops.clone(),
        }));
        pool.inner.core.shards()[peer].put_batch(&[obj]);

        let got = pool.get();
        assert_eq!(got, obj, "get should steal the peer shard's object");
        assert_eq!(makes.load(Ordering::Relaxed), 0);
        pool.put(got);
    }

    #[test]
    fn locked_peer_shard_falls_back_to_the_factory() {
        let (makes, drops, pool) = tracked_pool(4);
        let local = pool.inner.core.current_shard_index();
        let peer = (local + 1) % 4;

        let obj = Box::into_raw(Box::new(Tracked {
            _v: 8,
            drops: drops.clone(),
        }));
        pool.inner.core.shards()[peer].put_batch(&[obj]);

        // Holding the peer's mutex defeats the try-lock steal.
        let peer_guard = pool.inner.core.shards()[peer].lock_for_test();
        let got = pool.get();
        assert_ne!(got, obj);
        assert_eq!(makes.load(Ordering::Relaxed), 1);
        drop(peer_guard);

        pool.put(got);
    }

    #[test]
    fn clear_frees_everything_and_size_reaches_zero() {
        let (makes, drops, pool) = tracked_pool(2);
        let mut held = Vec::new();
        for _ in 0..20 {
            held.push(pool.get());
        }
        for p in held {
            pool.put(p);
        }
        assert!(pool.size() > 0);

        pool.clear();
        assert_eq!(pool.size(), 0);
        assert_eq!(makes.load(Ordering::Relaxed), drops.load(Ordering::Relaxed));

        // The pool still works after a clear.
        let p = pool.get();
        assert!(!p.is_null());
        pool.put(p);
    }

    #[test]
    fn drop_frees_pooled_objects() {
        let (makes, drops, pool) = tracked_pool(2);
        for _ in 0..8 {
            let p = pool.get();
            pool.put(p);
        }
        drop(pool);
        assert_eq!(makes.load(Ordering::Relaxed), drops.load(Ordering::Relaxed));
    }
}
