//! Shared storage core for the object pool: the shard array, the factory,
//! and the work-stealing logic. The thread-local tiers in `pool::mod` sit on
//! top of this.

use std::thread;

use crate::pool::shard::Shard;

pub(crate) type Factory<T> = Box<dyn Fn() -> *mut T + Send + Sync>;

pub(crate) struct PoolCore<T> {
    factory: Factory<T>,
    shards: Box<[Shard<T>]>,
}

impl<T> PoolCore<T> {
    pub(crate) fn new(factory: Factory<T>, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| Shard::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { factory, shards }
    }

    pub(crate) fn default_shard_count() -> usize {
        let base = thread::available_parallelism().map_or(1, usize::from);
        base * 2
    }

    pub(crate) fn current_shard_index(&self) -> usize {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        thread::current().id().hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Single-object path: local shard, then steal from peers, then factory.
    pub(crate) fn get_shared(&self) -> *mut T {
        let shard_index = self.current_shard_index();

        let mut one = [std::ptr::null_mut()];
        if self.shards[shard_index].get_batch(&mut one) == 1 {
            return one[0];
        }

        // The local shard is empty; opportunistically steal. This helps
        // under imbalanced workloads where some threads return more objects
        // than they consume.
        for n in 1..self.shards.len() {
            let other = (shard_index + n) % self.shards.len();
            if self.shards[other].try_steal_batch(&mut one) == 1 {
                return one[0];
            }
        }

        (self.factory)()
    }

    pub(crate) fn put_shared(&self, obj: *mut T) {
        if obj.is_null() {
            return;
        }
        self.shards[self.current_shard_index()].put_batch(&[obj]);
    }

    /// Batch path used to refill a thread-local cache: drain the local shard
    /// first, then top up from peers with try-lock steals. Does not consult
    /// the factory.
    pub(crate) fn get_shared_batch(&self, out: &mut [*mut T]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let shard_index = self.current_shard_index();
        let mut got = self.shards[shard_index].get_batch(out);
        if got == out.len() {
            return got;
        }

        for n in 1..self.shards.len() {
            let other = (shard_index + n) % self.shards.len();
            got += self.shards[other].try_steal_batch(&mut out[got..]);
            if got == out.len() {
                break;
            }
        }
        got
    }

    pub(crate) fn put_shared_batch(&self, items: &[*mut T]) {
        self.shards[self.current_shard_index()].put_batch(items);
    }

    /// Drain every shard and free the drained objects.
    pub(crate) fn clear_shared(&self) {
        for shard in self.shards.iter() {
            for obj in shard.drain() {
                unsafe { drop(Box::from_raw(obj)) };
            }
        }
    }

    pub(crate) fn size_approx(&self) -> usize {
        self.shards.iter().map(Shard::approx_size).sum()
    }

    #[cfg(test)]
    pub(crate) fn shards(&self) -> &[Shard<T>] {
        &self.shards
    }
}

impl<T> Drop for PoolCore<T> {
    fn drop(&mut self) {
        self.clear_shared();
    }
}
