use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use lscq::{Lscq, MsQueue, MutexQueue, Scq, Scqp};

const RING_SIZE: usize = 65536;
const ITEMS_PER_PRODUCER: usize = 10_000;
const TOPOLOGIES: &[(usize, usize)] = &[(1, 1), (2, 2), (4, 4)];

// Uniform adapter so one driver covers every queue in the family.
trait BenchQueue: Send + Sync + 'static {
    fn bench_push(&self, item: u64) -> bool;
    fn bench_pop(&self) -> Option<u64>;
}

impl BenchQueue for Scq<u64> {
    fn bench_push(&self, item: u64) -> bool {
        self.enqueue(item)
    }

    fn bench_pop(&self) -> Option<u64> {
        match self.dequeue() {
            u64::MAX => None,
            v => Some(v),
        }
    }
}

// Pointer queues carry boxed payloads so every element is a distinct heap
// object, matching how LSCQ is used in practice.
impl BenchQueue for Scqp<u64> {
    fn bench_push(&self, item: u64) -> bool {
        let ptr = Box::into_raw(Box::new(item));
        if self.enqueue(ptr) {
            true
        } else {
            unsafe { drop(Box::from_raw(ptr)) };
            false
        }
    }

    fn bench_pop(&self) -> Option<u64> {
        let ptr = self.dequeue();
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { *Box::from_raw(ptr) })
        }
    }
}

impl BenchQueue for Lscq<u64> {
    fn bench_push(&self, item: u64) -> bool {
        let ptr = Box::into_raw(Box::new(item));
        if self.enqueue(ptr) {
            true
        } else {
            unsafe { drop(Box::from_raw(ptr)) };
            false
        }
    }

    fn bench_pop(&self) -> Option<u64> {
        let ptr = self.dequeue();
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { *Box::from_raw(ptr) })
        }
    }
}

impl BenchQueue for MsQueue<u64> {
    fn bench_push(&self, item: u64) -> bool {
        self.enqueue(item)
    }

    fn bench_pop(&self) -> Option<u64> {
        let mut out = 0;
        self.dequeue(&mut out).then_some(out)
    }
}

impl BenchQueue for MutexQueue<u64> {
    fn bench_push(&self, item: u64) -> bool {
        self.enqueue(item)
    }

    fn bench_pop(&self) -> Option<u64> {
        let mut out = 0;
        self.dequeue(&mut out).then_some(out)
    }
}

fn run_mpmc<Q: BenchQueue>(queue: Arc<Q>, producers: usize, consumers: usize) {
    let total = producers * ITEMS_PER_PRODUCER;
    let barrier = Arc::new(Barrier::new(producers + consumers));
    let consumed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::with_capacity(producers + consumers);

    for p in 0..producers {
        let queue = queue.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..ITEMS_PER_PRODUCER {
                let value = (p * ITEMS_PER_PRODUCER + i) as u64;
                while !queue.bench_push(value) {
                    std::hint::spin_loop();
                }
            }
        }));
    }

    for _ in 0..consumers {
        let queue = queue.clone();
        let barrier = barrier.clone();
        let consumed = consumed.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            while consumed.load(Ordering::Relaxed) < total {
                if queue.bench_pop().is_some() {
                    consumed.fetch_add(1, Ordering::Relaxed);
                } else {
                    std::hint::spin_loop();
                }
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
}

fn bench_queue<Q: BenchQueue>(c: &mut Criterion, name: &str, make: impl Fn() -> Q) {
    let mut group = c.benchmark_group(name);
    group.sample_size(10);

    for &(producers, consumers) in TOPOLOGIES {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{producers}p{consumers}c")),
            &(producers, consumers),
            |b, &(producers, consumers)| {
                b.iter(|| run_mpmc(Arc::new(make()), producers, consumers));
            },
        );
    }
    group.finish();
}

fn mpmc_benches(c: &mut Criterion) {
    // SCQ values must stay below the ring's bottom marker, so give it a ring
    // large enough for the value range.
    bench_queue(c, "scq", || Scq::<u64>::new(RING_SIZE));
    bench_queue(c, "scqp", || Scqp::<u64>::new(RING_SIZE));
    bench_queue(c, "scqp_fallback", || {
        Scqp::<u64>::with_mode(RING_SIZE, true)
    });
    bench_queue(c, "lscq", || Lscq::<u64>::new(1024));
    bench_queue(c, "msqueue", MsQueue::<u64>::new);
    bench_queue(c, "mutex_queue", MutexQueue::<u64>::new);
}

criterion_group!(benches, mpmc_benches);
criterion_main!(benches);
