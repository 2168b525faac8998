use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use lscq::{EbrManager, Lscq};

#[test]
fn enqueue_rejects_null() {
    let queue = Lscq::<u64>::new(256);
    assert!(!queue.enqueue(std::ptr::null_mut()));
}

#[test]
fn dequeue_on_empty_returns_null() {
    let queue = Lscq::<u64>::new(256);
    assert!(queue.dequeue().is_null());
}

#[test]
fn legacy_ebr_constructor_is_a_passthrough() {
    let ebr = EbrManager::new();
    let queue = Lscq::new_with_legacy_ebr(&ebr, 64);

    let mut value = 9u64;
    assert!(queue.enqueue(&mut value));
    assert_eq!(queue.dequeue(), &mut value as *mut u64);
    assert!(queue.dequeue().is_null());
}

// Node expansion across a tiny ring, with a partial drain and a refill in
// the middle. The second drain phase must come out in exact FIFO order, and
// at least one drained node must have been recycled into the pool.
#[test]
fn node_expansion_keeps_fifo_and_recycles_nodes() {
    let queue = Lscq::<u64>::new(16);

    let values: Vec<u64> = (0..150).collect();
    let ptr_of = |i: usize| &values[i] as *const u64 as *mut u64;

    for i in 0..100 {
        assert!(queue.enqueue(ptr_of(i)));
    }
    for i in 0..50 {
        assert_eq!(queue.dequeue(), ptr_of(i), "first drain, value {i}");
    }
    for i in 100..150 {
        assert!(queue.enqueue(ptr_of(i)));
    }
    for i in 50..150 {
        assert_eq!(queue.dequeue(), ptr_of(i), "second drain, value {i}");
    }
    assert!(queue.dequeue().is_null());

    assert!(
        queue.pool_size() >= 1,
        "drained nodes should be recycled through the pool"
    );
}

#[test]
fn mpmc_no_loss_no_duplication() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 5_000;
    const TOTAL: usize = THREADS * PER_THREAD;

    let queue = Lscq::<u64>::new(512);
    let values: Vec<u64> = (0..TOTAL as u64).collect();
    let consumed = AtomicUsize::new(0);
    let mut collected: Vec<Vec<usize>> = Vec::new();

    thread::scope(|s| {
        let queue = &queue;
        let consumed = &consumed;

        for t in 0..THREADS {
            let slice = &values[t * PER_THREAD..(t + 1) * PER_THREAD];
            s.spawn(move || {
                for v in slice {
                    let ptr = v as *const u64 as *mut u64;
                    while !queue.enqueue(ptr) {
                        thread::yield_now();
                    }
                }
            });
        }

        let mut consumers = Vec::new();
        for _ in 0..THREADS {
            consumers.push(s.spawn(move || {
                let mut got = Vec::new();
                while consumed.load(Ordering::Relaxed) < TOTAL {
                    let p = queue.dequeue();
                    if p.is_null() {
                        thread::yield_now();
                        continue;
                    }
                    consumed.fetch_add(1, Ordering::Relaxed);
                    got.push(p as usize);
                }
                got
            }));
        }

        collected = consumers.into_iter().map(|c| c.join().unwrap()).collect();
    });

    let mut distinct = HashSet::new();
    let mut count = 0;
    for got in &collected {
        for &addr in got {
            assert!(distinct.insert(addr), "pointer dequeued twice");
            count += 1;
        }
    }
    assert_eq!(count, TOTAL);
    assert!(queue.dequeue().is_null());
}

// Heavy concurrent enqueue traffic right up to destruction: workers observe
// clean `false` results once told to stop, and dropping the queue afterwards
// neither hangs nor crashes (node reclamation is exercised under ASan runs).
#[test]
fn destructor_after_concurrent_workload() {
    const THREADS: usize = 8;

    let queue = Box::new(Lscq::<u64>::new(64));
    let values: Vec<u64> = (0..4096).collect();
    let stop = AtomicBool::new(false);
    let next = AtomicUsize::new(0);

    thread::scope(|s| {
        let queue = &queue;
        let values = &values;
        let stop = &stop;
        let next = &next;

        for _ in 0..THREADS {
            s.spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let idx = next.fetch_add(1, Ordering::Relaxed) % values.len();
                    let ptr = &values[idx] as *const u64 as *mut u64;
                    let _ = queue.enqueue(ptr);
                }
            });
        }

        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Relaxed);
    });

    drop(queue);
}

#[test]
fn repeated_fill_drain_rounds_reuse_nodes() {
    const ROUNDS: usize = 10;
    const COUNT: usize = 1024;

    let values: Vec<u64> = (0..COUNT as u64).collect();

    for _ in 0..ROUNDS {
        let queue = Lscq::<u64>::new(16);

        for twice in 0..2 {
            for v in &values {
                assert!(queue.enqueue(v as *const u64 as *mut u64));
            }
            for v in &values {
                assert_eq!(queue.dequeue(), v as *const u64 as *mut u64);
            }
            assert!(queue.dequeue().is_null(), "round {twice}");
        }
    }
}
