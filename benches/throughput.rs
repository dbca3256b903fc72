//! Scheduler throughput benchmark using criterion.
//!
//! Fans a batch of callbacks through the worker pool and waits for the last
//! one, measuring end-to-end dispatch cost per batch.

use criterion::{criterion_group, criterion_main, Criterion};
use fiberio::Scheduler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const BATCH: usize = 1_000;

fn bench_callback_fanout(c: &mut Criterion) {
    let scheduler = Scheduler::new(4, false, "bench");
    scheduler.start().unwrap();

    c.bench_function("schedule_1000_callbacks", |b| {
        b.iter(|| {
            let done = Arc::new(AtomicUsize::new(0));
            for _ in 0..BATCH {
                let done = Arc::clone(&done);
                scheduler.schedule(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                });
            }
            while done.load(Ordering::SeqCst) < BATCH {
                std::hint::spin_loop();
            }
        });
    });

    let stopper = scheduler.clone();
    std::thread::spawn(move || stopper.stop()).join().unwrap();
}

criterion_group!(benches, bench_callback_fanout);
criterion_main!(benches);
