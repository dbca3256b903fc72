use fiberio::{thread, Scheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < timeout, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn stop_from_helper(scheduler: &Scheduler) {
    let stopper = scheduler.clone();
    std::thread::spawn(move || stopper.stop()).join().unwrap();
}

#[test]
fn test_pinned_tasks_run_on_their_worker() {
    let scheduler = Scheduler::new(2, false, "affinity");
    scheduler.start().unwrap();

    let ids = scheduler.worker_ids();
    assert_eq!(ids.len(), 2);
    let target = ids[1];

    let executors = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicUsize::new(0));

    for affinity in [target, fiberio::ANY_WORKER, target] {
        let executors = Arc::clone(&executors);
        let done = Arc::clone(&done);
        scheduler.schedule_on(
            move || {
                executors.lock().unwrap().push((affinity, thread::gettid()));
                done.fetch_add(1, Ordering::SeqCst);
            },
            affinity,
        );
    }

    wait_until(|| done.load(Ordering::SeqCst) == 3, Duration::from_secs(5));
    stop_from_helper(&scheduler);

    let executors = executors.lock().unwrap();
    for &(affinity, ran_on) in executors.iter() {
        if affinity != fiberio::ANY_WORKER {
            assert_eq!(ran_on, target, "pinned task ran on the wrong worker");
        }
        assert!(ids.contains(&ran_on));
    }
}

#[test]
fn test_unpinned_tasks_preserve_fifo_order_on_one_worker() {
    let scheduler = Scheduler::new(1, false, "fifo");
    scheduler.start().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..10 {
        let order = Arc::clone(&order);
        scheduler.schedule(move || {
            order.lock().unwrap().push(i);
        });
    }

    wait_until(
        || order.lock().unwrap().len() == 10,
        Duration::from_secs(5),
    );
    stop_from_helper(&scheduler);

    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_pinned_order_preserved_per_worker() {
    let scheduler = Scheduler::new(2, false, "pinned_fifo");
    scheduler.start().unwrap();
    let target = scheduler.worker_ids()[0];

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..10 {
        let order = Arc::clone(&order);
        scheduler.schedule_on(
            move || {
                order.lock().unwrap().push(i);
            },
            target,
        );
    }

    wait_until(
        || order.lock().unwrap().len() == 10,
        Duration::from_secs(5),
    );
    stop_from_helper(&scheduler);

    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_caller_slot_drains_during_stop() {
    // One thread total, owned by the caller: nothing runs until stop.
    let scheduler = Scheduler::new(1, true, "caller_only");
    scheduler.start().unwrap();

    let caller_tid = thread::gettid();
    let ran_on = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..3 {
        let ran_on = Arc::clone(&ran_on);
        scheduler.schedule(move || {
            ran_on.lock().unwrap().push(thread::gettid());
        });
    }
    assert!(ran_on.lock().unwrap().is_empty());

    // use_caller stop must run on the caller thread and drains its slot.
    scheduler.stop();

    let ran_on = ran_on.lock().unwrap();
    assert_eq!(ran_on.len(), 3);
    assert!(ran_on.iter().all(|&tid| tid == caller_tid));
}

#[test]
fn test_worker_ids_lists_caller_first() {
    let scheduler = Scheduler::new(2, true, "mixed");
    scheduler.start().unwrap();

    let ids = scheduler.worker_ids();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], thread::gettid());
    assert_eq!(scheduler.worker_count(), 1);

    scheduler.stop();
}
