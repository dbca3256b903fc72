use fiberio::IoManager;
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

fn stop_from_helper(io: &IoManager) {
    let stopper = io.clone();
    std::thread::spawn(move || stopper.stop()).join().unwrap();
}

#[test]
fn test_timers_fire_in_deadline_order() {
    // A single worker serializes the callbacks, so recording order is fire
    // order.
    let io = IoManager::new(1, false, "timer_order").unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for ms in [30u64, 10, 20] {
        let order = Arc::clone(&order);
        io.add_timer(
            ms,
            move || {
                order.lock().unwrap().push(ms);
            },
            false,
        );
    }
    // Inserted last with the nearest deadline: must still fire first.
    let order2 = Arc::clone(&order);
    io.add_timer(
        5,
        move || {
            order2.lock().unwrap().push(5);
        },
        false,
    );

    wait_until(
        || order.lock().unwrap().len() == 4,
        Duration::from_secs(5),
    );
    stop_from_helper(&io);

    assert_eq!(*order.lock().unwrap(), vec![5, 10, 20, 30]);
}

#[test]
fn test_recurring_timer_fire_count_over_window() {
    let io = IoManager::new(1, false, "timer_recurring").unwrap();
    let fires = Arc::new(AtomicUsize::new(0));

    let fires2 = Arc::clone(&fires);
    let timer = io.add_timer(
        25,
        move || {
            fires2.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    std::thread::sleep(Duration::from_millis(118));
    timer.cancel();
    std::thread::sleep(Duration::from_millis(30));

    let count = fires.load(Ordering::SeqCst);
    assert!(
        (4..=5).contains(&count),
        "25ms recurring timer fired {count} times in a ~110ms window"
    );
    stop_from_helper(&io);
}

#[test]
fn test_cancelled_timer_never_fires() {
    let io = IoManager::new(1, false, "timer_cancel").unwrap();
    let fires = Arc::new(AtomicUsize::new(0));

    let fires2 = Arc::clone(&fires);
    let timer = io.add_timer(
        30,
        move || {
            fires2.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    assert!(timer.cancel());
    assert!(!timer.cancel(), "second cancel reports the tombstone");

    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(fires.load(Ordering::SeqCst), 0);
    stop_from_helper(&io);
}

#[test]
fn test_refresh_pushes_deadline_out() {
    let io = IoManager::new(1, false, "timer_refresh").unwrap();
    let fired_at = Arc::new(Mutex::new(None));

    let start = Instant::now();
    let fired_at2 = Arc::clone(&fired_at);
    let timer = io.add_timer(
        50,
        move || {
            *fired_at2.lock().unwrap() = Some(start.elapsed());
        },
        false,
    );

    std::thread::sleep(Duration::from_millis(30));
    assert!(timer.refresh(), "live timer refreshes");

    wait_until(
        || fired_at.lock().unwrap().is_some(),
        Duration::from_secs(5),
    );
    stop_from_helper(&io);

    let elapsed = fired_at.lock().unwrap().unwrap();
    assert!(
        elapsed >= Duration::from_millis(75),
        "refresh at +30ms should delay firing to ~+80ms, got {elapsed:?}"
    );
}

#[test]
fn test_reset_from_now_reschedules() {
    let io = IoManager::new(1, false, "timer_reset").unwrap();
    let fires = Arc::new(AtomicUsize::new(0));

    let fires2 = Arc::clone(&fires);
    let timer = io.add_timer(
        500,
        move || {
            fires2.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    // Same period, not from now: a no-op that still reports success.
    assert!(timer.reset(500, false));
    // Pull the deadline in close.
    assert!(timer.reset(20, true));

    wait_until(|| fires.load(Ordering::SeqCst) == 1, Duration::from_secs(5));
    stop_from_helper(&io);
}

#[test]
fn test_condition_timer_skips_after_witness_drop() {
    let io = IoManager::new(1, false, "timer_cond").unwrap();
    let fires = Arc::new(AtomicUsize::new(0));

    let witness = Arc::new(());
    let fires2 = Arc::clone(&fires);
    io.add_condition_timer(
        20,
        move || {
            fires2.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&witness),
        false,
    );
    drop(witness);

    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(fires.load(Ordering::SeqCst), 0);
    stop_from_helper(&io);
}

#[test]
fn test_condition_timer_fires_while_witness_lives() {
    let io = IoManager::new(1, false, "timer_cond_live").unwrap();
    let fires = Arc::new(AtomicUsize::new(0));

    let witness = Arc::new(());
    let fires2 = Arc::clone(&fires);
    io.add_condition_timer(
        10,
        move || {
            fires2.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&witness),
        false,
    );

    wait_until(|| fires.load(Ordering::SeqCst) == 1, Duration::from_secs(5));
    drop(witness);
    stop_from_helper(&io);
}
