use fiberio::{Fiber, FiberState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn test_trampoline_records_across_resumes() {
    let recording = Arc::new(Mutex::new(String::new()));
    let recording2 = Arc::clone(&recording);

    let fiber = Fiber::new(
        move || {
            recording2.lock().unwrap().push('A');
            Fiber::yield_now();
            recording2.lock().unwrap().push('B');
        },
        0,
        false,
    );

    fiber.resume();
    fiber.resume();

    assert_eq!(*recording.lock().unwrap(), "AB");
    assert_eq!(fiber.state(), FiberState::Terminated);
}

#[test]
fn test_state_machine_transitions() {
    let observed = Arc::new(Mutex::new(Vec::new()));
    let observed2 = Arc::clone(&observed);

    let fiber = Fiber::new(
        move || {
            observed2
                .lock()
                .unwrap()
                .push(Fiber::current().state());
            Fiber::yield_now();
        },
        0,
        false,
    );

    assert_eq!(fiber.state(), FiberState::Ready);
    fiber.resume();
    assert_eq!(fiber.state(), FiberState::Ready, "yielded fiber is Ready");
    fiber.resume();
    assert_eq!(fiber.state(), FiberState::Terminated);

    assert_eq!(*observed.lock().unwrap(), vec![FiberState::Running]);
}

#[test]
fn test_reset_returns_terminated_fiber_to_ready() {
    let runs = Arc::new(AtomicUsize::new(0));

    let runs2 = Arc::clone(&runs);
    let fiber = Fiber::new(
        move || {
            runs2.fetch_add(1, Ordering::SeqCst);
        },
        0,
        false,
    );
    fiber.resume();
    assert_eq!(fiber.state(), FiberState::Terminated);

    let runs3 = Arc::clone(&runs);
    fiber.reset(move || {
        runs3.fetch_add(10, Ordering::SeqCst);
    });
    assert_eq!(fiber.state(), FiberState::Ready);
    fiber.resume();

    assert_eq!(runs.load(Ordering::SeqCst), 11);
    assert_eq!(fiber.state(), FiberState::Terminated);
}

#[test]
fn test_fiber_ids_are_unique_and_stable() {
    let a = Fiber::new(|| {}, 0, false);
    let b = Fiber::new(|| {}, 0, false);
    assert_ne!(a.id(), b.id());

    let id = a.id();
    a.resume();
    a.reset(|| {});
    assert_eq!(a.id(), id);
    a.resume();
}

#[test]
fn test_current_inside_fiber_is_the_fiber() {
    let matched = Arc::new(AtomicUsize::new(0));
    let matched2 = Arc::clone(&matched);

    let fiber = Fiber::new(
        move || {
            matched2.store(Fiber::current().id() as usize + 1, Ordering::SeqCst);
        },
        0,
        false,
    );
    let expected = fiber.id() as usize + 1;
    fiber.resume();

    assert_eq!(matched.load(Ordering::SeqCst), expected);
    // Back on the native stack, current is the root fiber again.
    assert_eq!(Fiber::current().state(), FiberState::Running);
}

#[test]
fn test_many_interleaved_fibers_on_one_thread() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let fibers: Vec<_> = (0..8)
        .map(|i| {
            let log = Arc::clone(&log);
            Fiber::new(
                move || {
                    log.lock().unwrap().push((i, 0));
                    Fiber::yield_now();
                    log.lock().unwrap().push((i, 1));
                },
                0,
                false,
            )
        })
        .collect();

    for fiber in &fibers {
        fiber.resume();
    }
    for fiber in &fibers {
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Terminated);
    }

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 16);
    assert!(log[..8].iter().all(|&(_, half)| half == 0));
    assert!(log[8..].iter().all(|&(_, half)| half == 1));
}
