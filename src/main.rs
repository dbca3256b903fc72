use fiberio::{Event, Fiber, FiberState, IoManager};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    println!("Fiberio - M:N Fiber Runtime with I/O Scheduling\n");

    let io = IoManager::new(4, true, "demo").expect("failed to start io manager");
    println!(
        "Started io manager with {} worker threads\n",
        io.scheduler().worker_count()
    );

    // Example 1: plain callbacks on the worker pool
    println!("Example 1: Parallel callbacks");
    let sum = Arc::new(AtomicUsize::new(0));
    for i in 0..100 {
        let sum = Arc::clone(&sum);
        io.schedule(move || {
            sum.fetch_add(i, Ordering::SeqCst);
        });
    }
    let expected: usize = (0..100).sum();
    while sum.load(Ordering::SeqCst) < expected {
        std::thread::sleep(Duration::from_millis(1));
    }
    println!("  100 callbacks summed to {}\n", sum.load(Ordering::SeqCst));

    // Example 2: a fiber that yields mid-way and is re-scheduled
    println!("Example 2: Cooperative yielding");
    let steps = Arc::new(AtomicUsize::new(0));
    let steps2 = Arc::clone(&steps);
    let fiber = Fiber::new(
        move || {
            steps2.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_now();
            steps2.fetch_add(1, Ordering::SeqCst);
        },
        0,
        true,
    );
    io.schedule_fiber(Arc::clone(&fiber));
    // Wait for the first slice to yield before re-scheduling.
    while steps.load(Ordering::SeqCst) < 1 || fiber.state() != FiberState::Ready {
        std::thread::sleep(Duration::from_millis(1));
    }
    io.schedule_fiber(Arc::clone(&fiber));
    while steps.load(Ordering::SeqCst) < 2 {
        std::thread::sleep(Duration::from_millis(1));
    }
    println!("  fiber ran in two slices\n");

    // Example 3: timers
    println!("Example 3: Timers");
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    io.add_timer(
        30,
        move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    let ticks = Arc::new(AtomicUsize::new(0));
    let ticks2 = Arc::clone(&ticks);
    let recurring = io.add_timer(
        20,
        move || {
            ticks2.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );
    let doomed = io.add_timer(10, || println!("  this line never prints"), false);
    doomed.cancel();

    std::thread::sleep(Duration::from_millis(110));
    recurring.cancel();
    println!(
        "  one-shot fired {} time(s), recurring ticked {} times\n",
        fired.load(Ordering::SeqCst),
        ticks.load(Ordering::SeqCst)
    );

    // Example 4: readiness event on a pipe
    println!("Example 4: Pipe readiness");
    let (reader, writer) = fiberio::poller::pipe().expect("pipe");
    let woke = Arc::new(AtomicUsize::new(0));
    let woke2 = Arc::clone(&woke);
    io.add_event(reader, Event::Read, move || {
        woke2.fetch_add(1, Ordering::SeqCst);
    })
    .expect("add_event");

    let start = Instant::now();
    fiberio::poller::write_wakeup(writer);
    while woke.load(Ordering::SeqCst) == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
    println!("  read handler woke after {:?}\n", start.elapsed());

    io.stop();
    fiberio::poller::close(reader);
    fiberio::poller::close(writer);
    println!("Shut down cleanly");
}
