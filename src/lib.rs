//! # Fiberio - M:N Fiber Runtime with I/O Scheduling
//!
//! A user-space coroutine runtime: stackful fibers multiplexed onto a pool of
//! worker threads, with an epoll readiness reactor and a timer manager folded
//! into the scheduler's idle loop.
//!
//! ## Architecture
//!
//! Three interlocking layers:
//!
//! - **Fibers**: stackful coroutines with their own stacks, suspended and
//!   resumed cooperatively ([`fiber`])
//! - **Scheduler**: a FIFO task queue (fibers or callbacks, optionally pinned
//!   to one worker's kernel thread id) drained by N worker threads, plus an
//!   optional caller-thread slot ([`scheduler`])
//! - **IoManager**: the scheduler extended with an edge-triggered readiness
//!   reactor and deadline-ordered timers; idle workers block in the reactor
//!   and dispatch ready events back onto the queue ([`io`])
//!
//! ## Example
//!
//! ```no_run
//! use fiberio::IoManager;
//!
//! let io = IoManager::new(4, false, "app").unwrap();
//!
//! io.schedule(|| {
//!     println!("hello from a fiber");
//! });
//! io.add_timer(50, || println!("50ms later"), false);
//!
//! // Stop from a thread that is not one of the scheduler's own.
//! let stopper = io.clone();
//! std::thread::spawn(move || stopper.stop()).join().unwrap();
//! ```

pub mod fiber;
pub mod io;
pub mod poller;
pub mod scheduler;
pub mod thread;
pub mod timer;

pub use fiber::{Fiber, FiberState, DEFAULT_STACK_SIZE};
pub use io::{Event, IoManager};
pub use scheduler::{Scheduler, Task, ANY_WORKER};
pub use thread::{Semaphore, Thread};
pub use timer::{Timer, TimerManager};
