//! Native thread wrapper with kernel thread ids and a spawn handshake.
//!
//! Workers are addressed by their *kernel* thread id (the value task affinity
//! compares against), so the spawner must not return until the new thread has
//! published that id. A counting semaphore gates the handshake: the spawned
//! body installs its thread-locals, stores its tid, signals, and only then
//! runs the user callback.

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A counting semaphore built from a mutex and a condition variable.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with the given initial count.
    pub fn new(count: usize) -> Self {
        Semaphore {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Blocks until the count is positive, then decrements it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Increments the count and wakes one waiter.
    pub fn signal(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Semaphore::new(0)
    }
}

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
}

/// Returns the kernel id of the calling thread.
pub fn gettid() -> libc::pid_t {
    // SAFETY: gettid has no preconditions and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Returns the display name of the calling thread.
pub fn current_name() -> String {
    THREAD_NAME.with(|name| name.borrow().clone())
}

/// Sets the display name of the calling thread.
pub fn set_current_name(name: &str) {
    THREAD_NAME.with(|slot| *slot.borrow_mut() = name.to_string());
}

/// A spawned native thread, joinable, with a stable kernel id.
pub struct Thread {
    id: libc::pid_t,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawns a thread running `cb` under `name`.
    ///
    /// Blocks until the new thread has published its kernel id, so `id()` is
    /// valid as soon as this returns. The kernel limits thread names to 15
    /// bytes; longer names are truncated for the OS but kept in full in the
    /// thread-local name.
    pub fn spawn<F>(cb: F, name: &str) -> io::Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let ready = Arc::new(Semaphore::new(0));
        let tid = Arc::new(AtomicI32::new(-1));

        let full_name = name.to_string();
        let os_name = truncate_name(name);
        let body_ready = Arc::clone(&ready);
        let body_tid = Arc::clone(&tid);
        let body_name = full_name.clone();

        let handle = std::thread::Builder::new()
            .name(os_name)
            .spawn(move || {
                set_current_name(&body_name);
                body_tid.store(gettid(), Ordering::SeqCst);
                body_ready.signal();
                cb();
            })
            .map_err(|e| {
                tracing::error!(name = %full_name, error = %e, "thread spawn failed");
                e
            })?;

        ready.wait();

        Ok(Thread {
            id: tid.load(Ordering::SeqCst),
            name: full_name,
            handle: Some(handle),
        })
    }

    /// Kernel id of the spawned thread.
    pub fn id(&self) -> libc::pid_t {
        self.id
    }

    /// Display name the thread was spawned under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the thread to finish.
    pub fn join(mut self) -> std::thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

fn truncate_name(name: &str) -> String {
    let mut end = name.len().min(15);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
