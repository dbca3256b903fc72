//! Fiber scheduler: a task queue multiplexed onto a pool of worker threads.
//!
//! The scheduler owns N native workers (plus, optionally, the caller thread's
//! slot) and drains a FIFO queue of tasks (fibers or plain callbacks), each
//! optionally pinned to one worker's kernel thread id. Workers that find no
//! eligible task run an *idle fiber*; the base idle is a placeholder nap, and
//! the I/O scheduler replaces it with a reactor wait (see [`crate::io`]).
//!
//! Subclass behavior (waking idle workers, the idle body, the stop predicate)
//! is expressed through the crate-private [`Hooks`] trait rather than
//! inheritance: the run loop and `stop` always dispatch through the hooks
//! registered before `start`.

use crate::fiber::{Fiber, FiberState};
use crate::thread::{self, Thread};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// Affinity value accepting any worker.
pub const ANY_WORKER: libc::pid_t = -1;

/// Nap length of the placeholder idle loop.
const IDLE_NAP: Duration = Duration::from_millis(10);

/// A unit of schedulable work: an existing fiber, or a callback that will be
/// wrapped in a fresh fiber when dispatched.
pub enum Task {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send>),
}

impl Task {
    /// Task resuming an existing fiber.
    pub fn fiber(fiber: Arc<Fiber>) -> Task {
        Task::Fiber(fiber)
    }

    /// Task invoking a callback on a fresh fiber.
    pub fn callback<F>(cb: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Callback(Box::new(cb))
    }
}

struct ScheduledTask {
    task: Task,
    /// Kernel id of the worker required to run this task, or [`ANY_WORKER`].
    thread: libc::pid_t,
}

/// Overridable worker behavior. The base scheduler provides the defaults; the
/// I/O scheduler overrides all three and extends `install`.
pub(crate) trait Hooks: Send + Sync {
    /// The shared scheduler state this hook set drives.
    fn base(&self) -> &Inner;

    /// Wakes one idle worker. The base scheduler has nothing to wake.
    fn tickle(&self) {
        tracing::trace!(scheduler = %self.base().name, "tickle");
    }

    /// Body of each worker's idle fiber. Must yield back every pass.
    fn idle(&self) {
        while !self.stopping() {
            std::thread::sleep(IDLE_NAP);
            Fiber::yield_now();
        }
    }

    /// Whether the scheduler has fully drained and may shut down.
    fn stopping(&self) -> bool {
        self.base().base_stopping()
    }

    /// Installs per-thread state at worker startup.
    fn install(&self) {
        self.base().install_current();
    }
}

/// Shared scheduler state, referenced by the public handle, every worker, and
/// any subclass hooks.
pub(crate) struct Inner {
    name: String,
    queue: Mutex<VecDeque<ScheduledTask>>,
    threads: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<libc::pid_t>>,
    thread_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    use_caller: bool,
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
    root_tid: libc::pid_t,
    stopping: AtomicBool,
    hooks: OnceLock<Weak<dyn Hooks>>,
    self_weak: Weak<Inner>,
}

impl Hooks for Inner {
    fn base(&self) -> &Inner {
        self
    }
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Weak<Inner>>> = const { RefCell::new(None) };
}

impl Inner {
    /// Resolves the hook set driving this scheduler: the registered subclass,
    /// or the base behavior when none was registered.
    pub(crate) fn ops(&self) -> Arc<dyn Hooks> {
        if let Some(ops) = self.hooks.get().and_then(Weak::upgrade) {
            return ops;
        }
        self.self_weak
            .upgrade()
            .expect("scheduler state dropped while in use")
    }

    /// Registers subclass hooks. Must happen before `start`; later calls are
    /// ignored.
    pub(crate) fn set_hooks(&self, hooks: Weak<dyn Hooks>) {
        let _ = self.hooks.set(hooks);
    }

    pub(crate) fn install_current(&self) {
        CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = Some(self.self_weak.clone()));
    }

    /// Stop predicate of the base scheduler: stop requested, queue drained,
    /// no fiber executing. Subclasses extend this.
    pub(crate) fn base_stopping(&self) -> bool {
        let queue = self.queue.lock();
        self.stopping.load(Ordering::SeqCst)
            && queue.is_empty()
            && self.active.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Appends a task and, when the queue was empty, tickles a worker.
    pub(crate) fn submit(&self, task: Task, thread: libc::pid_t) {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(ScheduledTask { task, thread });
            was_empty
        };
        if need_tickle {
            self.ops().tickle();
        }
    }
}

/// Returns the scheduler state installed on the calling thread, if any.
pub(crate) fn current_inner() -> Option<Arc<Inner>> {
    CURRENT_SCHEDULER.with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
}

/// Per-worker scheduler loop.
///
/// Installs thread-local state, materializes the thread's root fiber (the
/// caller thread already has one), then repeatedly extracts the first task
/// whose affinity admits this worker. Skipped pinned tasks and a non-empty
/// remainder both tickle other workers. With no task, the idle fiber runs;
/// the loop exits once the idle fiber terminates.
pub(crate) fn run(ops: Arc<dyn Hooks>) {
    let thread_id = thread::gettid();
    ops.install();

    let inner = ops.base();
    tracing::debug!(scheduler = %inner.name, thread_id, "worker loop starting");

    if thread_id != inner.root_tid {
        Fiber::current();
    }

    let idle_ops = Arc::clone(&ops);
    let idle_fiber = Fiber::new(move || idle_ops.idle(), 0, true);

    loop {
        let mut task: Option<Task> = None;
        let mut tickle_me = false;
        {
            let mut queue = inner.queue.lock();
            let mut index = 0;
            while index < queue.len() {
                let affinity = queue[index].thread;
                if affinity != ANY_WORKER && affinity != thread_id {
                    // Pinned to another worker, which may be idle.
                    index += 1;
                    tickle_me = true;
                    continue;
                }
                let scheduled = queue.remove(index).expect("scanned index in bounds");
                inner.active.fetch_add(1, Ordering::SeqCst);
                task = Some(scheduled.task);
                break;
            }
            tickle_me = tickle_me || !queue.is_empty();
        }
        // The queue lock is released before any fiber switch.

        if tickle_me {
            ops.tickle();
        }

        match task {
            Some(Task::Fiber(fiber)) => {
                if fiber.state() != FiberState::Terminated {
                    fiber.resume();
                }
                inner.active.fetch_sub(1, Ordering::SeqCst);
            }
            Some(Task::Callback(cb)) => {
                let fiber = Fiber::new(cb, 0, true);
                fiber.resume();
                inner.active.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                if idle_fiber.state() == FiberState::Terminated {
                    break;
                }
                inner.idle.fetch_add(1, Ordering::SeqCst);
                idle_fiber.resume();
                inner.idle.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    tracing::debug!(scheduler = %inner.name, thread_id, "worker loop exiting");
}

/// Handle to a fiber scheduler.
///
/// Cheap to clone; workers keep the underlying state alive until [`stop`]
/// completes, so call `stop` before discarding the last handle.
///
/// [`stop`]: Scheduler::stop
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Creates a scheduler with `threads` slots.
    ///
    /// When `use_caller` is set, one slot belongs to the calling thread: its
    /// root fiber is materialized and a scheduler fiber bound to the run loop
    /// is prepared, to be driven during [`stop`](Scheduler::stop). The
    /// scheduler installs itself as the calling thread's current scheduler;
    /// at most one scheduler may be installed per thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(threads > 0, "scheduler requires at least one thread");
        assert!(
            Scheduler::current().is_none(),
            "a scheduler is already installed on this thread"
        );

        let worker_count = if use_caller { threads - 1 } else { threads };
        let root_tid = if use_caller { thread::gettid() } else { -1 };

        let inner = Arc::new_cyclic(|weak| Inner {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            thread_count: worker_count,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            use_caller,
            caller_fiber: Mutex::new(None),
            root_tid,
            stopping: AtomicBool::new(false),
            hooks: OnceLock::new(),
            self_weak: weak.clone(),
        });

        inner.install_current();
        thread::set_current_name(name);

        if use_caller {
            Fiber::current();

            // Hooks may not be registered yet (the I/O scheduler registers
            // them after construction), so the run loop resolves them at
            // first resume.
            let weak = Arc::downgrade(&inner);
            let caller_fiber = Fiber::new(
                move || {
                    if let Some(inner) = weak.upgrade() {
                        run(inner.ops());
                    }
                },
                0,
                false,
            );
            Fiber::set_scheduler_fiber(&caller_fiber);
            inner.thread_ids.lock().push(root_tid);
            *inner.caller_fiber.lock() = Some(caller_fiber);
        }

        tracing::debug!(
            scheduler = %inner.name,
            workers = worker_count,
            use_caller,
            "scheduler created"
        );
        Scheduler { inner }
    }

    /// Returns the scheduler installed on the calling thread, if any.
    pub fn current() -> Option<Scheduler> {
        current_inner().map(|inner| Scheduler { inner })
    }

    /// Queues a callback on any worker.
    pub fn schedule<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit(Task::callback(cb), ANY_WORKER);
    }

    /// Queues a callback pinned to the worker with kernel id `thread`.
    pub fn schedule_on<F>(&self, cb: F, thread: libc::pid_t)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit(Task::callback(cb), thread);
    }

    /// Queues a fiber on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.inner.submit(Task::fiber(fiber), ANY_WORKER);
    }

    /// Queues a fiber pinned to the worker with kernel id `thread`.
    pub fn schedule_fiber_on(&self, fiber: Arc<Fiber>, thread: libc::pid_t) {
        self.inner.submit(Task::fiber(fiber), thread);
    }

    /// Spawns the worker threads.
    ///
    /// A no-op (with a diagnostic) once the scheduler is stopping. Thread
    /// spawn failures surface to the caller.
    pub fn start(&self) -> io::Result<()> {
        let inner = &self.inner;
        let mut threads = inner.threads.lock();

        if inner.stopping.load(Ordering::SeqCst) {
            tracing::error!(scheduler = %inner.name, "start called on a stopped scheduler");
            return Ok(());
        }
        assert!(threads.is_empty(), "scheduler already started");

        let ops = inner.ops();
        for i in 0..inner.thread_count {
            let worker_ops = Arc::clone(&ops);
            let thread = Thread::spawn(
                move || run(worker_ops),
                &format!("{}_{}", inner.name, i),
            )?;
            inner.thread_ids.lock().push(thread.id());
            threads.push(thread);
        }

        tracing::debug!(scheduler = %inner.name, workers = threads.len(), "scheduler started");
        Ok(())
    }

    /// Stops the scheduler: drains the queue, retires the workers, joins them.
    ///
    /// Idempotent. For a `use_caller` scheduler this must run on the caller
    /// thread (whose slot is drained here, by resuming the caller's scheduler
    /// fiber); otherwise it must run on a thread that is not one of the
    /// scheduler's own.
    pub fn stop(&self) {
        let inner = &self.inner;
        let ops = inner.ops();

        if ops.stopping() {
            return;
        }
        inner.stopping.store(true, Ordering::SeqCst);

        let installed_here = Scheduler::current()
            .is_some_and(|current| Arc::ptr_eq(&current.inner, inner));
        if inner.use_caller {
            assert!(
                installed_here,
                "stop of a use_caller scheduler must run on the caller thread"
            );
        } else {
            assert!(
                !installed_here,
                "stop of a non-caller scheduler must not run on its own thread"
            );
        }

        for _ in 0..inner.thread_count {
            ops.tickle();
        }

        let caller_fiber = inner.caller_fiber.lock().take();
        if caller_fiber.is_some() {
            ops.tickle();
        }
        if let Some(fiber) = caller_fiber {
            // Drain the caller's slot: runs the scheduler loop here until the
            // idle fiber terminates.
            fiber.resume();
        }

        let threads = std::mem::take(&mut *inner.threads.lock());
        for thread in threads {
            if thread.join().is_err() {
                tracing::error!(scheduler = %inner.name, "worker panicked during shutdown");
            }
        }

        tracing::debug!(scheduler = %inner.name, "scheduler stopped");
    }

    /// Scheduler display name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of worker threads (excluding the caller slot).
    pub fn worker_count(&self) -> usize {
        self.inner.thread_count
    }

    /// Kernel ids of the scheduler's threads, observed after `start`.
    ///
    /// For a `use_caller` scheduler the caller's id comes first.
    pub fn worker_ids(&self) -> Vec<libc::pid_t> {
        self.inner.thread_ids.lock().clone()
    }

    /// Number of fibers currently executing across workers.
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Number of workers currently inside their idle fiber.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.load(Ordering::SeqCst)
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Scheduler {
        Scheduler { inner }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("workers", &self.inner.thread_count)
            .field("use_caller", &self.inner.use_caller)
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .finish()
    }
}
