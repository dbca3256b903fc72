//! I/O scheduler: the fiber scheduler extended with a readiness reactor and
//! timers.
//!
//! [`IoManager`] folds an epoll reactor and a [`TimerManager`] into the
//! scheduler's idle loop: idle workers block in the reactor for up to the
//! nearest timer deadline, dispatch whatever became ready back onto the task
//! queue, then yield so the dispatched work can run. A self-pipe registered
//! with the reactor lets [`tickle`](crate::scheduler) interrupt the wait from
//! any thread.
//!
//! Each file descriptor has a context with one slot per direction (read /
//! write) holding the handler to wake: a callback, or the fiber that parked
//! itself after registering. Registration is edge-triggered, so handlers must
//! drain the descriptor and re-register for the next delivery.

use crate::fiber::{Fiber, FiberState};
use crate::poller::{self, Poller};
use crate::scheduler::{self, Hooks, Scheduler, Task, ANY_WORKER};
use crate::timer::{Timer, TimerManager};
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

const READ_MASK: u32 = libc::EPOLLIN as u32;
const WRITE_MASK: u32 = libc::EPOLLOUT as u32;
const ET: u32 = libc::EPOLLET as u32;
const ERROR_MASK: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Reactor cookie reserved for the self-pipe read end.
const TICKLE_COOKIE: u64 = u64::MAX;
/// Batch capacity of one reactor wait.
const MAX_EVENTS: usize = 256;
/// Ceiling on the reactor wait, so stop requests are noticed.
const MAX_TIMEOUT_MS: u64 = 5_000;
/// Initial size of the fd-context table.
const INITIAL_CONTEXTS: usize = 32;

/// Readiness direction on a file descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    fn mask(self) -> u32 {
        match self {
            Event::Read => READ_MASK,
            Event::Write => WRITE_MASK,
        }
    }
}

type EventCallback = Box<dyn FnOnce() + Send>;

/// Wake target of one (fd, direction) registration.
#[derive(Default)]
struct EventContext {
    /// Scheduler on whose behalf the registration was made.
    scheduler: Weak<scheduler::Inner>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<EventCallback>,
}

impl EventContext {
    fn is_empty(&self) -> bool {
        self.fiber.is_none() && self.cb.is_none()
    }

    fn reset(&mut self) {
        self.scheduler = Weak::new();
        self.fiber = None;
        self.cb = None;
    }
}

struct FdState {
    /// OR of the directions with a populated slot.
    events: u32,
    read: EventContext,
    write: EventContext,
}

impl FdState {
    fn context_mut(&mut self, event: Event) -> &mut EventContext {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Clears the direction and enqueues its handler onto the scheduler it
    /// was registered under.
    fn trigger(&mut self, event: Event) {
        debug_assert!(self.events & event.mask() != 0);
        self.events &= !event.mask();

        let slot = self.context_mut(event);
        let scheduler = slot.scheduler.upgrade();
        let cb = slot.cb.take();
        let fiber = slot.fiber.take();
        slot.reset();

        let Some(scheduler) = scheduler else {
            return;
        };
        if let Some(cb) = cb {
            scheduler.submit(Task::Callback(cb), ANY_WORKER);
        } else if let Some(fiber) = fiber {
            scheduler.submit(Task::Fiber(fiber), ANY_WORKER);
        }
    }
}

/// Per-descriptor registration state; the table is indexed by fd number.
struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            state: Mutex::new(FdState {
                events: 0,
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        }
    }
}

struct IoInner {
    scheduler: Arc<scheduler::Inner>,
    poller: Poller,
    tickle_read: RawFd,
    tickle_write: RawFd,
    /// Number of (fd, direction) pairs currently registered.
    pending: AtomicUsize,
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    timers: TimerManager,
    self_weak: Weak<IoInner>,
}

thread_local! {
    static CURRENT_IO: RefCell<Option<Weak<IoInner>>> = const { RefCell::new(None) };
}

fn grow_contexts(contexts: &mut Vec<Arc<FdContext>>, size: usize) {
    for fd in contexts.len()..size {
        contexts.push(Arc::new(FdContext::new(fd as RawFd)));
    }
}

impl IoInner {
    /// Fd-context lookup: read-locked fast path, write-locked growth to
    /// `max(2·fd, len)` for descriptors beyond the table.
    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative fd");
        {
            let contexts = self.fd_contexts.read();
            if let Some(ctx) = contexts.get(fd as usize) {
                return Arc::clone(ctx);
            }
        }

        let mut contexts = self.fd_contexts.write();
        let target = (fd as usize * 2).max(contexts.len());
        grow_contexts(&mut contexts, target);
        Arc::clone(&contexts[fd as usize])
    }

    fn existing_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let contexts = self.fd_contexts.read();
        contexts.get(fd as usize).map(Arc::clone)
    }
}

impl Hooks for IoInner {
    fn base(&self) -> &scheduler::Inner {
        &self.scheduler
    }

    /// Wakes an idle worker out of the reactor with one self-pipe byte.
    /// With no worker idle there is nothing to interrupt.
    fn tickle(&self) {
        if !self.scheduler.has_idle_threads() {
            return;
        }
        poller::write_wakeup(self.tickle_write);
    }

    fn stopping(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
            && !self.timers.has_timer()
            && self.scheduler.base_stopping()
    }

    fn install(&self) {
        self.scheduler.install_current();
        CURRENT_IO.with(|s| *s.borrow_mut() = Some(self.self_weak.clone()));
    }

    /// Reactor-driven idle loop; replaces the base scheduler's nap.
    fn idle(&self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if self.stopping() {
                tracing::debug!(scheduler = %self.scheduler.name(), "idle exiting");
                break;
            }

            let timeout_ms = self.timers.next_timer().min(MAX_TIMEOUT_MS) as i32;
            let ready = match self.poller.wait(&mut events, timeout_ms) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, "reactor wait failed");
                    0
                }
            };

            for cb in self.timers.list_expired() {
                self.scheduler
                    .submit(Task::Callback(Box::new(move || cb())), ANY_WORKER);
            }

            for event in &events[..ready] {
                let cookie = event.u64;
                let bits = event.events;

                if cookie == TICKLE_COOKIE {
                    poller::drain(self.tickle_read);
                    continue;
                }

                let fd = cookie as RawFd;
                let Some(ctx) = self.existing_context(fd) else {
                    continue;
                };
                let mut state = ctx.state.lock();

                let mut real = bits & (READ_MASK | WRITE_MASK);
                if bits & ERROR_MASK != 0 {
                    // Error or hangup unblocks every registered direction.
                    real |= READ_MASK | WRITE_MASK;
                }
                // Both epoll bits are always armed; only directions actually
                // registered may fire.
                real &= state.events;
                if real == 0 {
                    continue;
                }

                let left = state.events & !real;
                let rearm = if left != 0 {
                    self.poller.modify(fd, ET | left, cookie)
                } else {
                    self.poller.delete(fd)
                };
                if let Err(e) = rearm {
                    tracing::error!(fd, error = %e, "reactor re-registration failed");
                    continue;
                }

                if real & READ_MASK != 0 {
                    state.trigger(Event::Read);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if real & WRITE_MASK != 0 {
                    state.trigger(Event::Write);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Let the dispatched work run before the next reactor wait.
            Fiber::yield_now();
        }
    }
}

impl Drop for IoInner {
    fn drop(&mut self) {
        poller::close(self.tickle_read);
        poller::close(self.tickle_write);
    }
}

/// Handle to an I/O scheduler.
///
/// Construction starts the worker pool; [`stop`](IoManager::stop) drains and
/// joins it. Handles are cheap to clone.
#[derive(Clone)]
pub struct IoManager {
    scheduler: Scheduler,
    inner: Arc<IoInner>,
}

impl IoManager {
    /// Creates the scheduler, reactor and self-pipe, then starts the workers.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> io::Result<IoManager> {
        let scheduler = Scheduler::new(threads, use_caller, name);
        let poller = Poller::new()?;
        let (tickle_read, tickle_write) = poller::pipe()?;

        if let Err(e) = poller.add(tickle_read, READ_MASK | ET, TICKLE_COOKIE) {
            poller::close(tickle_read);
            poller::close(tickle_write);
            return Err(e);
        }

        let inner = Arc::new_cyclic(|weak: &Weak<IoInner>| IoInner {
            scheduler: Arc::clone(scheduler.inner()),
            poller,
            tickle_read,
            tickle_write,
            pending: AtomicUsize::new(0),
            fd_contexts: RwLock::new(Vec::new()),
            timers: TimerManager::new(),
            self_weak: weak.clone(),
        });
        grow_contexts(&mut inner.fd_contexts.write(), INITIAL_CONTEXTS);

        let hooks: Weak<dyn Hooks> = Arc::downgrade(&(Arc::clone(&inner) as Arc<dyn Hooks>));
        scheduler.inner().set_hooks(hooks);
        let waker = Arc::downgrade(&inner);
        inner.timers.set_front_waker(move || {
            // A nearer deadline must re-arm the reactor wait.
            if let Some(io) = waker.upgrade() {
                io.tickle();
            }
        });
        CURRENT_IO.with(|s| *s.borrow_mut() = Some(Arc::downgrade(&inner)));

        scheduler.start()?;

        tracing::debug!(scheduler = %scheduler.name(), "io manager started");
        Ok(IoManager { scheduler, inner })
    }

    /// Returns the I/O scheduler installed on the calling thread, if any.
    pub fn current() -> Option<IoManager> {
        CURRENT_IO
            .with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
            .map(|inner| IoManager {
                scheduler: Scheduler::from_inner(Arc::clone(&inner.scheduler)),
                inner,
            })
    }

    /// Registers `cb` to run once `fd` becomes ready in direction `event`.
    ///
    /// Fails with `AlreadyExists` if the direction is already registered, or
    /// with the reactor's error (state unchanged) if registration is refused.
    pub fn add_event<F>(&self, fd: RawFd, event: Event, cb: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(fd, event, Some(Box::new(cb)))
    }

    /// Registers the *currently running fiber* to be resumed once `fd`
    /// becomes ready in direction `event`; the fiber is expected to yield
    /// right after.
    pub fn add_fiber_event(&self, fd: RawFd, event: Event) -> io::Result<()> {
        self.register(fd, event, None)
    }

    fn register(&self, fd: RawFd, event: Event, cb: Option<EventCallback>) -> io::Result<()> {
        let ctx = self.inner.context_for(fd);
        let mut state = ctx.state.lock();

        if state.events & event.mask() != 0 {
            tracing::error!(fd, ?event, "direction already registered");
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "event direction already registered for this fd",
            ));
        }

        // Register both directions edge-triggered; the per-direction mask in
        // the fd context filters deliveries.
        let epoll_mask = ET | READ_MASK | WRITE_MASK;
        let result = if state.events != 0 {
            self.inner.poller.modify(fd, epoll_mask, fd as u64)
        } else {
            self.inner.poller.add(fd, epoll_mask, fd as u64)
        };
        if let Err(e) = result {
            tracing::error!(fd, ?event, error = %e, "reactor registration failed");
            return Err(e);
        }

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        state.events |= event.mask();

        let slot = state.context_mut(event);
        debug_assert!(slot.is_empty());
        let scheduler = scheduler::current_inner()
            .unwrap_or_else(|| Arc::clone(&self.inner.scheduler));
        slot.scheduler = Arc::downgrade(&scheduler);
        match cb {
            Some(cb) => slot.cb = Some(cb),
            None => {
                let fiber = Fiber::current();
                assert_eq!(
                    fiber.state(),
                    FiberState::Running,
                    "add_fiber_event outside a running fiber"
                );
                slot.fiber = Some(fiber);
            }
        }
        Ok(())
    }

    /// Unregisters a direction without firing its handler.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.inner.existing_context(fd) else {
            return false;
        };
        let mut state = ctx.state.lock();
        if state.events & event.mask() == 0 {
            return false;
        }

        let left = state.events & !event.mask();
        let result = if left != 0 {
            self.inner.poller.modify(fd, ET | left, fd as u64)
        } else {
            self.inner.poller.delete(fd)
        };
        if let Err(e) = result {
            tracing::error!(fd, ?event, error = %e, "reactor deregistration failed");
            return false;
        }

        self.inner.pending.fetch_sub(1, Ordering::SeqCst);
        state.events = left;
        state.context_mut(event).reset();
        true
    }

    /// Unregisters a direction and fires its handler.
    ///
    /// The handler's scheduler receives the enqueue before this returns.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.inner.existing_context(fd) else {
            return false;
        };
        let mut state = ctx.state.lock();
        if state.events & event.mask() == 0 {
            return false;
        }

        let left = state.events & !event.mask();
        let result = if left != 0 {
            self.inner.poller.modify(fd, ET | left, fd as u64)
        } else {
            self.inner.poller.delete(fd)
        };
        if let Err(e) = result {
            tracing::error!(fd, ?event, error = %e, "reactor deregistration failed");
            return false;
        }

        state.trigger(event);
        self.inner.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Cancels every registered direction on `fd`, firing each handler.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.inner.existing_context(fd) else {
            return false;
        };
        let mut state = ctx.state.lock();
        if state.events == 0 {
            return false;
        }

        if let Err(e) = self.inner.poller.delete(fd) {
            tracing::error!(fd, error = %e, "reactor deregistration failed");
            return false;
        }

        if state.events & READ_MASK != 0 {
            state.trigger(Event::Read);
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if state.events & WRITE_MASK != 0 {
            state.trigger(Event::Write);
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert_eq!(state.events, 0);
        true
    }

    /// Number of (fd, direction) registrations currently armed.
    pub fn pending_event_count(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// The underlying scheduler handle.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Queues a callback on any worker.
    pub fn schedule<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule(cb);
    }

    /// Queues a callback pinned to the worker with kernel id `thread`.
    pub fn schedule_on<F>(&self, cb: F, thread: libc::pid_t)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule_on(cb, thread);
    }

    /// Queues a fiber on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.scheduler.schedule_fiber(fiber);
    }

    /// Stops the scheduler once all events and timers have drained.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Schedules `cb` to fire in `ms` milliseconds, optionally recurring.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.timers.add_timer(ms, cb, recurring)
    }

    /// Schedules `cb` gated on `cond` still being alive when the timer fires.
    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.inner.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    /// The timer manager feeding this scheduler's idle loop.
    pub fn timers(&self) -> &TimerManager {
        &self.inner.timers
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.scheduler)
            .field("pending_events", &self.pending_event_count())
            .finish()
    }
}
