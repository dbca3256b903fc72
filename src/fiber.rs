//! Stackful fibers with explicit resume/yield and per-thread anchors.
//!
//! A [`Fiber`] owns its stack and cooperates through exactly two suspension
//! points: [`Fiber::resume`] (peer → fiber) and [`Fiber::yield_now`]
//! (fiber → peer). Context switching rides on `corosensei`, which always
//! returns control to the context that performed the resume; the per-thread
//! anchors (current / root / scheduler fiber) record which context that is
//! *supposed* to be, and `run_in_scheduler` selects between the two peers a
//! fiber may legitimately have.
//!
//! Three anchors live in each thread:
//!
//! - **current**: the fiber presently running (the root fiber when the thread
//!   is on its native stack)
//! - **root**: the fiber representing the thread's native stack, materialized
//!   lazily on first use and owned for the thread's lifetime
//! - **scheduler**: the fiber running a scheduler loop, if any; defaults to
//!   the root fiber

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Default fiber stack size in bytes.
pub const DEFAULT_STACK_SIZE: usize = 128_000;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

/// Lifecycle state of a fiber.
///
/// Transitions: `Ready → Running → {Ready, Terminated}`, plus
/// `Terminated → Ready` via [`Fiber::reset`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Constructed or yielded; may be resumed.
    Ready = 0,
    /// Currently executing on its thread.
    Running = 1,
    /// Entry callback returned; only `reset` can revive it.
    Terminated = 2,
}

impl FiberState {
    fn from_u8(value: u8) -> FiberState {
        match value {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            _ => FiberState::Terminated,
        }
    }
}

type FiberCoroutine = Coroutine<(), (), ()>;

/// A stackful cooperative coroutine.
///
/// Fibers are shared handles (`Arc<Fiber>`): the scheduler queue, event slots
/// and the fiber's own thread anchors may all hold references. The root fiber
/// of a thread has no coroutine of its own; it *is* the native stack.
pub struct Fiber {
    id: u64,
    stack_size: usize,
    run_in_scheduler: bool,
    state: AtomicU8,
    /// Published by the trampoline while the fiber is on its stack; null
    /// otherwise. Only ever dereferenced on the thread running the fiber.
    yielder: AtomicPtr<Yielder<(), ()>>,
    coroutine: Mutex<Option<FiberCoroutine>>,
}

// SAFETY: the yielder pointer is written by the trampoline and read by
// yield_now, both on the thread currently running the fiber; the coroutine is
// only driven under its mutex. Fibers migrate between threads only while
// suspended.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static ROOT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHEDULER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

impl Fiber {
    /// Creates a user fiber in the `Ready` state.
    ///
    /// A `stack_size` of 0 selects [`DEFAULT_STACK_SIZE`]. `run_in_scheduler`
    /// records the fiber's intended resumer: the thread's scheduler fiber when
    /// true, the thread's root fiber when false.
    pub fn new<F>(cb: F, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };

        let fiber = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            stack_size,
            run_in_scheduler,
            state: AtomicU8::new(FiberState::Ready as u8),
            yielder: AtomicPtr::new(ptr::null_mut()),
            coroutine: Mutex::new(None),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        *fiber.coroutine.lock() = Some(Self::make_coroutine(&fiber, Box::new(cb)));
        fiber
    }

    /// Anchors the calling thread's native stack as its root fiber.
    fn new_root() -> Arc<Fiber> {
        let fiber = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            stack_size: 0,
            run_in_scheduler: false,
            state: AtomicU8::new(FiberState::Running as u8),
            yielder: AtomicPtr::new(ptr::null_mut()),
            coroutine: Mutex::new(None),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        fiber
    }

    /// Builds the coroutine whose entry is the trampoline.
    ///
    /// The closure holds only a `Weak` self-reference: when the entry callback
    /// returns, the trampoline publishes `Terminated` and drops its upgrade
    /// before the final switch back, so a finished fiber is not kept alive
    /// through its own stack.
    fn make_coroutine(fiber: &Arc<Fiber>, cb: Box<dyn FnOnce() + Send>) -> FiberCoroutine {
        let weak: Weak<Fiber> = Arc::downgrade(fiber);
        let stack = DefaultStack::new(fiber.stack_size).expect("failed to allocate fiber stack");

        Coroutine::with_stack(stack, move |yielder, ()| {
            if let Some(f) = weak.upgrade() {
                f.yielder
                    .store(yielder as *const Yielder<(), ()> as *mut _, Ordering::Release);
            }
            cb();
            if let Some(f) = weak.upgrade() {
                f.yielder.store(ptr::null_mut(), Ordering::Release);
                f.state
                    .store(FiberState::Terminated as u8, Ordering::SeqCst);
            }
        })
    }

    /// Returns the fiber currently running on this thread.
    ///
    /// The first call on a thread materializes the thread's root fiber and
    /// installs it as both the current and (absent a scheduler) the scheduler
    /// anchor.
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = CURRENT.with(|c| c.borrow().clone()) {
            return fiber;
        }

        let root = Fiber::new_root();
        ROOT.with(|r| *r.borrow_mut() = Some(Arc::clone(&root)));
        SCHEDULER.with(|s| *s.borrow_mut() = Some(Arc::clone(&root)));
        CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(&root)));
        root
    }

    /// Id of the fiber currently running on this thread.
    pub fn current_id() -> u64 {
        Fiber::current().id()
    }

    /// Number of live fibers across the process.
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    /// Installs `fiber` as this thread's scheduler fiber.
    pub(crate) fn set_scheduler_fiber(fiber: &Arc<Fiber>) {
        SCHEDULER.with(|s| *s.borrow_mut() = Some(Arc::clone(fiber)));
    }

    fn scheduler_fiber() -> Option<Arc<Fiber>> {
        SCHEDULER.with(|s| s.borrow().clone())
    }

    fn root_fiber() -> Option<Arc<Fiber>> {
        ROOT.with(|r| r.borrow().clone())
    }

    /// Switches execution from the calling context into this fiber.
    ///
    /// Precondition: the fiber is `Ready`. Returns when the fiber next yields
    /// or terminates; the calling context must be the fiber's peer (the
    /// scheduler fiber when `run_in_scheduler`, the root fiber otherwise).
    pub fn resume(self: &Arc<Fiber>) {
        assert_eq!(
            self.state(),
            FiberState::Ready,
            "resume on fiber {} in state {:?}",
            self.id,
            self.state()
        );

        let resumer = Fiber::current();
        debug_assert!(
            {
                let peer = if self.run_in_scheduler {
                    Fiber::scheduler_fiber().or_else(Fiber::root_fiber)
                } else {
                    Fiber::root_fiber()
                };
                peer.is_some_and(|p| Arc::ptr_eq(&p, &resumer))
            },
            "fiber {} resumed from a context that is not its peer",
            self.id
        );

        self.state.store(FiberState::Running as u8, Ordering::SeqCst);
        let previous = CURRENT.with(|c| c.replace(Some(Arc::clone(self))));

        {
            let mut coroutine = self.coroutine.lock();
            let co = coroutine
                .as_mut()
                .expect("resume on fiber without a context");
            match co.resume(()) {
                CoroutineResult::Yield(()) => {}
                CoroutineResult::Return(()) => {
                    self.state
                        .store(FiberState::Terminated as u8, Ordering::SeqCst);
                    // Releases the entry callback and the stack.
                    *coroutine = None;
                }
            }
        }

        CURRENT.with(|c| *c.borrow_mut() = previous);
    }

    /// Suspends the fiber currently running on this thread, returning control
    /// to its peer.
    ///
    /// The running fiber becomes `Ready`; it will continue from this point
    /// when resumed again. Must not be called on a thread's root fiber.
    pub fn yield_now() {
        let fiber = CURRENT
            .with(|c| c.borrow().clone())
            .expect("yield_now outside of any fiber");

        let yielder = fiber.yielder.load(Ordering::Acquire);
        assert!(
            !yielder.is_null(),
            "fiber {} cannot yield: it is a thread's root fiber",
            fiber.id
        );

        if fiber.state() == FiberState::Running {
            fiber.state.store(FiberState::Ready as u8, Ordering::SeqCst);
        }

        // SAFETY: non-null yielder means this thread is on the fiber's stack,
        // and the Yielder lives on that stack for the coroutine's lifetime.
        unsafe { (*yielder).suspend(()) };
    }

    /// Re-arms a `Terminated` fiber with a new entry callback.
    ///
    /// Rebuilds the machine context with a stack of the same configured size;
    /// the fiber returns to `Ready` and keeps its id.
    pub fn reset<F>(self: &Arc<Fiber>, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert_eq!(
            self.state(),
            FiberState::Terminated,
            "reset on fiber {} in state {:?}",
            self.id,
            self.state()
        );

        *self.coroutine.lock() = Some(Self::make_coroutine(self, Box::new(cb)));
        self.state.store(FiberState::Ready as u8, Ordering::SeqCst);
    }

    /// Unique id of this fiber.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Configured stack size in bytes (0 for a root fiber).
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Whether this fiber's peer is the thread's scheduler fiber.
    pub fn run_in_scheduler(&self) -> bool {
        self.run_in_scheduler
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size)
            .field("run_in_scheduler", &self.run_in_scheduler)
            .finish()
    }
}
