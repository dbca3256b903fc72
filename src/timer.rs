//! Deadline-ordered timers with cancel/refresh/reset and rollover handling.
//!
//! Timers live in a [`TimerManager`]: an ordered set keyed by absolute
//! deadline (wall-clock milliseconds), protected by a write-preferring shared
//! lock. The manager itself never sleeps: a host (the I/O scheduler) polls
//! [`next_timer`](TimerManager::next_timer) for its wait timeout and drains
//! [`list_expired`](TimerManager::list_expired) afterwards. When an insert
//! lands at the front of the set, the manager fires its waker exactly once
//! per drain cycle (the *tickled* latch), so a read-hot `next_timer` is never
//! poked redundantly.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Clock shift treated as a rollover: one hour backward.
const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

/// Shared timer callback; recurring timers fire it repeatedly.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Wall-clock milliseconds since the epoch.
///
/// The wall clock is deliberate: deadlines must tolerate an operator moving
/// the clock, which the rollover detection in `list_expired` absorbs.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct TimerState {
    /// Period in milliseconds.
    ms: u64,
    /// Absolute deadline in milliseconds.
    next: u64,
    /// None once cancelled or fired (non-recurring).
    cb: Option<TimerCallback>,
}

/// A single timer registration.
///
/// Obtained from [`TimerManager::add_timer`]; the handle cancels, refreshes,
/// or re-schedules the registration. All three return `false` once the timer
/// has been cancelled or has already fired without recurrence.
pub struct Timer {
    id: u64,
    recurring: bool,
    state: Mutex<TimerState>,
    manager: Weak<ManagerCore>,
}

impl Timer {
    fn key(&self) -> (u64, u64) {
        (self.state.lock().next, self.id)
    }

    /// Cancels the timer, removing it from its manager without firing.
    pub fn cancel(&self) -> bool {
        let Some(core) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = core.timers.write();
        let mut state = self.state.lock();
        if state.cb.is_none() {
            return false;
        }
        state.cb = None;
        timers.set.remove(&(state.next, self.id));
        true
    }

    /// Pushes the deadline out to `now + period`.
    pub fn refresh(&self) -> bool {
        let Some(core) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = core.timers.write();
        let mut state = self.state.lock();
        if state.cb.is_none() {
            return false;
        }
        let Some(timer) = timers.set.remove(&(state.next, self.id)) else {
            return false;
        };
        state.next = now_ms() + state.ms;
        timers.set.insert((state.next, self.id), timer);
        true
    }

    /// Re-schedules the timer with period `ms`.
    ///
    /// With `from_now` the new deadline is `now + ms`; otherwise it keeps the
    /// original base (`old_deadline - old_period + ms`). Unchanged period
    /// without `from_now` is a no-op.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(core) = self.manager.upgrade() else {
            return false;
        };

        let removed = {
            let mut timers = core.timers.write();
            let mut state = self.state.lock();
            if ms == state.ms && !from_now {
                return true;
            }
            if state.cb.is_none() {
                return false;
            }
            let Some(timer) = timers.set.remove(&(state.next, self.id)) else {
                return false;
            };
            let base = if from_now {
                now_ms()
            } else {
                state.next - state.ms
            };
            state.ms = ms;
            state.next = base + ms;
            timer
        };

        // Re-enter the add path so a new front deadline re-arms the waker.
        core.add(removed);
        true
    }

    /// Whether the timer fires repeatedly.
    pub fn recurring(&self) -> bool {
        self.recurring
    }

    /// Configured period in milliseconds.
    pub fn period_ms(&self) -> u64 {
        self.state.lock().ms
    }
}

struct TimerSet {
    set: BTreeMap<(u64, u64), Arc<Timer>>,
    /// Last observation of the wall clock, for rollover detection.
    previous: u64,
}

struct ManagerCore {
    timers: RwLock<TimerSet>,
    /// Set when the front waker has fired and not yet been consumed by
    /// `next_timer`; suppresses redundant wakeups.
    tickled: AtomicBool,
    /// Invoked (outside the lock) when an insert lands at the front.
    waker: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl ManagerCore {
    /// Inserts a timer, waking the host if it became the nearest deadline.
    fn add(&self, timer: Arc<Timer>) {
        let at_front = {
            let mut timers = self.timers.write();
            let key = timer.key();
            timers.set.insert(key, timer);
            timers.set.keys().next() == Some(&key)
                && !self.tickled.swap(true, Ordering::SeqCst)
        };

        if at_front {
            if let Some(waker) = self.waker.get() {
                waker();
            }
        }
    }
}

/// Manager of deadline-ordered timers.
#[derive(Clone)]
pub struct TimerManager {
    core: Arc<ManagerCore>,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            core: Arc::new(ManagerCore {
                timers: RwLock::new(TimerSet {
                    set: BTreeMap::new(),
                    previous: now_ms(),
                }),
                tickled: AtomicBool::new(false),
                waker: OnceLock::new(),
            }),
        }
    }

    /// Registers the closure invoked when an insert becomes the nearest
    /// deadline. One-shot registration; later calls are ignored.
    pub(crate) fn set_front_waker<F>(&self, waker: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let _ = self.core.waker.set(Box::new(waker));
    }

    /// Schedules `cb` to fire in `ms` milliseconds, optionally recurring.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            state: Mutex::new(TimerState {
                ms,
                next: now_ms() + ms,
                cb: Some(Arc::new(cb)),
            }),
            manager: Arc::downgrade(&self.core),
        });
        self.core.add(Arc::clone(&timer));
        timer
    }

    /// Schedules `cb` gated on a witness: the callback only runs while
    /// `cond` still upgrades, so dropping the witness cancels without a
    /// timer handle.
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
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the nearest deadline: 0 when one has already
    /// expired, `u64::MAX` when no timer is pending. Clears the tickled
    /// latch, re-arming the front-insert waker.
    pub fn next_timer(&self) -> u64 {
        self.core.tickled.store(false, Ordering::SeqCst);

        let timers = self.core.timers.read();
        let Some((&(next, _), _)) = timers.set.iter().next() else {
            return u64::MAX;
        };

        let now = now_ms();
        if now >= next {
            0
        } else {
            next - now
        }
    }

    /// Whether any timer is pending.
    pub fn has_timer(&self) -> bool {
        !self.core.timers.read().set.is_empty()
    }

    /// Drains every expired timer, returning their callbacks in deadline
    /// order. Recurring timers are re-armed at `now + period`; one-shot
    /// timers are tombstoned. A clock rollover (more than an hour backward)
    /// flushes the whole set.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let now = now_ms();
        let mut expired = Vec::new();
        let mut timers = self.core.timers.write();

        let rollover = now < timers.previous.saturating_sub(ROLLOVER_THRESHOLD_MS);
        timers.previous = now;

        loop {
            let Some((&(next, id), _)) = timers.set.iter().next() else {
                break;
            };
            if !rollover && next > now {
                break;
            }

            let timer = timers
                .set
                .remove(&(next, id))
                .expect("front key present under write lock");
            let mut state = timer.state.lock();
            let Some(cb) = state.cb.clone() else {
                continue;
            };
            expired.push(cb);

            if timer.recurring {
                state.next = now + state.ms;
                let key = (state.next, timer.id);
                drop(state);
                timers.set.insert(key, Arc::clone(&timer));
            } else {
                state.cb = None;
            }
        }

        expired
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        TimerManager::new()
    }
}
