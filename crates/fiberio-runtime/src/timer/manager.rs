//! Deadline-ordered timer set
//!
//! Timers live in a `BTreeMap` keyed by `(deadline, id)`, so ties on the
//! deadline are broken by creation order and the earliest timer is always
//! the first key. Expired timers are split off the front in one operation.
//!
//! Lock order is manager set first, then a timer's own slot.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use fiberio_core::constants::NO_TIMEOUT;
use fiberio_core::{fdebug, fwarn};

use super::clock::{Clock, SystemClock};

/// Callback run when a timer fires
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// A backward clock jump larger than this expires every timer
const ROLLBACK_MS: u64 = 60 * 60 * 1000;

type Key = (u64, u64);

struct Slot {
    deadline: u64,
    period: u64,
    recurring: bool,
    /// `None` once fired (one-shot) or cancelled
    cb: Option<TimerCallback>,
}

/// Handle to a pending timer
pub struct Timer {
    id: u64,
    slot: Mutex<Slot>,
    manager: Weak<Shared>,
}

struct Timers {
    map: BTreeMap<Key, Arc<Timer>>,
    previous_now: u64,
}

struct Shared {
    timers: Mutex<Timers>,
    clock: Arc<dyn Clock>,
    /// Called when an insert becomes the new earliest deadline
    on_front: Box<dyn Fn() + Send + Sync>,
    /// Set after a front notification until the next `next_timeout`
    tickled: AtomicBool,
    next_id: AtomicU64,
}

impl Shared {
    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert under the set lock; returns whether to notify
    fn insert_locked(&self, timers: &mut Timers, key: Key, timer: Arc<Timer>) -> bool {
        timers.map.insert(key, timer);
        let at_front = timers.map.keys().next() == Some(&key);
        at_front && !self.tickled.swap(true, Ordering::AcqRel)
    }

    fn notify(&self, notify: bool) {
        if notify {
            (self.on_front)();
        }
    }
}

/// Ordered collection of deadline-triggered callbacks
#[derive(Clone)]
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl TimerManager {
    /// Manager on the wall clock with no front notification
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), || {})
    }

    /// Manager on `clock`; `on_front` runs whenever an insert becomes the
    /// earliest deadline (at most once between `next_timeout` calls)
    pub fn with_clock<F>(clock: Arc<dyn Clock>, on_front: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let now = clock.now_ms();
        Self {
            shared: Arc::new(Shared {
                timers: Mutex::new(Timers { map: BTreeMap::new(), previous_now: now }),
                clock,
                on_front: Box::new(on_front),
                tickled: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    fn insert(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = self.now_ms().saturating_add(ms);
        let timer = Arc::new(Timer {
            id,
            slot: Mutex::new(Slot { deadline, period: ms, recurring, cb: Some(cb) }),
            manager: Arc::downgrade(&self.shared),
        });

        let notify = {
            let mut timers = self.shared.timers();
            self.shared.insert_locked(&mut timers, (deadline, id), Arc::clone(&timer))
        };
        self.shared.notify(notify);
        timer
    }

    /// One-shot timer firing `ms` from now
    pub fn add_timer<F>(&self, ms: u64, cb: F) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(ms, Arc::new(cb), false)
    }

    /// Timer firing every `ms`
    pub fn add_rec_timer<F>(&self, ms: u64, cb: F) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(ms, Arc::new(cb), true)
    }

    /// Timer whose callback only runs while `cond` is still alive
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + ?Sized + 'static,
    {
        let guarded = move || {
            if cond.upgrade().is_some() {
                cb();
            }
        };
        self.insert(ms, Arc::new(guarded), recurring)
    }

    /// Milliseconds until the earliest deadline
    ///
    /// 0 if a timer is already due, `NO_TIMEOUT` if none is pending. Re-arms
    /// the front-insert notification.
    pub fn next_timeout(&self) -> u64 {
        self.shared.tickled.store(false, Ordering::Release);
        let timers = self.shared.timers();
        match timers.map.keys().next() {
            None => NO_TIMEOUT,
            Some(&(deadline, _)) => deadline.saturating_sub(self.now_ms()),
        }
    }

    /// Remove and return the callbacks of every due timer, earliest first
    ///
    /// Recurring timers are put back with deadline = now + period.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let now = self.now_ms();
        let mut timers = self.shared.timers();
        if timers.map.is_empty() {
            timers.previous_now = now;
            return Vec::new();
        }

        let previous = std::mem::replace(&mut timers.previous_now, now);
        let rollover = now.saturating_add(ROLLBACK_MS) < previous;

        let expired = if rollover {
            fwarn!("clock moved back {} ms; expiring all timers", previous - now);
            std::mem::take(&mut timers.map)
        } else {
            let rest = timers.map.split_off(&(now.saturating_add(1), 0));
            std::mem::replace(&mut timers.map, rest)
        };

        let mut cbs = Vec::with_capacity(expired.len());
        for (_, timer) in expired {
            let mut slot = timer.slot();
            if slot.recurring {
                let Some(cb) = slot.cb.clone() else { continue };
                slot.deadline = now.saturating_add(slot.period);
                let key = (slot.deadline, timer.id);
                drop(slot);
                timers.map.insert(key, timer);
                cbs.push(cb);
            } else if let Some(cb) = slot.cb.take() {
                cbs.push(cb);
            }
        }
        if !cbs.is_empty() {
            fdebug!("{} timers expired", cbs.len());
        }
        cbs
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.timers().map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.timers().map.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager").field("pending", &self.len()).finish()
    }
}

impl Timer {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Absolute deadline in clock milliseconds
    pub fn deadline(&self) -> u64 {
        self.slot().deadline
    }

    pub fn is_recurring(&self) -> bool {
        self.slot().recurring
    }

    /// Remove the timer; false if it already fired or was cancelled
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else { return false };
        let mut timers = shared.timers();
        let mut slot = self.slot();
        if slot.cb.take().is_none() {
            return false;
        }
        timers.map.remove(&(slot.deadline, self.id));
        true
    }

    /// Push the deadline out to now + period
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else { return false };
        let mut timers = shared.timers();
        let mut slot = self.slot();
        if slot.cb.is_none() {
            return false;
        }
        let Some(me) = timers.map.remove(&(slot.deadline, self.id)) else {
            return false;
        };
        slot.deadline = shared.clock.now_ms().saturating_add(slot.period);
        timers.map.insert((slot.deadline, self.id), me);
        true
    }

    /// Change the period; the new deadline counts from now or from the
    /// original start
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.manager.upgrade() else { return false };
        let notify = {
            let mut timers = shared.timers();
            let mut slot = self.slot();
            if slot.cb.is_none() {
                return false;
            }
            if ms == slot.period && !from_now {
                return true;
            }
            let Some(me) = timers.map.remove(&(slot.deadline, self.id)) else {
                return false;
            };
            let start = if from_now {
                shared.clock.now_ms()
            } else {
                slot.deadline.saturating_sub(slot.period)
            };
            slot.period = ms;
            slot.deadline = start.saturating_add(ms);
            let key = (slot.deadline, self.id);
            drop(slot);
            shared.insert_locked(&mut timers, key, me)
        };
        shared.notify(notify);
        true
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot();
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("deadline", &slot.deadline)
            .field("period", &slot.period)
            .field("recurring", &slot.recurring)
            .field("pending", &slot.cb.is_some())
            .finish()
    }
}
