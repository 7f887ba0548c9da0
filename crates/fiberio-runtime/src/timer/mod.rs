//! Timers
//!
//! [`TimerManager`] keeps deadline-ordered callbacks; an
//! [`IoManager`](crate::iomanager::IoManager) owns one and services it from
//! its epoll loop. Time is read through a [`Clock`] so tests can drive it.

mod clock;
mod manager;

pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::{Timer, TimerCallback, TimerManager};

use std::time::Duration;

use crate::fiber::Fiber;
use crate::iomanager::IoManager;
use crate::scheduler::Scheduler;

/// Suspend the caller for `dur`
///
/// On an IoManager fiber this arms a one-shot timer that reschedules the
/// fiber and yields, leaving the worker free. Anywhere else it blocks the
/// OS thread.
pub fn sleep(dur: Duration) {
    if !sleep_in_fiber(dur) {
        std::thread::sleep(dur);
    }
}

/// Timer-based sleep; false (without sleeping) off an IoManager fiber
pub(crate) fn sleep_in_fiber(dur: Duration) -> bool {
    let Some(iom) = IoManager::current() else { return false };
    if !Fiber::in_fiber() {
        return false;
    }
    let fiber = Fiber::current();
    let sched = Scheduler::current().unwrap_or_else(|| iom.scheduler().clone());
    iom.add_timer(dur.as_millis() as u64, move || sched.schedule_fiber(fiber.clone()));
    Fiber::yield_now();
    true
}
