//! Parked callers of the fiber sync primitives

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

/// Someone blocked on a primitive, and how to wake them
pub(crate) enum Waiter {
    /// Rescheduled on the scheduler it was running on
    Fiber { sched: Arc<Scheduler>, fiber: Arc<Fiber> },
    /// Plain OS thread (no scheduler)
    Thread { thread: Thread, woken: Arc<AtomicBool> },
}

/// The blocking half of a [`Waiter`], kept by the caller
pub(crate) enum Park {
    Fiber,
    Thread(Arc<AtomicBool>),
}

impl Waiter {
    /// Waiter for the caller
    ///
    /// Fibers running on a scheduler suspend; anything else parks the OS
    /// thread.
    pub(crate) fn current() -> (Waiter, Park) {
        if Fiber::in_fiber() {
            if let Some(sched) = Scheduler::current() {
                return (Waiter::Fiber { sched, fiber: Fiber::current() }, Park::Fiber);
            }
        }
        let woken = Arc::new(AtomicBool::new(false));
        let waiter = Waiter::Thread { thread: thread::current(), woken: Arc::clone(&woken) };
        (waiter, Park::Thread(woken))
    }

    pub(crate) fn wake(self) {
        match self {
            Waiter::Fiber { sched, fiber } => sched.schedule_fiber(fiber),
            Waiter::Thread { thread, woken } => {
                woken.store(true, Ordering::Release);
                thread.unpark();
            }
        }
    }
}

impl Park {
    /// Block until the matching `Waiter::wake`
    pub(crate) fn wait(self) {
        match self {
            Park::Fiber => Fiber::yield_now(),
            Park::Thread(woken) => {
                while !woken.load(Ordering::Acquire) {
                    thread::park();
                }
            }
        }
    }
}
