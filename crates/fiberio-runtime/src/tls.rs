//! Thread-local runtime state
//!
//! Fibers migrate between OS threads across a yield, so a TLS address
//! computed before a switch may belong to another thread afterwards. Every
//! accessor here is `#[inline(never)]` so each call resolves the slot for
//! the thread it actually runs on.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

thread_local! {
    /// Fiber executing on this thread (borrowed from its resumer)
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// Stackless fiber standing for the thread's own stack
    static ROOT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Scheduler this thread works for
    static SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };

    /// Worker index inside that scheduler
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };
}

#[inline(never)]
pub fn current_fiber() -> *const Fiber {
    CURRENT_FIBER.with(|c| c.get())
}

#[inline(never)]
pub fn set_current_fiber(fiber: *const Fiber) {
    CURRENT_FIBER.with(|c| c.set(fiber));
}

#[inline(never)]
pub fn install_root_fiber(root: Arc<Fiber>) {
    CURRENT_FIBER.with(|c| c.set(Arc::as_ptr(&root)));
    ROOT_FIBER.with(|r| *r.borrow_mut() = Some(root));
}

#[inline(never)]
pub fn scheduler() -> Option<Arc<Scheduler>> {
    SCHEDULER.with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
}

#[inline(never)]
pub fn set_scheduler(sched: Option<Weak<Scheduler>>) {
    SCHEDULER.with(|s| *s.borrow_mut() = sched);
}

#[inline(never)]
pub fn set_worker_id(id: usize) {
    WORKER_ID.with(|c| c.set(id));
}

/// Worker index, `None` off scheduler threads
#[inline(never)]
pub fn worker_id() -> Option<usize> {
    match WORKER_ID.with(|c| c.get()) {
        usize::MAX => None,
        id => Some(id),
    }
}
