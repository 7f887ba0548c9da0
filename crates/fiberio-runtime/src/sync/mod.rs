//! Fiber-aware synchronization
//!
//! Waiting on any of these suspends the calling fiber instead of blocking
//! its worker thread. Callers that are not fibers on a scheduler (a plain
//! thread, the main thread) park the OS thread, so the same primitive can
//! be shared between both.

mod condvar;
mod mutex;
mod semaphore;
mod waiter;

pub use condvar::FiberCondvar;
pub use mutex::{FiberMutex, FiberMutexGuard};
pub use semaphore::FiberSemaphore;
