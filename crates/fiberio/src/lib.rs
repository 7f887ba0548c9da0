//! # fiberio - fibers over epoll
//!
//! Cooperative user-space threading for Linux. Ordinary blocking socket code
//! runs inside fibers; when a call would block, the fiber is suspended and
//! its worker thread moves on to other work until the descriptor is ready.
//!
//! ## Quick Start
//!
//! ```ignore
//! use fiberio::{IoManager, hook};
//!
//! fn main() -> fiberio::Result<()> {
//!     fiberio::init_logging();
//!     let iom = IoManager::new(4, false, "app")?;
//!
//!     iom.spawn(|| {
//!         let fd = unsafe { hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
//!         // connect/read/write through `hook` suspend this fiber, not the thread
//!     });
//!
//!     iom.add_timer(500, || fiberio::finfo!("half a second later"));
//!     iom.stop()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        spawn(), hook::read/write/connect, FiberMutex        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      IoManager                              │
//! │     Scheduler + epoll driver + TimerManager + FdManager     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Caller   │
//!    │  Thread   │      │  Thread   │      │  Thread   │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │ idle fiber: epoll_wait, expired timers, ready fds
//!          ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                      Fibers                             │
//!    │     mmap'd stacks with guard pages, pooled for reuse    │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use fiberio_core::{Error, FiberId, FiberState, MemoryError, Result, WorkerError};
pub use fiberio_core::constants::NO_TIMEOUT;

// Re-export logging
pub use fiberio_core::{fdebug, ferror, finfo, ftrace, fwarn};
pub use fiberio_core::log::{init as init_logging, set_flush_enabled, set_level, set_sink, Level, LogSink};

// Re-export env utilities
pub use fiberio_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export the runtime
pub use fiberio_runtime::{
    config, hook, sleep, Clock, Driver, Event, EventCallback, FdCtx, FdManager, Fiber,
    FiberCondvar, FiberMutex, FiberMutexGuard, FiberSemaphore, IoManager, ManualClock,
    ParkingDriver, RuntimeConfig, Scheduler, SystemClock, Task, Timeout, Timer, TimerCallback,
    TimerManager,
};

/// Yield the current fiber, leaving it runnable
///
/// Outside a scheduler this yields the OS thread.
#[inline]
pub fn yield_now() {
    Scheduler::yield_now();
}

/// Identifier of the running fiber (the thread's root fiber outside one)
#[inline]
pub fn current_id() -> FiberId {
    Fiber::current_id()
}
