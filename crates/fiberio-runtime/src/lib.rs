//! # fiberio-runtime
//!
//! Platform-specific runtime for fiberio.
//!
//! This crate provides:
//! - Stackful fibers with a hand-written context switch
//! - An M:N scheduler running fibers and callables on a worker pool
//! - An epoll-backed `IoManager` with per-fd read/write interest
//! - Millisecond timers driven by the `IoManager` idle loop
//! - Per-fd bookkeeping and a syscall hook layer that turns blocking
//!   socket calls into fiber suspensions
//! - Fiber-aware mutex, semaphore and condition variable

pub mod fatal;
pub mod arch;
pub mod config;
pub mod stack;
pub mod tls;
pub mod fiber;
pub mod parking;
pub mod scheduler;
pub mod timer;
pub mod fd_manager;
pub mod iomanager;
pub mod hook;
pub mod sync;

// Re-exports
pub use config::RuntimeConfig;
pub use fiber::Fiber;
pub use scheduler::{Driver, ParkingDriver, Scheduler, Task};
pub use iomanager::{Event, EventCallback, IoDriver, IoManager};
pub use timer::{sleep, Clock, ManualClock, SystemClock, Timer, TimerCallback, TimerManager};
pub use fd_manager::{FdCtx, FdManager, Timeout};
pub use parking::{new_parking, WorkerParking};
pub use sync::{FiberCondvar, FiberMutex, FiberMutexGuard, FiberSemaphore};

#[cfg(not(target_os = "linux"))]
compile_error!("fiberio-runtime requires Linux (epoll, eventfd)");
