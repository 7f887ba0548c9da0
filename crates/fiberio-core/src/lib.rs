//! # fiberio-core
//!
//! Core types for the fiberio runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Everything that touches the kernel lives in `fiberio-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber state machine
//! - `error` - Error types shared by the runtime
//! - `spinlock` - Internal spinlock primitive (never suspends a fiber)
//! - `log` - Leveled log sink and the `f*!` logging macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod spinlock;
pub mod log;
pub mod env;

// Re-exports for convenience
pub use id::FiberId;
pub use state::FiberState;
pub use error::{Error, MemoryError, WorkerError, Result};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use log::{Level, LogSink};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

/// Constants shared by every layer
pub mod constants {
    /// Guard page size placed below each fiber stack (4 KB)
    pub const GUARD_SIZE: usize = 4096;

    /// Smallest stack a fiber may be created with
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Returned by `next_timeout` when no timer is pending
    pub const NO_TIMEOUT: u64 = u64::MAX;
}
