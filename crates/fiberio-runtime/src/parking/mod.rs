//! Worker parking mechanism
//!
//! Idle workers of a plain [`Scheduler`](crate::scheduler::Scheduler) sleep
//! here until a tickle arrives. Platform-specific implementations use the
//! most efficient primitive available.

use std::time::Duration;

/// Platform-specific worker parking mechanism
///
/// A wake issued while nobody is parked is remembered, so the next `park`
/// returns immediately instead of sleeping through it.
pub trait WorkerParking: Send + Sync {
    /// Park the current worker until signaled or timeout
    ///
    /// Returns `true` if woken by a signal, `false` on timeout or a spurious
    /// wakeup. Callers re-check for work either way.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Wake one parked worker
    fn wake_one(&self);

    /// Wake all parked workers
    fn wake_all(&self);

    /// Number of currently parked workers (hint, may be stale)
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::FallbackParking as PlatformParking;
    }
}

/// Create a new platform-appropriate parking instance
pub fn new_parking() -> Box<dyn WorkerParking> {
    Box::new(PlatformParking::new())
}
