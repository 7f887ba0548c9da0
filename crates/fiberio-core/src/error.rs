//! Error types for the fiberio runtime

use core::fmt;

use crate::state::FiberState;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Fiber is not in the state the operation requires
    InvalidState {
        expected: FiberState,
        actual: FiberState,
    },

    /// Operation needs to run inside a (non-root) fiber
    NotInFiber,

    /// Fiber is still referenced elsewhere
    Busy,

    /// No scheduler / IoManager is associated with the calling thread
    NoScheduler,

    /// Scheduler already started
    AlreadyStarted,

    /// Scheduler is stopping or stopped
    Stopped,

    /// Interest already registered for this fd and direction
    AlreadyRegistered { fd: i32, event: u32 },

    /// No interest registered for this fd and direction
    NotRegistered { fd: i32, event: u32 },

    /// Wait was cancelled before the event fired
    Cancelled,

    /// Operation timed out
    TimedOut,

    /// Configuration rejected by validation
    Config(&'static str),

    /// Stack mapping failed
    Memory(MemoryError),

    /// Worker thread error
    Worker(WorkerError),

    /// OS error carrying the raw errno
    Os(i32),
}

impl Error {
    /// Build an `Os` error from the calling thread's errno
    pub fn last_os() -> Self {
        Error::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// Raw errno to report to POSIX callers for this error
    pub fn errno(&self) -> i32 {
        match self {
            Error::Os(e) => *e,
            Error::TimedOut => 110,  // ETIMEDOUT
            Error::Cancelled => 125, // ECANCELED
            Error::AlreadyRegistered { .. } => 17, // EEXIST
            Error::NotRegistered { .. } => 2,      // ENOENT
            _ => 22,                               // EINVAL
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidState { expected, actual } => {
                write!(f, "invalid fiber state: expected {}, found {}", expected, actual)
            }
            Error::NotInFiber => write!(f, "not running inside a fiber"),
            Error::Busy => write!(f, "fiber is shared and cannot be reset"),
            Error::NoScheduler => write!(f, "no scheduler on this thread"),
            Error::AlreadyStarted => write!(f, "scheduler already started"),
            Error::Stopped => write!(f, "scheduler stopped"),
            Error::AlreadyRegistered { fd, event } => {
                write!(f, "event {:#x} already registered on fd {}", event, fd)
            }
            Error::NotRegistered { fd, event } => {
                write!(f, "event {:#x} not registered on fd {}", event, fd)
            }
            Error::Cancelled => write!(f, "wait cancelled"),
            Error::TimedOut => write!(f, "operation timed out"),
            Error::Config(msg) => write!(f, "invalid config: {}", msg),
            Error::Memory(e) => write!(f, "memory error: {}", e),
            Error::Worker(e) => write!(f, "worker error: {}", e),
            Error::Os(code) => write!(f, "os error: errno {}", code),
        }
    }
}

impl std::error::Error for Error {}

/// Stack-mapping errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    MapFailed(i32),

    /// mprotect on the guard page failed
    ProtectFailed(i32),

    /// Requested stack is smaller than the minimum
    StackTooSmall(usize),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::MapFailed(e) => write!(f, "stack mmap failed: errno {}", e),
            MemoryError::ProtectFailed(e) => write!(f, "guard page mprotect failed: errno {}", e),
            MemoryError::StackTooSmall(n) => write!(f, "stack size {} below minimum", n),
        }
    }
}

impl From<MemoryError> for Error {
    fn from(e: MemoryError) -> Self {
        Error::Memory(e)
    }
}

/// Worker thread related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Failed to spawn worker thread
    SpawnFailed,

    /// Worker thread panicked outside any fiber
    Panicked,

    /// Stop was called from a thread other than the constructing one
    WrongThread,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            WorkerError::Panicked => write!(f, "worker thread panicked"),
            WorkerError::WrongThread => write!(f, "called from the wrong thread"),
        }
    }
}

impl From<WorkerError> for Error {
    fn from(e: WorkerError) -> Self {
        Error::Worker(e)
    }
}
