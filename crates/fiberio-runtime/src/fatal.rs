//! Programmer-error termination
//!
//! API misuse (resuming a running fiber, registering an fd direction twice,
//! yielding the root fiber, dropping a running scheduler) is not recoverable.
//! `fatal!` logs the message with a backtrace and aborts the process.

use std::backtrace::Backtrace;
use std::fmt;

use fiberio_core::ferror;

#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        $crate::fatal::abort_with(format_args!($($arg)*))
    }};
}

#[cold]
#[inline(never)]
#[doc(hidden)]
pub fn abort_with(args: fmt::Arguments<'_>) -> ! {
    ferror!("FATAL: {}\n{}", args, Backtrace::force_capture());
    std::process::abort()
}
