//! Leveled log sink and logging macros
//!
//! Everything in the runtime logs through a single process-wide sink that
//! accepts `(level, message)`. The default sink writes one locked line per
//! record to stderr; embedders can swap in their own with [`set_sink`].
//!
//! # Environment Variables
//!
//! - `FIO_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0..5)
//! - `FIO_FLUSH_EPRINT=1` - flush stderr after every line (crash debugging)
//!
//! # Usage
//!
//! ```ignore
//! use fiberio_core::{finfo, fwarn};
//!
//! finfo!("worker {} started", id);
//! fwarn!("epoll_wait returned {}", rc);
//! ```

use std::cell::Cell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Log levels, most severe first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Level::Off,
            1 => Level::Error,
            2 => Level::Warn,
            3 => Level::Info,
            4 => Level::Debug,
            _ => Level::Trace,
        }
    }

    /// Parse a level name or digit, as accepted by `FIO_LOG_LEVEL`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Some(Level::Off),
            "error" | "1" => Some(Level::Error),
            "warn" | "2" => Some(Level::Warn),
            "info" | "3" => Some(Level::Info),
            "debug" | "4" => Some(Level::Debug),
            "trace" | "5" => Some(Level::Trace),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Level::Off => "",
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }
}

/// Destination for log records
pub trait LogSink: Send + Sync {
    fn write(&self, level: Level, message: &str);
}

/// Default sink: one line per record on stderr
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write(&self, level: Level, message: &str) {
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let _ = writeln!(handle, "[{:<5}] {}", level.tag(), message);
        if FLUSH_ENABLED.load(Ordering::Relaxed) {
            let _ = handle.flush();
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(debug_assertions)] {
        const DEFAULT_LEVEL: Level = Level::Info;
    } else {
        const DEFAULT_LEVEL: Level = Level::Warn;
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(DEFAULT_LEVEL as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static ENV_APPLIED: OnceLock<()> = OnceLock::new();
static SINK: OnceLock<RwLock<Arc<dyn LogSink>>> = OnceLock::new();

thread_local! {
    static FIBER_ID: Cell<u64> = const { Cell::new(0) };
}

/// Apply `FIO_LOG_LEVEL` / `FIO_FLUSH_EPRINT`
///
/// Called lazily on first use; calling it explicitly makes start-up
/// deterministic.
pub fn init() {
    ENV_APPLIED.get_or_init(|| {
        if let Some(level) = std::env::var("FIO_LOG_LEVEL").ok().and_then(|v| Level::parse(&v)) {
            LOG_LEVEL.store(level as u8, Ordering::Relaxed);
        }
        if crate::env::env_get_bool("FIO_FLUSH_EPRINT", false) {
            FLUSH_ENABLED.store(true, Ordering::Relaxed);
        }
    });
}

fn sink() -> &'static RwLock<Arc<dyn LogSink>> {
    SINK.get_or_init(|| RwLock::new(Arc::new(StderrSink)))
}

/// Replace the process-wide sink
pub fn set_sink(new_sink: Arc<dyn LogSink>) {
    let mut guard = sink().write().unwrap_or_else(|e| e.into_inner());
    *guard = new_sink;
}

#[inline]
pub fn level() -> Level {
    init();
    Level::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_level(level: Level) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn enabled(level: Level) -> bool {
    level != Level::Off && level <= self::level()
}

/// Record the fiber running on this thread, for the line prefix
#[inline]
pub fn set_fiber_id(id: u64) {
    FIBER_ID.with(|c| c.set(id));
}

#[doc(hidden)]
pub fn _log_impl(level: Level, args: std::fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let fiber = FIBER_ID.try_with(|c| c.get()).unwrap_or(0);
    let thread = std::thread::current();
    let name = thread.name().unwrap_or("-");
    let message = format!("{} f{} {}", name, fiber, args);
    let sink = sink().read().unwrap_or_else(|e| e.into_inner()).clone();
    sink.write(level, &message);
}

#[macro_export]
macro_rules! ferror {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Error, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! fwarn {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Warn, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! finfo {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Info, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! fdebug {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Debug, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! ftrace {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Trace, format_args!($($arg)*));
    }};
}
