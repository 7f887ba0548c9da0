//! Runtime configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls on a `RuntimeConfig` passed to [`init`]
//! 2. Environment variables (`FIO_*`, read by `from_env`)
//! 3. User's config file named by `FIO_CONFIG_RS` at build time
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use fiberio_runtime::config::{self, RuntimeConfig};
//!
//! config::init(RuntimeConfig::from_env().stack_size(256 * 1024))?;
//! ```

pub mod defaults;

use std::sync::OnceLock;
use std::time::Duration;

use fiberio_core::constants::MIN_STACK_SIZE;
use fiberio_core::env::{env_get, env_get_bool};
use fiberio_core::log::{self, Level};
use fiberio_core::{Error, Result};

/// Named tunables consumed by the runtime
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Usable stack bytes per fiber (guard page excluded)
    pub stack_size: usize,
    /// Default-size stacks kept around for reuse
    pub stack_pool_capacity: usize,
    /// Timeout for hooked `connect`
    pub connect_timeout_ms: u64,
    /// Upper bound on a single epoll wait
    pub max_poll_timeout_ms: u64,
    /// Events fetched per epoll wait
    pub poll_batch: usize,
    /// Initial FdCtx table size
    pub fd_table_initial: usize,
    /// Initial IoManager channel table size
    pub channel_table_initial: usize,
    /// Growth factor for both tables
    pub table_growth: f64,
    /// Park timeout for idle workers of a plain Scheduler
    pub park_timeout_ms: u64,
    /// Raise the log level to Debug
    pub debug_logging: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults, no environment lookup
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            stack_pool_capacity: defaults::STACK_POOL_CAPACITY,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            max_poll_timeout_ms: defaults::MAX_POLL_TIMEOUT_MS,
            poll_batch: defaults::POLL_BATCH,
            fd_table_initial: defaults::FD_TABLE_INITIAL,
            channel_table_initial: defaults::CHANNEL_TABLE_INITIAL,
            table_growth: defaults::TABLE_GROWTH,
            park_timeout_ms: defaults::PARK_TIMEOUT_MS,
            debug_logging: defaults::DEBUG_LOGGING || cfg!(feature = "debug-logging"),
        }
    }

    /// Compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `FIO_STACK_SIZE`
    /// - `FIO_STACK_POOL_CAPACITY`
    /// - `FIO_CONNECT_TIMEOUT_MS`
    /// - `FIO_MAX_POLL_TIMEOUT_MS`
    /// - `FIO_POLL_BATCH`
    /// - `FIO_FD_TABLE_INITIAL`
    /// - `FIO_CHANNEL_TABLE_INITIAL`
    /// - `FIO_TABLE_GROWTH`
    /// - `FIO_PARK_TIMEOUT_MS`
    /// - `FIO_DEBUG` (0/1)
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            stack_size: env_get("FIO_STACK_SIZE", base.stack_size),
            stack_pool_capacity: env_get("FIO_STACK_POOL_CAPACITY", base.stack_pool_capacity),
            connect_timeout_ms: env_get("FIO_CONNECT_TIMEOUT_MS", base.connect_timeout_ms),
            max_poll_timeout_ms: env_get("FIO_MAX_POLL_TIMEOUT_MS", base.max_poll_timeout_ms),
            poll_batch: env_get("FIO_POLL_BATCH", base.poll_batch),
            fd_table_initial: env_get("FIO_FD_TABLE_INITIAL", base.fd_table_initial),
            channel_table_initial: env_get("FIO_CHANNEL_TABLE_INITIAL", base.channel_table_initial),
            table_growth: env_get("FIO_TABLE_GROWTH", base.table_growth),
            park_timeout_ms: env_get("FIO_PARK_TIMEOUT_MS", base.park_timeout_ms),
            debug_logging: env_get_bool("FIO_DEBUG", base.debug_logging),
        }
    }

    // Builder methods

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn stack_pool_capacity(mut self, n: usize) -> Self {
        self.stack_pool_capacity = n;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout_ms = d.as_millis() as u64;
        self
    }

    pub fn max_poll_timeout(mut self, d: Duration) -> Self {
        self.max_poll_timeout_ms = d.as_millis() as u64;
        self
    }

    pub fn poll_batch(mut self, n: usize) -> Self {
        self.poll_batch = n;
        self
    }

    pub fn fd_table_initial(mut self, n: usize) -> Self {
        self.fd_table_initial = n;
        self
    }

    pub fn channel_table_initial(mut self, n: usize) -> Self {
        self.channel_table_initial = n;
        self
    }

    pub fn table_growth(mut self, factor: f64) -> Self {
        self.table_growth = factor;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout_ms = d.as_millis() as u64;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    pub fn park_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.park_timeout_ms)
    }

    /// Grow `len` by `table_growth`, covering at least `min_len`
    pub fn grown_len(&self, len: usize, min_len: usize) -> usize {
        let grown = (len.max(1) as f64 * self.table_growth).ceil() as usize;
        grown.max(min_len)
    }

    /// Reject nonsensical values
    pub fn validate(&self) -> Result<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(Error::Config("stack_size below minimum"));
        }
        if self.max_poll_timeout_ms == 0 {
            return Err(Error::Config("max_poll_timeout_ms must be > 0"));
        }
        if self.max_poll_timeout_ms > i32::MAX as u64 {
            return Err(Error::Config("max_poll_timeout_ms must fit in an i32"));
        }
        if self.poll_batch == 0 {
            return Err(Error::Config("poll_batch must be > 0"));
        }
        if self.fd_table_initial == 0 || self.channel_table_initial == 0 {
            return Err(Error::Config("initial table sizes must be > 0"));
        }
        if !(self.table_growth > 1.0) {
            return Err(Error::Config("table_growth must be > 1.0"));
        }
        Ok(())
    }
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

fn apply(cfg: &RuntimeConfig) {
    if cfg.debug_logging && log::level() < Level::Debug {
        log::set_level(Level::Debug);
    }
}

/// Install the process-wide configuration
///
/// Must run before the first fiber or IoManager is created; afterwards the
/// lazily-loaded configuration is already fixed and an error is returned.
pub fn init(cfg: RuntimeConfig) -> Result<()> {
    cfg.validate()?;
    let mut installed = false;
    CONFIG.get_or_init(|| {
        installed = true;
        apply(&cfg);
        cfg.clone()
    });
    if installed {
        Ok(())
    } else {
        Err(Error::Config("configuration already initialized"))
    }
}

/// The process-wide configuration, loaded from the environment on first use
pub fn get() -> &'static RuntimeConfig {
    CONFIG.get_or_init(|| {
        let cfg = RuntimeConfig::from_env();
        let cfg = match cfg.validate() {
            Ok(()) => cfg,
            Err(e) => {
                fiberio_core::fwarn!("{}, falling back to defaults", e);
                RuntimeConfig::new()
            }
        };
        apply(&cfg);
        cfg
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = RuntimeConfig::new();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_poll_timeout_ms, 3000);
        assert_eq!(cfg.poll_batch, 256);
        assert_eq!(cfg.table_growth, 1.5);
    }

    #[test]
    fn test_builder() {
        let cfg = RuntimeConfig::new()
            .stack_size(64 * 1024)
            .connect_timeout(Duration::from_millis(250))
            .table_growth(2.0);

        assert_eq!(cfg.stack_size, 64 * 1024);
        assert_eq!(cfg.connect_timeout_ms, 250);
        assert_eq!(cfg.grown_len(10, 0), 20);
        assert_eq!(cfg.grown_len(10, 35), 35);
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().stack_size(1024).validate().is_err());
        assert!(RuntimeConfig::new().table_growth(1.0).validate().is_err());
        assert!(RuntimeConfig::new().poll_batch(0).validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("FIO_POLL_BATCH", "17");
        let cfg = RuntimeConfig::from_env();
        std::env::remove_var("FIO_POLL_BATCH");
        assert_eq!(cfg.poll_batch, 17);
    }
}
