//! Environment variable utilities
//!
//! Runtime knobs can be overridden with `FIO_*` variables at start-up.
//! These helpers parse them with a fallback default.
//!
//! # Usage
//!
//! ```ignore
//! use fiberio_core::env::{env_get, env_get_bool};
//!
//! let stack: usize = env_get("FIO_STACK_SIZE", 128 * 1024);
//! let connect_ms: u64 = env_get("FIO_CONNECT_TIMEOUT_MS", 5000);
//! let debug = env_get_bool("FIO_DEBUG", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Unset and unparsable values both yield `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" (any case) are true. Any other set value is
/// false; unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` if the variable is set and parses, `None` otherwise
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Check if environment variable is set (regardless of value)
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_returns_default() {
        let val: usize = env_get("__FIO_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__FIO_TEST_UNSET__", true));
        assert!(env_get_opt::<u64>("__FIO_TEST_UNSET__").is_none());
        assert_eq!(env_get_str("__FIO_TEST_UNSET__", "x"), "x");
        assert!(!env_is_set("__FIO_TEST_UNSET__"));
    }

    #[test]
    fn test_parse_set_values() {
        std::env::set_var("__FIO_TEST_NUM__", " 4096 ");
        let val: usize = env_get("__FIO_TEST_NUM__", 0);
        assert_eq!(val, 4096);
        std::env::set_var("__FIO_TEST_NUM__", "lots");
        let val: usize = env_get("__FIO_TEST_NUM__", 7);
        assert_eq!(val, 7);
        std::env::remove_var("__FIO_TEST_NUM__");
    }

    #[test]
    fn test_bool_variants() {
        for (raw, want) in [("1", true), ("TRUE", true), ("on", true), ("yes", true), ("0", false), ("garbage", false)] {
            std::env::set_var("__FIO_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__FIO_TEST_BOOL__", !want), want, "value {raw}");
        }
        std::env::remove_var("__FIO_TEST_BOOL__");
    }
}
