//! Environment variable helpers for mount configuration
//!
//! Every tunable of a mount may be overridden through a `UMFS_*` variable.
//!
//! ```ignore
//! use umfs_core::env::{env_get, env_get_bool};
//!
//! let stack: usize = env_get("UMFS_STACK_SIZE", 64 * 1024);
//! let fibers = env_get_bool("UMFS_CONTINUATIONS", true);
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
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true and
/// "0", "false", "no", "off" as false. Anything else returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__UMFS_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__UMFS_TEST_NUM__", " 123 ");
        let val: usize = env_get("__UMFS_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__UMFS_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__UMFS_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__UMFS_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__UMFS_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        std::env::set_var("__UMFS_TEST_BOOL__", "YES");
        assert!(env_get_bool("__UMFS_TEST_BOOL__", false));

        std::env::set_var("__UMFS_TEST_BOOL__", "off");
        assert!(!env_get_bool("__UMFS_TEST_BOOL__", true));

        std::env::set_var("__UMFS_TEST_BOOL__", "garbage");
        assert!(env_get_bool("__UMFS_TEST_BOOL__", true));

        std::env::remove_var("__UMFS_TEST_BOOL__");
        assert!(!env_get_bool("__UMFS_TEST_BOOL__", false));
    }
}
