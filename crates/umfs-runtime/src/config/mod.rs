//! Mount configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use umfs_runtime::config::MountConfig;
//!
//! // Use defaults with env overrides
//! let config = MountConfig::from_env();
//!
//! // Or customize programmatically
//! let config = MountConfig::new()
//!     .stack_size(128 * 1024)
//!     .continuations(false);
//! ```

use std::time::Duration;

use umfs_core::constants::{
    DEFAULT_FRAME_POOL, DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_BATCH_OPS, DEFAULT_POLL_TIMEOUT_MS,
    DEFAULT_STACK_SIZE, MIN_STACK_PAGES, PAGE_SIZE,
};
use umfs_core::env::{env_get, env_get_bool};
use umfs_core::error::{UmError, UmResult};

/// Mount configuration with builder pattern.
///
/// The configuration is threaded through the mount; nothing about it is
/// process-global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    /// Stack size of each real continuation
    pub stack_size: usize,
    /// Run requests on stack-switching continuations; `false` runs every
    /// request inline on a synthetic continuation that cannot suspend
    pub continuations: bool,
    /// Most requests fetched per control-channel batch
    pub max_batch_ops: usize,
    /// Most bytes fetched per control-channel batch
    pub max_batch_bytes: usize,
    /// Longest readiness wait before the loop hook runs again
    pub poll_timeout: Duration,
    /// Recycled frame buffers kept around (0 disables the pool)
    pub frame_pool: usize,
    /// Build and keep node paths
    pub path_tracking: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MountConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `UMFS_STACK_SIZE` - Stack size per continuation
    /// - `UMFS_CONTINUATIONS` - Use stack-switching continuations (0/1)
    /// - `UMFS_MAX_BATCH_OPS` - Requests per batch
    /// - `UMFS_MAX_BATCH_BYTES` - Bytes per batch
    /// - `UMFS_POLL_TIMEOUT_MS` - Readiness wait in milliseconds
    /// - `UMFS_FRAME_POOL` - Recycled frame buffers
    /// - `UMFS_PATH_TRACKING` - Keep node paths (0/1)
    pub fn from_env() -> Self {
        let defaults = Self::new();
        Self {
            stack_size: env_get("UMFS_STACK_SIZE", defaults.stack_size),
            continuations: env_get_bool("UMFS_CONTINUATIONS", defaults.continuations),
            max_batch_ops: env_get("UMFS_MAX_BATCH_OPS", defaults.max_batch_ops),
            max_batch_bytes: env_get("UMFS_MAX_BATCH_BYTES", defaults.max_batch_bytes),
            poll_timeout: Duration::from_millis(env_get(
                "UMFS_POLL_TIMEOUT_MS",
                DEFAULT_POLL_TIMEOUT_MS as u64,
            )),
            frame_pool: env_get("UMFS_FRAME_POOL", defaults.frame_pool),
            path_tracking: env_get_bool("UMFS_PATH_TRACKING", defaults.path_tracking),
        }
    }

    /// Create config with library defaults (no env override).
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            continuations: true,
            max_batch_ops: DEFAULT_MAX_BATCH_OPS,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS as u64),
            frame_pool: DEFAULT_FRAME_POOL,
            path_tracking: false,
        }
    }

    // Builder methods

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn continuations(mut self, enable: bool) -> Self {
        self.continuations = enable;
        self
    }

    pub fn max_batch_ops(mut self, n: usize) -> Self {
        self.max_batch_ops = n;
        self
    }

    pub fn max_batch_bytes(mut self, n: usize) -> Self {
        self.max_batch_bytes = n;
        self
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn frame_pool(mut self, n: usize) -> Self {
        self.frame_pool = n;
        self
    }

    pub fn path_tracking(mut self, enable: bool) -> Self {
        self.path_tracking = enable;
        self
    }

    /// Readiness wait in the form epoll expects
    pub(crate) fn poll_timeout_ms(&self) -> i32 {
        self.poll_timeout.as_millis().min(i32::MAX as u128) as i32
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> UmResult<()> {
        if self.continuations && self.stack_size < MIN_STACK_PAGES * PAGE_SIZE {
            return Err(UmError::Config("stack_size must be at least two pages"));
        }
        if self.max_batch_ops == 0 {
            return Err(UmError::Config("max_batch_ops must be > 0"));
        }
        if self.max_batch_bytes == 0 {
            return Err(UmError::Config("max_batch_bytes must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = MountConfig::new();
        assert!(config.continuations);
        assert!(!config.path_tracking);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = MountConfig::new()
            .stack_size(128 * 1024)
            .continuations(false)
            .poll_timeout(Duration::from_millis(5))
            .path_tracking(true);

        assert_eq!(config.stack_size, 128 * 1024);
        assert!(!config.continuations);
        assert_eq!(config.poll_timeout_ms(), 5);
        assert!(config.path_tracking);
    }

    #[test]
    fn test_validation() {
        let config = MountConfig::new().stack_size(PAGE_SIZE);
        assert!(matches!(config.validate(), Err(UmError::Config(_))));

        // stack size is irrelevant without real continuations
        let config = MountConfig::new().stack_size(PAGE_SIZE).continuations(false);
        assert!(config.validate().is_ok());

        let config = MountConfig::new().max_batch_ops(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_env_override() {
        std::env::set_var("UMFS_MAX_BATCH_BYTES", "4096");
        let config = MountConfig::from_env();
        assert_eq!(config.max_batch_bytes, 4096);
        std::env::remove_var("UMFS_MAX_BATCH_BYTES");
    }
}
