//! # umfs-core
//!
//! Core types for the umfs userspace filesystem engine.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Stacks, context switching, readiness and transports live in
//! `umfs-runtime`.
//!
//! ## Modules
//!
//! - `id` - continuation, request and cookie identifiers
//! - `state` - continuation and mount states
//! - `error` - error types
//! - `env` - environment variable utilities
//! - `framebuf` - growable frame buffer for stream channels
//! - `request` - kernel request/reply model and opcodes
//! - `path` - path tracking strategies and cookie mapping

pub mod id;
pub mod state;
pub mod error;
pub mod env;
pub mod framebuf;
pub mod request;
pub mod path;

// Re-exports for convenience
pub use id::{ContinuationId, Cookie, RequestId};
pub use state::{ContinuationState, MountState};
pub use error::{UmError, UmResult};
pub use env::{env_get, env_get_bool, env_get_opt};
pub use framebuf::FrameBuffer;
pub use request::{
    AdminOp, CacheOp, ComponentNames, OpClass, Operation, RawReply, RawRequest, Request,
    SetbackFlags, VfsOp, VnOp,
};
pub use path::{CookieMapper, FsPath, IdentityMapper, PathOps, SlashPaths};

/// Re-export so handlers need no direct nix dependency
pub use nix::errno::Errno;

/// Sizing constants
pub mod constants {
    /// Page size assumed for stack sizing
    pub const PAGE_SIZE: usize = 4096;

    /// Smallest accepted continuation stack, in pages
    pub const MIN_STACK_PAGES: usize = 2;

    /// Default continuation stack size (64 KB)
    pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

    /// Frame buffer growth step (64 KB)
    pub const FRAMEBUF_INCREMENT: usize = 64 * 1024;

    /// Default maximum number of requests fetched per batch
    pub const DEFAULT_MAX_BATCH_OPS: usize = 64;

    /// Default maximum number of bytes fetched per batch
    pub const DEFAULT_MAX_BATCH_BYTES: usize = 1024 * 1024;

    /// Default readiness wait, in milliseconds
    pub const DEFAULT_POLL_TIMEOUT_MS: i32 = 1000;

    /// Default number of recycled frame buffers kept per mount
    pub const DEFAULT_FRAME_POOL: usize = 16;
}
