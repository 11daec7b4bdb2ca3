//! Path tracking strategies
//!
//! When path tracking is enabled the dispatcher keeps a full path per node.
//! How paths are built, compared and rewritten is pluggable through
//! [`PathOps`]; [`SlashPaths`] is the stock `/`-separated implementation.
//! [`CookieMapper`] translates kernel cookies into node keys.

use core::fmt;
use nix::errno::Errno;

use crate::id::Cookie;

/// Default longest path accepted by [`SlashPaths`]
pub const DEFAULT_PATH_MAX: usize = 1024;

/// Full path of a node
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct FsPath(Vec<u8>);

impl FsPath {
    /// The mount root
    pub fn root() -> Self {
        FsPath(b"/".to_vec())
    }

    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        FsPath(bytes.into())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FsPath({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Path construction and comparison strategy
pub trait PathOps {
    /// Build the path of `name` inside `parent`
    fn build(&self, parent: &FsPath, name: &[u8]) -> Result<FsPath, Errno>;

    /// Whether `path` is `prefix` itself or lies underneath it
    fn is_under(&self, path: &FsPath, prefix: &FsPath) -> bool;

    /// Rewrite `path` so that its `old_prefix` part becomes `new_prefix`
    fn rebase(&self, path: &FsPath, old_prefix: &FsPath, new_prefix: &FsPath) -> Result<FsPath, Errno>;

    /// Give back a path that will not be used any more
    fn release(&self, path: FsPath) {
        drop(path);
    }
}

/// `/`-separated paths bounded by a maximum length
#[derive(Debug, Clone, Copy)]
pub struct SlashPaths {
    max_len: usize,
}

impl SlashPaths {
    pub const fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    fn check_len(&self, len: usize) -> Result<(), Errno> {
        if len > self.max_len {
            Err(Errno::ENAMETOOLONG)
        } else {
            Ok(())
        }
    }
}

impl Default for SlashPaths {
    fn default() -> Self {
        Self::new(DEFAULT_PATH_MAX)
    }
}

impl PathOps for SlashPaths {
    fn build(&self, parent: &FsPath, name: &[u8]) -> Result<FsPath, Errno> {
        if name.is_empty() || name.contains(&b'/') {
            return Err(Errno::EINVAL);
        }
        let parent = parent.as_bytes();
        let sep = usize::from(!parent.ends_with(b"/"));
        self.check_len(parent.len() + sep + name.len())?;

        let mut out = Vec::with_capacity(parent.len() + sep + name.len());
        out.extend_from_slice(parent);
        if sep == 1 {
            out.push(b'/');
        }
        out.extend_from_slice(name);
        Ok(FsPath(out))
    }

    fn is_under(&self, path: &FsPath, prefix: &FsPath) -> bool {
        let (p, pre) = (path.as_bytes(), prefix.as_bytes());
        if !p.starts_with(pre) {
            return false;
        }
        p.len() == pre.len() || pre.ends_with(b"/") || p[pre.len()] == b'/'
    }

    fn rebase(&self, path: &FsPath, old_prefix: &FsPath, new_prefix: &FsPath) -> Result<FsPath, Errno> {
        if !self.is_under(path, old_prefix) {
            return Err(Errno::EINVAL);
        }
        let tail = &path.as_bytes()[old_prefix.len()..];
        self.check_len(new_prefix.len() + tail.len())?;

        let mut out = Vec::with_capacity(new_prefix.len() + tail.len());
        out.extend_from_slice(new_prefix.as_bytes());
        out.extend_from_slice(tail);
        Ok(FsPath(out))
    }
}

/// Translation from kernel cookies to node keys
pub trait CookieMapper {
    fn to_node(&self, cookie: Cookie) -> Cookie;
}

/// Cookies are node keys
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl CookieMapper for IdentityMapper {
    #[inline]
    fn to_node(&self, cookie: Cookie) -> Cookie {
        cookie
    }
}

impl<F> CookieMapper for F
where
    F: Fn(Cookie) -> Cookie,
{
    fn to_node(&self, cookie: Cookie) -> Cookie {
        self(cookie)
    }
}
