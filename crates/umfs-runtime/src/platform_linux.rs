//! Linux platform implementation
//!
//! Readiness multiplexing through epoll, level-triggered. Each registered
//! descriptor carries its own fd number as event data.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use umfs_core::error::{UmError, UmResult};

/// Readiness reported for one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Hang-up or error condition
    pub hangup: bool,
}

/// epoll instance
#[derive(Debug)]
pub struct Poller {
    epfd: OwnedFd,
}

impl Poller {
    pub fn new() -> UmResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(UmError::Os(Errno::last()));
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, readable: bool, writable: bool) -> UmResult<()> {
        let mut events = 0u32;
        if readable {
            events |= libc::EPOLLIN as u32;
        }
        if writable {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(UmError::Os(Errno::last()));
        }
        Ok(())
    }

    /// Start watching `fd`
    pub fn add(&self, fd: RawFd, readable: bool, writable: bool) -> UmResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, readable, writable)
    }

    /// Change the interest set of `fd`
    pub fn modify(&self, fd: RawFd, readable: bool, writable: bool) -> UmResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, readable, writable)
    }

    /// Stop watching `fd`
    pub fn delete(&self, fd: RawFd) -> UmResult<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, false, false)
    }

    /// Wait up to `timeout_ms` (-1 forever, 0 poll) for readiness
    ///
    /// An interrupted wait reports no events.
    pub fn wait(&self, max: usize, timeout_ms: i32) -> UmResult<Vec<Readiness>> {
        let max = max.clamp(1, i32::MAX as usize);
        let mut events: Vec<libc::epoll_event> = Vec::with_capacity(max);
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                max as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = Errno::last();
            if err == Errno::EINTR {
                return Ok(Vec::new());
            }
            return Err(UmError::Os(err));
        }
        unsafe { events.set_len(n as usize) };

        Ok(events
            .iter()
            .map(|ev| {
                let bits = ev.events;
                Readiness {
                    fd: ev.u64 as RawFd,
                    readable: bits & libc::EPOLLIN as u32 != 0,
                    writable: bits & libc::EPOLLOUT as u32 != 0,
                    hangup: bits & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0,
                }
            })
            .collect())
    }
}
