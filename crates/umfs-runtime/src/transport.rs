//! Kernel transport
//!
//! The control channel to the kernel is consumed as two batched calls,
//! [`KernelTransport::get_batch`] and [`KernelTransport::put_batch`], plus a
//! descriptor that becomes readable when requests are waiting.
//!
//! [`LoopbackTransport`] is an in-process kernel: requests are injected
//! through a [`LoopbackHandle`], an eventfd signals readiness, and replies
//! are collected per batch.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use nix::errno::Errno;
use umfs_core::error::{UmError, UmResult};
use umfs_core::request::{RawReply, RawRequest};

/// Batched request/reply conduit to the kernel
///
/// `get_batch` returning [`UmError::Unmounted`] or an `ENODEV` OS error
/// means the kernel side is gone; the mount stops.
pub trait KernelTransport {
    /// Descriptor polled for incoming requests
    fn poll_fd(&self) -> RawFd;

    /// Fetch up to `max_ops` requests totalling at most `max_bytes`
    ///
    /// A single request larger than `max_bytes` is still returned alone.
    fn get_batch(&mut self, max_bytes: usize, max_ops: usize) -> UmResult<Vec<RawRequest>>;

    /// Deliver replies in order
    fn put_batch(&mut self, replies: Vec<RawReply>) -> UmResult<()>;
}

/// Owned eventfd used as a level-triggered doorbell
#[derive(Debug)]
struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    fn create() -> UmResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(UmError::Os(Errno::last()));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn signal(&self) -> UmResult<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = Errno::last();
            // counter saturated: a wakeup is already pending
            if err == Errno::EAGAIN {
                return Ok(());
            }
            return Err(UmError::Os(err));
        }
        Ok(())
    }

    /// Reset the counter so the descriptor stops polling readable
    fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    requests: VecDeque<RawRequest>,
    batches: Vec<Vec<RawReply>>,
    unmounted: bool,
    fail_put: Option<Errno>,
}

/// In-process kernel end of a mount
#[derive(Debug)]
pub struct LoopbackTransport {
    shared: Rc<RefCell<Shared>>,
    event: Rc<EventFd>,
}

/// Test/driver end of a [`LoopbackTransport`]
#[derive(Debug, Clone)]
pub struct LoopbackHandle {
    shared: Rc<RefCell<Shared>>,
    event: Rc<EventFd>,
}

impl LoopbackTransport {
    /// Create the transport and the handle that feeds it
    pub fn new() -> UmResult<(LoopbackTransport, LoopbackHandle)> {
        let shared = Rc::new(RefCell::new(Shared::default()));
        let event = Rc::new(EventFd::create()?);
        Ok((
            LoopbackTransport {
                shared: shared.clone(),
                event: event.clone(),
            },
            LoopbackHandle { shared, event },
        ))
    }
}

impl KernelTransport for LoopbackTransport {
    fn poll_fd(&self) -> RawFd {
        self.event.fd.as_raw_fd()
    }

    fn get_batch(&mut self, max_bytes: usize, max_ops: usize) -> UmResult<Vec<RawRequest>> {
        self.event.drain();
        let mut shared = self.shared.borrow_mut();
        if shared.requests.is_empty() && shared.unmounted {
            return Err(UmError::Unmounted);
        }

        let mut batch = Vec::new();
        let mut bytes = 0usize;
        while batch.len() < max_ops {
            let Some(next) = shared.requests.front() else { break };
            let len = next.len as usize;
            if !batch.is_empty() && bytes + len > max_bytes {
                break;
            }
            bytes += len;
            if let Some(req) = shared.requests.pop_front() {
                batch.push(req);
            }
        }

        if !shared.requests.is_empty() || shared.unmounted {
            self.event.signal()?;
        }
        Ok(batch)
    }

    fn put_batch(&mut self, replies: Vec<RawReply>) -> UmResult<()> {
        let mut shared = self.shared.borrow_mut();
        if let Some(errno) = shared.fail_put {
            return Err(UmError::Os(errno));
        }
        if !replies.is_empty() {
            shared.batches.push(replies);
        }
        Ok(())
    }
}

impl LoopbackHandle {
    /// Queue a request for the mount
    pub fn submit(&self, req: RawRequest) -> UmResult<()> {
        self.shared.borrow_mut().requests.push_back(req);
        self.event.signal()
    }

    /// Requests not yet fetched by the mount
    pub fn queued(&self) -> usize {
        self.shared.borrow().requests.len()
    }

    /// Every reply received so far, in delivery order, emptying the store
    pub fn take_replies(&self) -> Vec<RawReply> {
        let batches = std::mem::take(&mut self.shared.borrow_mut().batches);
        batches.into_iter().flatten().collect()
    }

    /// Reply batches received so far, each as delivered
    pub fn take_batches(&self) -> Vec<Vec<RawReply>> {
        std::mem::take(&mut self.shared.borrow_mut().batches)
    }

    /// Make `put_batch` fail with `errno` (or succeed again with `None`)
    pub fn fail_replies(&self, errno: Option<Errno>) {
        self.shared.borrow_mut().fail_put = errno;
    }

    /// Tell the mount the kernel side is gone once queued requests drain
    pub fn unmount(&self) -> UmResult<()> {
        self.shared.borrow_mut().unmounted = true;
        self.event.signal()
    }
}
