//! Stream channels
//!
//! One `StreamChannel` per registered descriptor. It owns:
//! - the outbound FIFO of frames not yet fully written,
//! - the FIFO of written frames awaiting a correlated reply,
//! - at most one inbound frame being reassembled.
//!
//! A frame is owned by exactly one of these places at any time. I/O goes
//! through `Read`/`Write` so the channel logic runs the same against a raw
//! descriptor ([`FdIo`]) or an in-memory peer.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use umfs_core::error::{UmError, UmResult};
use umfs_core::framebuf::FrameBuffer;
use umfs_core::id::ContinuationId;

use crate::framing::Framing;
use crate::pool::FramePool;
use crate::Usermount;

/// Callback run when a reply is matched, or when its frame is lost
pub type Callback = Box<dyn FnOnce(&Usermount, UmResult<FrameBuffer>)>;

/// Who is told about the reply to an outbound frame
pub enum Waiter {
    /// Suspended continuation, rescheduled with the reply
    Continuation(ContinuationId),
    /// Callback invoked with the reply
    Callback(Callback),
    /// Nobody; the frame is discarded once written
    NoReply,
}

impl Waiter {
    #[inline]
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Waiter::NoReply)
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Waiter::Continuation(id) => write!(f, "Continuation({})", id),
            Waiter::Callback(_) => f.write_str("Callback"),
            Waiter::NoReply => f.write_str("NoReply"),
        }
    }
}

/// A frame tied to whoever waits for its reply
#[derive(Debug)]
pub struct Pending {
    pub frame: FrameBuffer,
    pub waiter: Waiter,
}

/// Frames thrown away by [`StreamChannel::discard_all`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Discarded {
    pub outbound: usize,
    pub awaiting: usize,
    /// In-progress inbound frame (0 or 1)
    pub partial: usize,
}

impl Discarded {
    pub fn total(&self) -> usize {
        self.outbound + self.awaiting + self.partial
    }
}

/// Result of draining readable bytes
#[derive(Debug, Default)]
pub struct Ingest {
    /// Frames completed in arrival order, paired with their waiter if one
    /// matched
    pub completed: Vec<(FrameBuffer, Option<Waiter>)>,
    /// Bytes read
    pub bytes: usize,
    /// End of stream or read error
    pub gone: Option<Option<Errno>>,
}

/// Result of writing queued frames
#[derive(Debug, Default)]
pub struct Flush {
    /// Frames fully written
    pub sent: usize,
    /// Write error; the channel is now write-gone
    pub error: Option<Errno>,
    /// Waiters of frames that can no longer be sent
    pub failed: Vec<Waiter>,
}

/// Per-descriptor queues
pub struct StreamChannel {
    fd: RawFd,
    outbound: VecDeque<Pending>,
    awaiting: VecDeque<Pending>,
    inbound: Option<FrameBuffer>,
    read_gone: bool,
    write_gone: bool,
    /// Interest registered with the poller as (read, write); `None` when
    /// the descriptor is not registered
    pub(crate) interest: Option<(bool, bool)>,
}

impl StreamChannel {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            outbound: VecDeque::new(),
            awaiting: VecDeque::new(),
            inbound: None,
            read_gone: false,
            write_gone: false,
            interest: None,
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn awaiting_len(&self) -> usize {
        self.awaiting.len()
    }

    pub fn has_partial(&self) -> bool {
        self.inbound.is_some()
    }

    pub fn is_read_gone(&self) -> bool {
        self.read_gone
    }

    pub fn is_write_gone(&self) -> bool {
        self.write_gone
    }

    /// Whether write readiness is of interest
    pub fn needs_write(&self) -> bool {
        !self.write_gone && !self.outbound.is_empty()
    }

    /// Interest the poller should hold for this channel
    pub(crate) fn desired_interest(&self) -> Option<(bool, bool)> {
        let read = !self.read_gone;
        let write = self.needs_write();
        (read || write).then_some((read, write))
    }

    /// Queue a frame for sending, from its first byte
    pub fn enqueue(&mut self, mut frame: FrameBuffer, waiter: Waiter) -> UmResult<()> {
        if self.write_gone {
            return Err(UmError::WriteGone {
                fd: self.fd,
                errno: Errno::EPIPE,
            });
        }
        frame.rewind();
        self.outbound.push_back(Pending { frame, waiter });
        Ok(())
    }

    /// Write queued frames in FIFO order until the writer would block
    ///
    /// A frame's cursor records how much of it is on the wire; a partially
    /// written frame stays at the head and resumes from there. Sent frames
    /// nobody waits on go back to `pool`.
    pub fn flush<W: Write>(&mut self, writer: &mut W, pool: &FramePool) -> Flush {
        let mut out = Flush::default();
        while let Some(head) = self.outbound.front_mut() {
            match writer.write(head.frame.unread()) {
                Ok(0) => {
                    self.fail_writes(Errno::EPIPE, &mut out);
                    break;
                }
                Ok(n) => {
                    head.frame.advance(n);
                    if head.frame.remaining() > 0 {
                        continue;
                    }
                    out.sent += 1;
                    if let Some(done) = self.outbound.pop_front() {
                        if done.waiter.expects_reply() {
                            self.awaiting.push_back(done);
                        } else {
                            pool.put(done.frame);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail_writes(io_errno(&e), &mut out);
                    break;
                }
            }
        }
        out
    }

    fn fail_writes(&mut self, errno: Errno, out: &mut Flush) {
        self.write_gone = true;
        out.error = Some(errno);
        out.failed
            .extend(self.outbound.drain(..).map(|p| p.waiter).filter(Waiter::expects_reply));
    }

    /// Read until the reader would block, completing and matching frames
    ///
    /// Reads are bounded by [`Framing::wanted`], so each completed frame
    /// holds exactly its own bytes however the stream was split. They are
    /// also bounded by the frame's free capacity, or one increment when it
    /// is full, so a frame grows only as its bytes arrive.
    pub fn ingest<R: Read>(&mut self, reader: &mut R, framing: &dyn Framing, pool: &FramePool) -> Ingest {
        let mut out = Ingest::default();
        if self.read_gone {
            return out;
        }
        loop {
            let frame = self.inbound.get_or_insert_with(|| pool.get());
            let room = frame.capacity().saturating_sub(frame.len());
            let step = if room > 0 { room } else { frame.increment() };
            let want = framing.wanted(frame).max(1).min(step);
            let buf = match frame.spare(want) {
                Ok(buf) => buf,
                Err(e) => {
                    tracing::warn!(fd = self.fd, error = %e, "inbound frame cannot grow");
                    self.read_gone = true;
                    out.gone = Some(Some(e.errno()));
                    break;
                }
            };
            match reader.read(buf) {
                Ok(0) => {
                    self.read_gone = true;
                    out.gone = Some(None);
                    break;
                }
                Ok(n) => {
                    frame.commit(n);
                    out.bytes += n;
                    if framing.is_complete(frame) {
                        if let Some(done) = self.inbound.take() {
                            let waiter = self.take_match(&done, framing, pool);
                            out.completed.push((done, waiter));
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.read_gone = true;
                    out.gone = Some(Some(io_errno(&e)));
                    break;
                }
            }
        }
        if self.inbound.as_ref().is_some_and(FrameBuffer::is_empty) {
            if let Some(empty) = self.inbound.take() {
                pool.put(empty);
            }
        }
        out
    }

    /// Remove and return the waiter of the first outstanding frame that
    /// `inbound` answers, scanning in send order
    fn take_match(&mut self, inbound: &FrameBuffer, framing: &dyn Framing, pool: &FramePool) -> Option<Waiter> {
        let pos = self
            .awaiting
            .iter()
            .position(|p| framing.matches(inbound, &p.frame))?;
        let answered = self.awaiting.remove(pos)?;
        pool.put(answered.frame);
        Some(answered.waiter)
    }

    /// Drop every queued frame, returning the counts and the waiters to wake
    pub fn discard_all(&mut self) -> (Discarded, Vec<Waiter>) {
        let counts = Discarded {
            outbound: self.outbound.len(),
            awaiting: self.awaiting.len(),
            partial: usize::from(self.inbound.is_some()),
        };
        self.inbound = None;
        let waiters = self
            .outbound
            .drain(..)
            .chain(self.awaiting.drain(..))
            .map(|p| p.waiter)
            .filter(Waiter::expects_reply)
            .collect();
        (counts, waiters)
    }
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("fd", &self.fd)
            .field("outbound", &self.outbound.len())
            .field("awaiting", &self.awaiting.len())
            .field("partial", &self.inbound.is_some())
            .field("read_gone", &self.read_gone)
            .field("write_gone", &self.write_gone)
            .finish()
    }
}

fn io_errno(e: &io::Error) -> Errno {
    e.raw_os_error().map_or(Errno::EIO, Errno::from_raw)
}

/// Non-owning `Read`/`Write` over a raw descriptor
#[derive(Debug, Clone, Copy)]
pub struct FdIo(pub RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
