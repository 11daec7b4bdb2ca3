//! Growable frame buffer
//!
//! A `FrameBuffer` is the transport unit of stream channels. It owns a byte
//! array of `capacity` bytes, a `cursor` (read/write position) and a
//! high-water mark (`len`, bytes actually written).
//!
//! Invariants: `len <= capacity`, `cursor <= capacity`. Capacity grows in
//! whole increments and never shrinks; growth preserves every written byte.

use crate::constants::FRAMEBUF_INCREMENT;
use crate::error::{UmError, UmResult};

/// Growable byte buffer with a cursor
#[derive(Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    /// Backing storage; `data.len()` is the capacity
    data: Vec<u8>,
    /// Read/write position
    cursor: usize,
    /// Bytes actually written (high-water mark)
    hwm: usize,
    /// Growth step
    increment: usize,
}

impl FrameBuffer {
    /// Create a buffer with one default increment of capacity
    pub fn new() -> Self {
        Self::with_increment(FRAMEBUF_INCREMENT)
    }

    /// Create a buffer that grows in steps of `increment` bytes
    ///
    /// The initial capacity is one increment. A zero increment is treated
    /// as one byte.
    pub fn with_increment(increment: usize) -> Self {
        let increment = increment.max(1);
        Self {
            data: vec![0; increment],
            cursor: 0,
            hwm: 0,
            increment,
        }
    }

    /// Create a buffer holding `bytes`, cursor at the start
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut fb = Self::new();
        // A fresh buffer can always take the bytes unless allocation fails,
        // in which case the process aborts like any Vec allocation.
        let cap = fb.rounded(bytes.len());
        fb.data.resize(cap.max(fb.increment), 0);
        fb.data[..bytes.len()].copy_from_slice(bytes);
        fb.hwm = bytes.len();
        fb
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// High-water mark: number of bytes written
    #[inline]
    pub fn len(&self) -> usize {
        self.hwm
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hwm == 0
    }

    #[inline]
    pub fn increment(&self) -> usize {
        self.increment
    }

    /// Bytes between the cursor and the high-water mark
    #[inline]
    pub fn remaining(&self) -> usize {
        self.hwm.saturating_sub(self.cursor)
    }

    /// Smallest whole-increment capacity holding `needed` bytes
    fn rounded(&self, needed: usize) -> usize {
        needed.div_ceil(self.increment) * self.increment
    }

    /// Make sure `offset + size` bytes fit, growing by whole increments
    pub fn reserve(&mut self, offset: usize, size: usize) -> UmResult<()> {
        let needed = offset
            .checked_add(size)
            .ok_or(UmError::BufferGrowth { requested: usize::MAX })?;
        if needed <= self.capacity() {
            return Ok(());
        }

        let new_cap = self.rounded(needed);
        self.data
            .try_reserve_exact(new_cap - self.data.len())
            .map_err(|_| UmError::BufferGrowth { requested: new_cap })?;
        self.data.resize(new_cap, 0);
        Ok(())
    }

    /// Write `bytes` at the cursor and advance it
    pub fn putdata(&mut self, bytes: &[u8]) -> UmResult<()> {
        let at = self.cursor;
        self.putdata_at(at, bytes)?;
        self.cursor = at + bytes.len();
        Ok(())
    }

    /// Write `bytes` at `offset` without moving the cursor
    pub fn putdata_at(&mut self, offset: usize, bytes: &[u8]) -> UmResult<()> {
        self.reserve(offset, bytes.len())?;
        let end = offset + bytes.len();
        self.data[offset..end].copy_from_slice(bytes);
        self.hwm = self.hwm.max(end);
        Ok(())
    }

    /// Copy `dst.len()` bytes from the cursor and advance it
    pub fn getdata(&mut self, dst: &mut [u8]) -> UmResult<()> {
        let src = self.getdata_at(self.cursor, dst.len())?;
        dst.copy_from_slice(src);
        self.cursor += dst.len();
        Ok(())
    }

    /// Borrow `len` written bytes starting at `offset`
    pub fn getdata_at(&self, offset: usize, len: usize) -> UmResult<&[u8]> {
        match offset.checked_add(len) {
            Some(end) if end <= self.hwm => Ok(&self.data[offset..end]),
            _ => Err(UmError::OutOfBounds {
                offset,
                len,
                limit: self.hwm,
            }),
        }
    }

    /// Move the cursor, growing the buffer if `pos` is past the capacity
    pub fn seek(&mut self, pos: usize) -> UmResult<()> {
        self.reserve(0, pos)?;
        self.cursor = pos;
        Ok(())
    }

    /// Move the cursor to the start
    #[inline]
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Advance the cursor by `n` bytes, clamped to the high-water mark
    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.hwm);
    }

    /// Written bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.hwm]
    }

    /// Written bytes not yet consumed (cursor..hwm)
    #[inline]
    pub fn unread(&self) -> &[u8] {
        &self.data[self.cursor.min(self.hwm)..self.hwm]
    }

    /// Writable space of exactly `want` bytes past the high-water mark
    ///
    /// Call [`commit`](Self::commit) with the number of bytes filled in.
    pub fn spare(&mut self, want: usize) -> UmResult<&mut [u8]> {
        self.reserve(self.hwm, want)?;
        let start = self.hwm;
        Ok(&mut self.data[start..start + want])
    }

    /// Account for `n` bytes written through [`spare`](Self::spare)
    #[inline]
    pub fn commit(&mut self, n: usize) {
        self.hwm = (self.hwm + n).min(self.capacity());
    }

    /// Forget contents, keep capacity
    pub fn clear(&mut self) {
        self.cursor = 0;
        self.hwm = 0;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("capacity", &self.capacity())
            .field("cursor", &self.cursor)
            .field("len", &self.hwm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_putdata_grows_past_initial_capacity() {
        let mut fb = FrameBuffer::new();
        assert_eq!(fb.capacity(), 64 * 1024);

        let data = pattern(150 * 1024, 7);
        for chunk in data.chunks(10_000) {
            fb.putdata(chunk).unwrap();
        }

        assert_eq!(fb.len(), 150 * 1024);
        assert_eq!(fb.capacity(), 192 * 1024);
        assert_eq!(fb.as_bytes(), &data[..]);
        assert!(fb.len() <= fb.capacity());
        assert!(fb.cursor() <= fb.capacity());
    }

    #[test]
    fn test_growth_preserves_earlier_ranges() {
        let mut fb = FrameBuffer::with_increment(16);
        fb.putdata(b"hello").unwrap();
        fb.reserve(100, 20).unwrap();
        assert_eq!(fb.capacity(), 128);
        fb.putdata_at(40, b"world").unwrap();
        fb.reserve(0, 500).unwrap();

        assert_eq!(fb.getdata_at(0, 5).unwrap(), b"hello");
        assert_eq!(fb.getdata_at(40, 5).unwrap(), b"world");
        assert_eq!(fb.len(), 45);
    }

    #[test]
    fn test_reserve_never_shrinks() {
        let mut fb = FrameBuffer::with_increment(8);
        fb.reserve(0, 30).unwrap();
        assert_eq!(fb.capacity(), 32);
        fb.reserve(0, 4).unwrap();
        assert_eq!(fb.capacity(), 32);
        fb.clear();
        assert_eq!(fb.capacity(), 32);
    }

    #[test]
    fn test_reserve_overflow_is_error() {
        let mut fb = FrameBuffer::with_increment(8);
        let err = fb.reserve(usize::MAX, 2).unwrap_err();
        assert!(err.is_resource());
        assert_eq!(fb.capacity(), 8);
    }

    #[test]
    fn test_getdata_advances_cursor() {
        let mut fb = FrameBuffer::from_slice(b"abcdef");
        let mut out = [0u8; 4];
        fb.getdata(&mut out).unwrap();
        assert_eq!(&out, b"abcd");
        assert_eq!(fb.cursor(), 4);
        assert_eq!(fb.unread(), b"ef");

        let mut big = [0u8; 3];
        assert!(matches!(
            fb.getdata(&mut big),
            Err(UmError::OutOfBounds { offset: 4, len: 3, limit: 6 })
        ));
    }

    #[test]
    fn test_spare_and_commit() {
        let mut fb = FrameBuffer::with_increment(4);
        fb.spare(6).unwrap().copy_from_slice(b"xyzuvw");
        fb.commit(6);
        assert_eq!(fb.as_bytes(), b"xyzuvw");
        assert_eq!(fb.capacity(), 8);
    }

    #[test]
    fn test_seek_past_capacity_grows() {
        let mut fb = FrameBuffer::with_increment(10);
        fb.seek(25).unwrap();
        assert_eq!(fb.cursor(), 25);
        assert_eq!(fb.capacity(), 30);
        assert_eq!(fb.len(), 0);
    }
}
