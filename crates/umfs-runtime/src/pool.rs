//! `FramePool`: bounded recycling of frame buffers.
//!
//! Channels take their inbound buffers from the pool and handlers may hand
//! spent frames back. Buffers above the pool's size limit are not kept, so
//! one oversized frame does not pin its memory for the life of the mount.

use crossbeam_queue::ArrayQueue;
use umfs_core::constants::FRAMEBUF_INCREMENT;
use umfs_core::framebuf::FrameBuffer;

/// Largest buffer capacity the pool keeps
const MAX_POOLED_CAPACITY: usize = 4 * FRAMEBUF_INCREMENT;

pub struct FramePool {
    /// `None` when pooling is disabled.
    slots: Option<ArrayQueue<FrameBuffer>>,
}

impl FramePool {
    /// Pool keeping up to `depth` spare buffers; 0 disables recycling.
    pub fn new(depth: usize) -> Self {
        Self {
            slots: (depth > 0).then(|| ArrayQueue::new(depth)),
        }
    }

    /// A cleared buffer, recycled when one is available.
    pub fn get(&self) -> FrameBuffer {
        self.slots
            .as_ref()
            .and_then(ArrayQueue::pop)
            .unwrap_or_default()
    }

    /// Hand a buffer back; dropped if the pool is full or it is too large.
    pub fn put(&self, mut frame: FrameBuffer) {
        let Some(slots) = &self.slots else { return };
        if frame.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        frame.clear();
        let _ = slots.push(frame);
    }

    /// Spare buffers currently held.
    pub fn len(&self) -> usize {
        self.slots.as_ref().map_or(0, ArrayQueue::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("enabled", &self.slots.is_some())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycles_cleared_buffers() {
        let pool = FramePool::new(2);
        let mut fb = pool.get();
        fb.putdata(b"stale").unwrap();
        pool.put(fb);
        assert_eq!(pool.len(), 1);

        let fb = pool.get();
        assert!(fb.is_empty());
        assert_eq!(fb.cursor(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_bounded() {
        let pool = FramePool::new(1);
        pool.put(FrameBuffer::new());
        pool.put(FrameBuffer::new());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_disabled_and_oversized() {
        let off = FramePool::new(0);
        off.put(FrameBuffer::new());
        assert_eq!(off.len(), 0);
        assert_eq!(off.get().capacity(), FRAMEBUF_INCREMENT);

        let pool = FramePool::new(4);
        let mut big = FrameBuffer::new();
        big.reserve(0, MAX_POOLED_CAPACITY + 1).unwrap();
        pool.put(big);
        assert!(pool.is_empty());
    }
}
