//! Frame boundaries and correlation on stream channels
//!
//! The multiplexer never interprets frame contents. A [`Framing`] tells it
//! how many bytes the frame being read still needs, when a frame is
//! complete, and whether an inbound frame answers an outstanding one.

use umfs_core::framebuf::FrameBuffer;

/// Frame-boundary and correlation strategy for a mount's stream channels
pub trait Framing {
    /// Bytes still needed before `frame` may be complete
    ///
    /// Reads never ask for more than this, so bytes of the next frame stay
    /// in the descriptor. Must be non-zero for an incomplete frame.
    fn wanted(&self, frame: &FrameBuffer) -> usize;

    /// Whether enough bytes have arrived to form a whole frame
    fn is_complete(&self, frame: &FrameBuffer) -> bool;

    /// Whether `inbound` is the reply to `outstanding`
    fn matches(&self, inbound: &FrameBuffer, outstanding: &FrameBuffer) -> bool;
}

/// Header of a [`LengthPrefixed`] frame: u32 total length, u64 correlation id
pub const LP_HEADER_LEN: usize = 12;

/// Frames of `[len: u32 LE][id: u64 LE][body]`, `len` covering the header
///
/// A reply carries the id of the request it answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixed;

impl LengthPrefixed {
    /// Build a frame holding `body` under correlation id `id`
    pub fn frame(id: u64, body: &[u8]) -> FrameBuffer {
        let total = (LP_HEADER_LEN + body.len()) as u32;
        let mut bytes = Vec::with_capacity(total as usize);
        bytes.extend_from_slice(&total.to_le_bytes());
        bytes.extend_from_slice(&id.to_le_bytes());
        bytes.extend_from_slice(body);
        FrameBuffer::from_slice(&bytes)
    }

    /// Total length announced by the header, if it has arrived
    pub fn total_len(frame: &FrameBuffer) -> Option<usize> {
        let raw = frame.getdata_at(0, 4).ok()?;
        let len = u32::from_le_bytes(raw.try_into().ok()?) as usize;
        Some(len.max(LP_HEADER_LEN))
    }

    /// Correlation id, if the header has arrived
    pub fn id(frame: &FrameBuffer) -> Option<u64> {
        let raw = frame.getdata_at(4, 8).ok()?;
        Some(u64::from_le_bytes(raw.try_into().ok()?))
    }

    /// Frame body after the header
    pub fn body(frame: &FrameBuffer) -> &[u8] {
        let bytes = frame.as_bytes();
        let end = Self::total_len(frame).unwrap_or(0).min(bytes.len());
        bytes.get(LP_HEADER_LEN..end).unwrap_or(&[])
    }
}

impl Framing for LengthPrefixed {
    fn wanted(&self, frame: &FrameBuffer) -> usize {
        match Self::total_len(frame) {
            Some(total) if frame.len() >= LP_HEADER_LEN => total.saturating_sub(frame.len()),
            _ => LP_HEADER_LEN - frame.len().min(LP_HEADER_LEN),
        }
    }

    fn is_complete(&self, frame: &FrameBuffer) -> bool {
        frame.len() >= LP_HEADER_LEN
            && Self::total_len(frame).is_some_and(|total| frame.len() >= total)
    }

    fn matches(&self, inbound: &FrameBuffer, outstanding: &FrameBuffer) -> bool {
        match (Self::id(inbound), Self::id(outstanding)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let f = LengthPrefixed::frame(42, b"hello");
        assert_eq!(f.len(), LP_HEADER_LEN + 5);
        assert_eq!(LengthPrefixed::total_len(&f), Some(17));
        assert_eq!(LengthPrefixed::id(&f), Some(42));
        assert_eq!(LengthPrefixed::body(&f), b"hello");
    }

    #[test]
    fn test_wanted_tracks_progress() {
        let full = LengthPrefixed::frame(1, &[7u8; 20]);
        let bytes = full.as_bytes();
        let mut fb = FrameBuffer::with_increment(16);

        assert_eq!(LengthPrefixed.wanted(&fb), LP_HEADER_LEN);
        fb.putdata(&bytes[..5]).unwrap();
        assert_eq!(LengthPrefixed.wanted(&fb), LP_HEADER_LEN - 5);
        fb.putdata(&bytes[5..LP_HEADER_LEN]).unwrap();
        assert_eq!(LengthPrefixed.wanted(&fb), 20);
        assert!(!LengthPrefixed.is_complete(&fb));
        fb.putdata(&bytes[LP_HEADER_LEN..]).unwrap();
        assert!(LengthPrefixed.is_complete(&fb));
        assert_eq!(LengthPrefixed.wanted(&fb), 0);
    }

    #[test]
    fn test_matches_on_id() {
        let req = LengthPrefixed::frame(9, b"q");
        assert!(LengthPrefixed.matches(&LengthPrefixed::frame(9, b"answer"), &req));
        assert!(!LengthPrefixed.matches(&LengthPrefixed::frame(8, b"answer"), &req));
        assert!(!LengthPrefixed.matches(&FrameBuffer::from_slice(b"ab"), &req));
    }
}
