//! Per-mount counters

use std::cell::Cell;

/// Running totals of a mount's activity
#[derive(Debug, Default)]
pub struct MountStats {
    requests: Cell<u64>,
    replies: Cell<u64>,
    fire_and_forget: Cell<u64>,
    suspends: Cell<u64>,
    frames_sent: Cell<u64>,
    frames_received: Cell<u64>,
    protocol_errors: Cell<u64>,
    handler_panics: Cell<u64>,
}

/// Point-in-time copy of [`MountStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub replies: u64,
    pub fire_and_forget: u64,
    pub suspends: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub protocol_errors: u64,
    pub handler_panics: u64,
}

#[inline]
fn bump(c: &Cell<u64>, n: u64) {
    c.set(c.get().wrapping_add(n));
}

impl MountStats {
    pub fn request(&self) {
        bump(&self.requests, 1);
    }

    pub fn reply(&self) {
        bump(&self.replies, 1);
    }

    pub fn fire_and_forget(&self) {
        bump(&self.fire_and_forget, 1);
    }

    pub fn suspend(&self) {
        bump(&self.suspends, 1);
    }

    pub fn frames_sent(&self, n: usize) {
        bump(&self.frames_sent, n as u64);
    }

    pub fn frame_received(&self) {
        bump(&self.frames_received, 1);
    }

    pub fn protocol_error(&self) {
        bump(&self.protocol_errors, 1);
    }

    pub fn handler_panic(&self) {
        bump(&self.handler_panics, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.get(),
            replies: self.replies.get(),
            fire_and_forget: self.fire_and_forget.get(),
            suspends: self.suspends.get(),
            frames_sent: self.frames_sent.get(),
            frames_received: self.frames_received.get(),
            protocol_errors: self.protocol_errors.get(),
            handler_panics: self.handler_panics.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let s = MountStats::default();
        s.request();
        s.request();
        s.reply();
        s.frames_sent(3);
        let snap = s.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.replies, 1);
        assert_eq!(snap.frames_sent, 3);
        assert_eq!(snap.protocol_errors, 0);
    }
}
