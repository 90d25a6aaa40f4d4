//! Bounded catch-up buffer for viewers that join mid-session.
//!
//! Holds the most recent post-processed output so a new viewer can rebuild
//! the screen without the shell re-rendering anything.

use crate::markers::strip_widget_blocks;

/// Default cap on retained bytes.
pub const DEFAULT_REPLAY_LIMIT: usize = 64 * 1024;

/// Trailing window of processed terminal output.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    data: Vec<u8>,
    limit: usize,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_REPLAY_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(limit.min(DEFAULT_REPLAY_LIMIT)),
            limit,
        }
    }

    /// Append processed bytes, drop any complete widget blocks that formed
    /// across appends, then keep only the trailing `limit` bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        strip_widget_blocks(&mut self.data);
        if self.data.len() > self.limit {
            let excess = self.data.len() - self.limit;
            self.data.drain(..excess);
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Copy handed to a joining viewer.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::{WIDGET_END, WIDGET_START};

    #[test]
    fn append_and_snapshot() {
        let mut buf = ReplayBuffer::new();
        assert!(buf.is_empty());
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.snapshot(), b"hello world");
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn trims_from_the_front() {
        let mut buf = ReplayBuffer::with_limit(8);
        buf.append(b"0123456789");
        assert_eq!(buf.as_slice(), b"23456789");
        buf.append(b"ab");
        assert_eq!(buf.as_slice(), b"456789ab");
    }

    #[test]
    fn clear_empties() {
        let mut buf = ReplayBuffer::new();
        buf.append(b"data");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.limit(), DEFAULT_REPLAY_LIMIT);
    }

    #[test]
    fn pair_formed_across_appends_is_stripped() {
        let mut buf = ReplayBuffer::new();
        buf.append(b"before");
        buf.append(WIDGET_START);
        buf.append(b"<b>x</b>");
        // dangling start stays until its end arrives
        assert!(buf.as_slice().ends_with(b"<b>x</b>"));
        buf.append(WIDGET_END);
        buf.append(b"after");
        assert_eq!(buf.as_slice(), b"beforeafter");
    }

    #[test]
    fn large_single_append_keeps_tail() {
        let mut buf = ReplayBuffer::with_limit(4);
        buf.append(&[b'x'; 100]);
        buf.append(b"tail");
        assert_eq!(buf.as_slice(), b"tail");
    }
}
