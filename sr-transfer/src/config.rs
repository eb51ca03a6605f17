//! Transfer policy knobs shared by both window managers.
//!
//! None of these values are negotiated on the wire: both peers must be
//! started with the same chunk size, otherwise the receiver rejects data
//! frames as oversized.

use std::time::Duration;

use crate::frame::CHUNK_SIZE;

/// Default number of chunks that may be outstanding at once (W).
pub const WINDOW_SIZE: usize = 8;

/// Default retransmission timeout for an unacknowledged chunk.
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Largest datagram either side will read: one full chunk plus its header
/// and some slack for control frames.
pub const fn max_datagram(chunk_size: usize) -> usize {
    chunk_size + crate::frame::HEADER_LEN + 16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Bytes per chunk.
    pub chunk_size: usize,
    /// Window size W, in chunks.
    pub window_size: usize,
    /// Time after which an unacknowledged chunk is sent again.
    pub rto: Duration,
    /// Upper bound on one wait for an acknowledgment.  Kept well below
    /// `rto` so expired slots are retried promptly.
    pub poll_interval: Duration,
}

impl TransferConfig {
    /// Build a config, deriving the poll interval as a quarter of `rto`.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` or `window_size` is zero.
    pub fn new(chunk_size: usize, window_size: usize, rto: Duration) -> Self {
        assert!(chunk_size >= 1, "chunk_size must be at least 1");
        assert!(window_size >= 1, "window_size must be at least 1");
        Self {
            chunk_size,
            window_size,
            rto,
            poll_interval: (rto / 4).max(Duration::from_millis(1)),
        }
    }

    /// Number of chunks needed to carry `len` source bytes.
    pub fn total_chunks(&self, len: u64) -> u64 {
        len.div_ceil(self.chunk_size as u64)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::new(CHUNK_SIZE, WINDOW_SIZE, RETRANSMIT_TIMEOUT)
    }
}
