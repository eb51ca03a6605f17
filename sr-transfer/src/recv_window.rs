//! Selective-Repeat receive-side window.
//!
//! [`RecvWindow`] implements the receiver side of Selective Repeat:
//!
//! - Chunks inside `[expected_base, expected_base + W - 1]` are **buffered**,
//!   whatever order they arrive in.
//! - Chunks below the window were already delivered; the caller re-ACKs them
//!   so a sender that lost the original ACK can move on.
//! - Chunks above the window are dropped without an ACK; the sender's timer
//!   brings them back once the window has moved.
//! - [`pop_ready`](RecvWindow::pop_ready) hands out chunks strictly in sequence
//!   order, and only once `expected_base` itself is present.
//!
//! This module only manages state; all socket and sink I/O is the caller's
//! responsibility.

// ---------------------------------------------------------------------------
// RecvWindow
// ---------------------------------------------------------------------------

/// How an inbound data frame was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// Inside the window and new; payload buffered.  ACK it.
    Stored,
    /// Inside the window but already buffered; payload discarded.  ACK it.
    Duplicate,
    /// Below the window (already delivered).  ACK it again, nothing else.
    Stale,
    /// Beyond the window.  Drop it without an ACK.
    OutOfWindow,
}

impl DataOutcome {
    /// Whether the caller should answer with `ACK:<seq>`.
    pub fn should_ack(&self) -> bool {
        !matches!(self, DataOutcome::OutOfWindow)
    }
}

#[derive(Debug, Clone)]
struct RecvSlot {
    seq: u32,
    payload: Vec<u8>,
}

/// Selective-Repeat receive-side state for one transfer.
#[derive(Debug)]
pub struct RecvWindow {
    /// Next sequence number not yet delivered to the sink.
    expected_base: u32,
    window_size: usize,
    /// Arena indexed by `seq % window_size`.
    slots: Vec<Option<RecvSlot>>,
}

impl RecvWindow {
    /// Create a window expecting `expected_base` next (the count of chunks
    /// already delivered by a previous run).
    ///
    /// # Panics
    ///
    /// Panics if `window_size` is zero.
    pub fn new(expected_base: u32, window_size: usize) -> Self {
        assert!(window_size >= 1, "window_size must be at least 1");
        Self {
            expected_base,
            window_size,
            slots: vec![None; window_size],
        }
    }

    pub fn expected_base(&self) -> u32 {
        self.expected_base
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// `true` if `seq` falls inside `[expected_base, expected_base + W - 1]`.
    pub fn in_window(&self, seq: u32) -> bool {
        seq >= self.expected_base
            && u64::from(seq - self.expected_base) < self.window_size as u64
    }

    /// `true` if chunk `seq` is buffered and waiting for delivery.
    pub fn is_buffered(&self, seq: u32) -> bool {
        self.in_window(seq)
            && self.slots[self.index(seq)]
                .as_ref()
                .is_some_and(|s| s.seq == seq)
    }

    /// Number of buffered chunks.
    pub fn buffered(&self) -> usize {
        (0..self.window_size as u64)
            .filter_map(|off| u32::try_from(u64::from(self.expected_base) + off).ok())
            .filter(|&seq| self.is_buffered(seq))
            .count()
    }

    /// Classify and, if eligible, buffer one inbound chunk.
    ///
    /// A duplicate never overwrites the buffered copy.
    pub fn on_data(&mut self, seq: u32, payload: &[u8]) -> DataOutcome {
        if seq < self.expected_base {
            return DataOutcome::Stale;
        }
        if !self.in_window(seq) {
            return DataOutcome::OutOfWindow;
        }
        if self.is_buffered(seq) {
            return DataOutcome::Duplicate;
        }
        let idx = self.index(seq);
        self.slots[idx] = Some(RecvSlot {
            seq,
            payload: payload.to_vec(),
        });
        DataOutcome::Stored
    }

    /// Take the chunk at `expected_base` if it has arrived, advancing the
    /// window by one.  Call in a loop to drain a contiguous run.
    pub fn pop_ready(&mut self) -> Option<Vec<u8>> {
        let idx = self.index(self.expected_base);
        match &self.slots[idx] {
            Some(slot) if slot.seq == self.expected_base => {}
            _ => return None,
        }
        let slot = self.slots[idx].take()?;
        self.expected_base += 1;
        Some(slot.payload)
    }

    #[inline]
    fn index(&self, seq: u32) -> usize {
        seq as usize % self.window_size
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
