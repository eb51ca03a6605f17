//! Selective-Repeat send-side window.
//!
//! [`SendWindow`] keeps up to `W` chunks outstanding.  Unlike Go-Back-N, every
//! chunk is acknowledged individually and only the chunks whose own deadline
//! expired are sent again.
//!
//! # Protocol contract
//!
//! - At most `window_size` chunks occupy the window at once, always the
//!   contiguous run `[base, next_seq)`.
//! - ACKs are **selective**: `ACK:K` confirms chunk `K` only.
//! - `base` advances only over a contiguous prefix of acknowledged chunks.
//! - A chunk's payload is read once and resent byte-for-byte on every
//!   retransmission.
//!
//! Slots live in an arena indexed by `seq % window_size`; sliding the window
//! moves no data.  A slot is valid for `seq` only if it stores that exact
//! sequence number and `seq` lies inside `[base, next_seq)`.
//!
//! This module only manages state; all socket I/O is the caller's responsibility.

use std::io::{self, Read};

use tokio::time::Instant;

use crate::frame::DataFrame;
use crate::timer::Deadline;

// ---------------------------------------------------------------------------
// SendSlot
// ---------------------------------------------------------------------------

/// One outstanding chunk.
#[derive(Debug, Clone)]
pub struct SendSlot {
    pub seq: u32,
    pub payload: Vec<u8>,
    /// When the chunk is next due on the wire.
    pub deadline: Deadline,
    /// Number of transmissions so far (0 until first sent).
    pub tx_count: u32,
    pub acked: bool,
}

impl SendSlot {
    /// Sent at least once and still waiting for its ACK.
    pub fn in_flight(&self) -> bool {
        self.tx_count > 0 && !self.acked
    }
}

/// Result of feeding one acknowledgment to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ACK was new and `base` moved forward by `slid` chunks.
    Advanced { slid: u32 },
    /// The ACK was new but an earlier chunk is still missing.
    Marked,
    /// Duplicate, below the window, or never sent.
    Ignored,
}

// ---------------------------------------------------------------------------
// SendWindow
// ---------------------------------------------------------------------------

/// Selective-Repeat send-side state for one transfer.
///
/// # Sequence-number layout
///
/// ```text
///  base            next_seq              total
///    │                 │                    │
///  ──┼─────────────────┼────────────────────┼──▶ seq space
///    │<── in window ──▶│<──── unread ──────▶│
/// ```
#[derive(Debug)]
pub struct SendWindow {
    /// Lowest unacknowledged sequence number (left window edge).
    base: u32,
    /// Sequence number the next chunk read from the source will get.
    next_seq: u32,
    /// Chunk count announced in the start frame.
    total: u32,
    window_size: usize,
    slots: Vec<Option<SendSlot>>,
}

impl SendWindow {
    /// Create a window starting at `base` (chunks already confirmed by a
    /// previous run) for a transfer of `total` chunks.
    ///
    /// # Panics
    ///
    /// Panics if `window_size` is zero or `base > total`.
    pub fn new(base: u32, total: u32, window_size: usize) -> Self {
        assert!(window_size >= 1, "window_size must be at least 1");
        assert!(base <= total, "base {base} beyond total {total}");
        Self {
            base,
            next_seq: base,
            total,
            window_size,
            slots: vec![None; window_size],
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Every chunk has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.base == self.total
    }

    /// Number of occupied slots (`k` in `[base, base+k)`).
    pub fn occupied(&self) -> usize {
        (self.next_seq - self.base) as usize
    }

    /// Number of chunks sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|s| s.in_flight())
            .count()
    }

    /// `true` when a free slot exists and unread chunks remain.
    pub fn has_room(&self) -> bool {
        self.next_seq < self.total && self.occupied() < self.window_size
    }

    /// Place the next chunk into the window and return its sequence number.
    ///
    /// # Panics
    ///
    /// Panics in debug mode if there is no room.  Check [`has_room`](Self::has_room)
    /// before calling.
    pub fn push(&mut self, payload: Vec<u8>) -> u32 {
        debug_assert!(
            self.has_room(),
            "push on a full send window ({} / {})",
            self.occupied(),
            self.window_size
        );
        let seq = self.next_seq;
        let idx = self.index(seq);
        self.slots[idx] = Some(SendSlot {
            seq,
            payload,
            deadline: Deadline::Unsent,
            tx_count: 0,
            acked: false,
        });
        self.next_seq += 1;
        seq
    }

    /// Read chunks from `source` until the window is full or every chunk of
    /// the transfer has been read.  Returns the number of chunks added.
    ///
    /// `source` must already be positioned at chunk `next_seq`.  A source that
    /// ends before `total` chunks were produced is an error.
    pub fn fill<R: Read>(&mut self, source: &mut R, chunk_size: usize) -> io::Result<usize> {
        let mut added = 0;
        while self.has_room() {
            let chunk = read_chunk(source, chunk_size)?;
            if chunk.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "source ended at chunk {} of {}",
                        self.next_seq, self.total
                    ),
                ));
            }
            self.push(chunk);
            added += 1;
        }
        Ok(added)
    }

    /// Look up the live slot for `seq`, if any.
    pub fn slot(&self, seq: u32) -> Option<&SendSlot> {
        if seq < self.base || seq >= self.next_seq {
            return None;
        }
        self.slots[self.index(seq)]
            .as_ref()
            .filter(|slot| slot.seq == seq)
    }

    /// Sequence numbers of unacknowledged chunks due for (re)transmission at
    /// `now`, lowest first.
    pub fn due(&self, now: Instant) -> Vec<u32> {
        (self.base..self.next_seq)
            .filter(|&seq| {
                self.slot(seq)
                    .is_some_and(|s| !s.acked && s.deadline.is_due(now))
            })
            .collect()
    }

    /// `true` if any chunk due at `now` has been on the wire before.
    pub fn resend_due(&self, now: Instant) -> bool {
        self.due(now)
            .into_iter()
            .any(|seq| self.slot(seq).is_some_and(|s| s.tx_count > 0))
    }

    /// Forget the acknowledgments held above `base` and make those chunks
    /// due again.  Returns how many were reopened.
    ///
    /// A receiver that restarted lost whatever it had buffered out of order,
    /// so an ACK above the gap no longer proves the chunk will be delivered.
    pub fn reopen_held(&mut self) -> usize {
        let mut reopened = 0;
        for slot in self.slots.iter_mut().flatten() {
            if slot.acked {
                slot.acked = false;
                slot.deadline = Deadline::Unsent;
                reopened += 1;
            }
        }
        reopened
    }

    /// Data frame for chunk `seq`, carrying the final flag on the last chunk.
    pub fn frame(&self, seq: u32) -> Option<DataFrame> {
        self.slot(seq)
            .map(|s| DataFrame::new(seq, s.payload.clone(), seq + 1 == self.total))
    }

    /// Record a successful transmission of `seq` with its next deadline.
    pub fn mark_sent(&mut self, seq: u32, deadline: Deadline) {
        if let Some(slot) = self.slot_mut(seq) {
            slot.tx_count += 1;
            slot.deadline = deadline;
        }
    }

    /// Process `ACK:<seq>`.
    ///
    /// Marks the chunk acknowledged, then slides `base` over every
    /// acknowledged chunk at the left edge.  Acknowledging an unknown or
    /// already-acknowledged sequence changes nothing.
    pub fn on_ack(&mut self, seq: u32) -> AckOutcome {
        match self.slot_mut(seq) {
            Some(slot) if slot.tx_count > 0 && !slot.acked => slot.acked = true,
            _ => return AckOutcome::Ignored,
        }

        let mut slid = 0u32;
        loop {
            let idx = self.index(self.base);
            match &self.slots[idx] {
                Some(slot) if slot.seq == self.base && slot.acked => {
                    self.slots[idx] = None;
                    self.base += 1;
                    slid += 1;
                }
                _ => break,
            }
        }

        if slid > 0 {
            AckOutcome::Advanced { slid }
        } else {
            AckOutcome::Marked
        }
    }

    fn slot_mut(&mut self, seq: u32) -> Option<&mut SendSlot> {
        if seq < self.base || seq >= self.next_seq {
            return None;
        }
        let idx = self.index(seq);
        self.slots[idx].as_mut().filter(|slot| slot.seq == seq)
    }

    #[inline]
    fn index(&self, seq: u32) -> usize {
        seq as usize % self.window_size
    }
}

/// Read up to `chunk_size` bytes, retrying short reads until the chunk is
/// full or the source is exhausted.
fn read_chunk<R: Read>(source: &mut R, chunk_size: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(chunk_size);
    source.take(chunk_size as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
