//! Retransmission deadlines and the tick that re-evaluates them.
//!
//! Selective Repeat keeps one timer per outstanding chunk.  Instead of a
//! task per timer, every occupied send slot stores a [`Deadline`] and the
//! sender wakes on a single [`RetransmitTimer`] tick (the poll interval),
//! re-checking all deadlines at once.  Waiting for the network and checking
//! timers are therefore separate events in the sender's `select!`.
//!
//! All instants are `tokio::time::Instant` so tests can run under a paused
//! clock.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// When a send slot next needs to go on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Never transmitted; due immediately.
    Unsent,
    /// Transmitted; due again at the given instant unless acknowledged.
    At(Instant),
}

impl Deadline {
    pub fn is_due(&self, now: Instant) -> bool {
        match self {
            Deadline::Unsent => true,
            Deadline::At(at) => *at <= now,
        }
    }
}

/// Fixed-timeout retransmission schedule plus the poll tick.
#[derive(Debug)]
pub struct RetransmitTimer {
    rto: Duration,
    tick: Interval,
}

impl RetransmitTimer {
    /// `rto` is the per-chunk timeout; `poll` the tick period.
    pub fn new(rto: Duration, poll: Duration) -> Self {
        let mut tick = interval_at(Instant::now() + poll, poll);
        // A slow disk read must not cause a burst of catch-up ticks.
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { rto, tick }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Deadline for a chunk transmitted at `sent_at`.
    pub fn arm(&self, sent_at: Instant) -> Deadline {
        Deadline::At(sent_at + self.rto)
    }

    /// Wait for the next poll tick and return the tick instant.
    pub async fn tick(&mut self) -> Instant {
        self.tick.tick().await
    }
}
