//! Session state machines.
//!
//! The transitions live in [`crate::sender`] and [`crate::receiver`]; this
//! module only names the states so they can be logged and asserted on.

use std::fmt;

/// Lifecycle of one outbound file transfer.
///
/// ```text
/// Idle ──START sent──▶ Streaming ──last chunk sent──▶ Draining ──all ACKed──▶ Done
///                          │                              │
///                          └───────── fatal error ────────┴──────────────▶ Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderState {
    /// No file selected.
    #[default]
    Idle,
    /// Chunks remain to be read from the source.
    Streaming,
    /// Every chunk has been sent at least once; waiting for the last ACKs.
    Draining,
    /// `base == total`; `SESSION_END` sent.
    Done,
    /// The transport or checkpoint store failed.  Progress up to the last
    /// stored checkpoint survives.
    Aborted,
}

/// Lifecycle of one inbound file transfer.
///
/// ```text
/// Idle ──SESSION_START──▶ Receiving ──all chunks delivered / SESSION_END──▶ Closed
///  ▲                                                                          │
///  └─────────────────────────────── SESSION_START (new file) ─────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiverState {
    #[default]
    Idle,
    /// A sink is open and data frames are accepted.
    Receiving,
    /// The sink has been closed.  Stale data is still acknowledged.
    Closed,
}

impl fmt::Display for SenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SenderState::Idle => "idle",
            SenderState::Streaming => "streaming",
            SenderState::Draining => "draining",
            SenderState::Done => "done",
            SenderState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReceiverState::Idle => "idle",
            ReceiverState::Receiving => "receiving",
            ReceiverState::Closed => "closed",
        };
        f.write_str(s)
    }
}
