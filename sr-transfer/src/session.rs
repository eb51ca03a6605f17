//! Types shared by the sending and receiving pipelines: the per-session error
//! and the reports handed back when a transfer finishes.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::socket::SocketError;

/// Errors that end one transfer session.
///
/// None of these take the peer down; the pipeline that hit the error returns
/// to idle and waits for the next session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Opening, reading, or writing the local file failed.
    #[error("file I/O error: {0}")]
    Io(#[from] io::Error),
    /// The checkpoint could not be read or stored.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    /// The source needs more chunks than a sequence number can count.
    #[error("source needs {chunks} chunks, more than the protocol can number")]
    SourceTooLarge { chunks: u64 },
    /// A stored checkpoint claims more progress than the transfer has chunks.
    #[error("checkpoint {checkpoint} lies beyond the {total} chunks of the transfer")]
    CheckpointBeyondSource { checkpoint: u64, total: u32 },
    /// The file name cannot travel in a start frame.
    #[error("{0:?} is not a transferable file name")]
    InvalidName(String),
    /// The task routing inbound frames has stopped; the channel is gone.
    #[error("datagram channel closed")]
    ChannelClosed,
}

/// Summary of one completed outbound transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub name: String,
    pub total_chunks: u32,
    /// Chunks already confirmed by an earlier run and skipped this time.
    pub resumed_from: u32,
    /// Data frames put on the wire, first sends and resends alike.
    pub transmissions: u64,
    pub retransmissions: u64,
}

/// Summary of one completed inbound transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveReport {
    /// Name announced by the sender.
    pub name: String,
    /// Where the data was written.
    pub path: PathBuf,
    /// Announced chunk count, if the sender gave one.
    pub total_chunks: Option<u32>,
    /// Chunks already on disk when the session started.
    pub resumed_from: u64,
    /// Chunks on disk when the session closed.
    pub delivered: u64,
}
