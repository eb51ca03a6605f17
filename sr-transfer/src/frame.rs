//! Wire-format definitions for transfer frames.
//!
//! Every datagram exchanged between peers decodes to exactly one [`Frame`].
//! Two frame families share the channel:
//! - **Control frames** are short UTF-8 strings: `SESSION_START <name> <total>`,
//!   `SESSION_END`, `ACK:<seq>`, plus the rendezvous `HELLO` and the operator
//!   `exit`.
//! - **Data frames** carry one chunk behind a fixed binary header.
//!
//! Encoding and decoding are pure; no I/O happens here.
//!
//! # Data frame layout
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload Length                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flags     |              Payload ...                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 9 bytes.
//!
//! Control frames are recognised by literal prefix before the binary layout
//! is tried.  A data frame whose first four bytes happen to spell a control
//! prefix would need a sequence number above `0x4000_0000`, i.e. a transfer
//! of more than a terabyte at the default chunk size.

use thiserror::Error;

/// Bit-flag constants for the data-frame `flags` byte.
pub mod flags {
    /// This chunk is the last one of the transfer.
    pub const FINAL: u8 = 0b0000_0001;
}

/// Byte length of the fixed data-frame header on the wire.
pub const HEADER_LEN: usize = 9;

/// Default number of source bytes carried by one chunk.
pub const CHUNK_SIZE: usize = 1024;

const OFF_SEQ: usize = 0;
const OFF_LEN: usize = 4;
const OFF_FLAGS: usize = 8;

const START_PREFIX: &[u8] = b"SESSION_START";
const END_PREFIX: &[u8] = b"SESSION_END";
const ACK_PREFIX: &[u8] = b"ACK:";
const HELLO_PREFIX: &[u8] = b"HELLO";
const EXIT_PREFIX: &[u8] = b"exit";

/// One chunk of the source stream as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub seq: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl DataFrame {
    pub fn new(seq: u32, payload: Vec<u8>, is_final: bool) -> Self {
        Self {
            seq,
            flags: if is_final { flags::FINAL } else { 0 },
            payload,
        }
    }

    pub fn is_final(&self) -> bool {
        self.flags & flags::FINAL != 0
    }
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A sender announces a transfer.  `total` is the chunk count; older
    /// peers may omit it.
    Start { name: String, total: Option<u32> },
    /// The sender has seen every chunk acknowledged.
    End,
    /// Selective acknowledgment of exactly one sequence number.
    Ack { seq: u32 },
    Data(DataFrame),
    /// First datagram of a client, used by a listening peer to learn its address.
    Hello,
    /// The remote operator quit.
    Exit,
}

impl Frame {
    /// Serialise this frame into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Start { name, total: Some(total) } => {
                format!("SESSION_START {name} {total}").into_bytes()
            }
            Frame::Start { name, total: None } => format!("SESSION_START {name}").into_bytes(),
            Frame::End => END_PREFIX.to_vec(),
            Frame::Ack { seq } => format!("ACK:{seq}").into_bytes(),
            Frame::Hello => HELLO_PREFIX.to_vec(),
            Frame::Exit => EXIT_PREFIX.to_vec(),
            Frame::Data(data) => {
                let mut buf = vec![0u8; HEADER_LEN + data.payload.len()];
                buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&data.seq.to_be_bytes());
                buf[OFF_LEN..OFF_LEN + 4]
                    .copy_from_slice(&(data.payload.len() as u32).to_be_bytes());
                buf[OFF_FLAGS] = data.flags;
                buf[HEADER_LEN..].copy_from_slice(&data.payload);
                buf
            }
        }
    }

    /// Parse a frame using the default [`CHUNK_SIZE`] payload limit.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        Self::decode_with_limit(buf, CHUNK_SIZE)
    }

    /// Parse a frame, rejecting data frames that declare more than
    /// `max_payload` bytes.
    ///
    /// Bytes past the declared payload length are ignored.
    pub fn decode_with_limit(buf: &[u8], max_payload: usize) -> Result<Self, FrameError> {
        if buf.starts_with(START_PREFIX) {
            return decode_start(&buf[START_PREFIX.len()..]);
        }
        if buf.starts_with(END_PREFIX) {
            return Ok(Frame::End);
        }
        if buf.starts_with(ACK_PREFIX) {
            let text = control_text(&buf[ACK_PREFIX.len()..])?;
            let seq = text
                .trim_end_matches('\0')
                .trim()
                .parse::<u32>()
                .map_err(|_| FrameError::InvalidControl("acknowledged sequence is not a number"))?;
            return Ok(Frame::Ack { seq });
        }
        if buf.starts_with(HELLO_PREFIX) {
            return Ok(Frame::Hello);
        }
        if buf.starts_with(EXIT_PREFIX) {
            return Ok(Frame::Exit);
        }

        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                len: buf.len(),
                need: HEADER_LEN,
            });
        }

        let seq = read_u32(buf, OFF_SEQ);
        let declared = read_u32(buf, OFF_LEN);
        let flags = buf[OFF_FLAGS];

        if declared as usize > max_payload {
            return Err(FrameError::OversizedPayload {
                declared,
                limit: max_payload,
            });
        }
        let end = HEADER_LEN + declared as usize;
        if buf.len() < end {
            return Err(FrameError::Truncated {
                len: buf.len(),
                need: end,
            });
        }

        Ok(Frame::Data(DataFrame {
            seq,
            flags,
            payload: buf[HEADER_LEN..end].to_vec(),
        }))
    }
}

/// Errors that can arise when parsing a raw datagram.
///
/// None of these are fatal: the receiving side drops the datagram and keeps
/// going.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: {len} bytes, need {need}")]
    Truncated { len: usize, need: usize },
    #[error("declared payload of {declared} bytes exceeds limit of {limit}")]
    OversizedPayload { declared: u32, limit: usize },
    #[error("malformed control frame: {0}")]
    InvalidControl(&'static str),
}

/// Returns `true` when `name` can travel in a start frame and be used as a
/// file name on the receiving side.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\\' || c == '\0')
}

fn decode_start(rest: &[u8]) -> Result<Frame, FrameError> {
    let text = control_text(rest)?;
    let mut fields = text.trim_end_matches('\0').split_whitespace();

    let name = fields
        .next()
        .ok_or(FrameError::InvalidControl("start frame without a transfer name"))?;
    if !is_valid_name(name) {
        return Err(FrameError::InvalidControl("transfer name is not a plain file name"));
    }
    let total = match fields.next() {
        Some(t) => Some(
            t.parse::<u32>()
                .map_err(|_| FrameError::InvalidControl("total chunk count is not a number"))?,
        ),
        None => None,
    };

    Ok(Frame::Start {
        name: name.to_string(),
        total,
    })
}

fn control_text(bytes: &[u8]) -> Result<&str, FrameError> {
    std::str::from_utf8(bytes).map_err(|_| FrameError::InvalidControl("control frame is not UTF-8"))
}

#[inline]
fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}
