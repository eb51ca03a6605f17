//! `sr-transfer` — resumable file transfer over UDP using Selective Repeat.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────────┐   DATA (seq, len, flags)   ┌────────────────┐
//!  │    Sender     │───────────────────────────▶│    Receiver    │
//!  │  SendWindow   │                            │   RecvWindow   │
//!  └──┬─────────▲──┘          ACK:<seq>         └──┬──────────┬──┘
//!     │         └──────────────────────────────────┘          │
//!     │ base                                        delivered │
//!  ┌──▼───────────────────────────────────────────────────────▼──┐
//!  │                     CheckpointStore                         │
//!  └─────────────────────────────────────────────────────────────┘
//!
//!  Sender + Receiver + dispatcher = Peer (full duplex over one Datagram)
//! ```
//!
//! Each module has a single responsibility:
//! - [`frame`]        — wire format: text control frames and binary data frames
//! - [`config`]       — chunk size, window, retransmission timeout
//! - [`timer`]        — per-chunk deadlines and the poll tick
//! - [`send_window`]  — Selective-Repeat outbound window
//! - [`recv_window`]  — Selective-Repeat inbound reorder buffer
//! - [`checkpoint`]   — durable per-transfer progress
//! - [`sender`]       — drives one outbound file through the send window
//! - [`receiver`]     — turns inbound frames into a file on disk
//! - [`session`]      — session errors and transfer reports
//! - [`state`]        — sender and receiver state machines
//! - [`peer`]         — runs both pipelines over one link
//! - [`socket`]       — datagram transport trait and its UDP implementation
//! - [`simulator`]    — lossy/reordering/duplicating in-memory link for tests

pub mod checkpoint;
pub mod config;
pub mod frame;
pub mod peer;
pub mod receiver;
pub mod recv_window;
pub mod send_window;
pub mod sender;
pub mod session;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod timer;
