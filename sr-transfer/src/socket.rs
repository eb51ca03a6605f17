//! Datagram transport adapter.
//!
//! [`Datagram`] is the only thing the window managers know about the network:
//! send one message, receive one message.  Delivery may be lost, duplicated,
//! or reordered, but a delivered message is never corrupted.
//!
//! [`UdpLink`] is the production implementation: a tokio `UdpSocket` paired
//! with the one remote address this peer talks to.  The in-memory
//! [`crate::simulator::SimLink`] implements the same trait for tests.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::frame::{Frame, FrameError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    /// The received datagram could not be decoded as a frame.
    #[error("frame decode error: {0}")]
    Frame(#[from] FrameError),
}

impl SocketError {
    /// `true` when the error concerns one datagram and the channel itself is
    /// still usable.
    pub fn is_transient(&self) -> bool {
        match self {
            SocketError::Frame(_) => true,
            SocketError::Io(e) => is_transient_io_error(e),
        }
    }
}

/// Returns true if the error is likely transient (retry may succeed).
pub fn is_transient_io_error(e: &io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
    )
}

// ---------------------------------------------------------------------------
// Datagram trait
// ---------------------------------------------------------------------------

/// A message-oriented, unreliable, unordered channel to one peer.
///
/// The read side and the write side may be used concurrently from different
/// tasks.
pub trait Datagram: Send + Sync + 'static {
    /// Send `bytes` as one message.
    fn send(&self, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive the next message into `buf`, returning its length.
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Encode `frame` and send it as one message.
    fn send_frame(&self, frame: &Frame) -> impl Future<Output = Result<(), SocketError>> + Send {
        let bytes = frame.encode();
        async move {
            self.send(&bytes).await?;
            Ok(())
        }
    }

    /// Receive the next message and decode it, rejecting data frames larger
    /// than `max_payload`.
    fn recv_frame(
        &self,
        buf: &mut [u8],
        max_payload: usize,
    ) -> impl Future<Output = Result<Frame, SocketError>> + Send {
        async move {
            let n = self.recv(buf).await?;
            Ok(Frame::decode_with_limit(&buf[..n], max_payload)?)
        }
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// A bound UDP socket that has not yet been paired with a peer.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `127.0.0.1:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Wait for the first datagram from anyone and adopt its sender as the
    /// peer.  Clients open with `HELLO`; whatever the first datagram holds,
    /// it only serves to reveal the address.
    pub async fn accept(self) -> Result<UdpLink, SocketError> {
        let mut buf = [0u8; 256];
        let (n, peer) = self.inner.recv_from(&mut buf).await?;
        match Frame::decode(&buf[..n]) {
            Ok(Frame::Hello) => log::info!("[sr:peer] HELLO from {peer}"),
            _ => log::info!("[sr:peer] first datagram ({n} bytes) from {peer}"),
        }
        Ok(UdpLink::new(self.inner, peer))
    }

    /// Pair with `peer` and greet it with `HELLO` so a listening peer learns
    /// our address.
    pub async fn connect(self, peer: SocketAddr) -> Result<UdpLink, SocketError> {
        let link = UdpLink::new(self.inner, peer);
        link.send_frame(&Frame::Hello).await?;
        log::info!("[sr:peer] → HELLO to {peer}");
        Ok(link)
    }
}

// ---------------------------------------------------------------------------
// UdpLink
// ---------------------------------------------------------------------------

/// A UDP socket paired with the one remote peer it exchanges frames with.
///
/// Datagrams from any other address are discarded on receive.
#[derive(Debug)]
pub struct UdpLink {
    inner: UdpSocket,
    peer: SocketAddr,
}

impl UdpLink {
    fn new(inner: UdpSocket, peer: SocketAddr) -> Self {
        Self { inner, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl Datagram for UdpLink {
    async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        self.inner.send_to(bytes, self.peer).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let (n, addr) = self.inner.recv_from(buf).await?;
            if addr == self.peer {
                return Ok(n);
            }
            log::debug!("[sr:peer] ignoring {n} bytes from stranger {addr}");
        }
    }
}
