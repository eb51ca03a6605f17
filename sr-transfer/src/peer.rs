//! Full-duplex peer: one link, three tasks.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │  send_file(path) / exit()            next_event()
//!      ▼                                          ▲
//!  ┌──────────────┐                         ┌─────┴──────┐
//!  │ request chan │                         │ event chan │◀───────────┐
//!  └──────┬───────┘                         └─────▲──────┘            │
//!         ▼                                       │                   │
//!  ┌─────────────┐  ACK:<seq>  ┌────────────┐  frames  ┌─────────────┐ │
//!  │ send task   │◀────────────│ dispatcher │─────────▶│ recv task   │─┘
//!  │ (Sender)    │             └─────▲──────┘          │ (Receiver)  │
//!  └──────┬──────┘                   │ recv            └──────┬──────┘
//!         │ DATA / START / END       │                        │ ACK
//!         ▼                          │                        ▼
//!  ┌────────────────────────── Arc<impl Datagram> ─────────────────────┐
//!  └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The dispatcher is the only reader of the link.  It decodes each datagram
//! once and routes it: acknowledgments to the sending pipeline, everything
//! else to the receiving pipeline.  Malformed datagrams are dropped there.
//! A non-transient receive error ends the dispatcher; both pipelines then
//! see their channels close and stop.
//!
//! ```ignore
//! let link = Socket::bind(addr).await?.connect(server).await?;
//! let mut session = Peer::new(link, config, store, "downloads").run();
//! session.send_file("report.pdf").await?;
//! while let Some(event) = session.next_event().await { /* ... */ }
//! session.exit().await;
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::checkpoint::CheckpointStore;
use crate::config::{max_datagram, TransferConfig};
use crate::frame::Frame;
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::session::{ReceiveReport, SendReport, SessionError};
use crate::socket::{Datagram, SocketError};

/// Acknowledgments waiting for the send task.  Overflow is dropped; the
/// retransmission timer covers the loss.
const ACK_QUEUE: usize = 256;
const FRAME_QUEUE: usize = 256;
const REQUEST_QUEUE: usize = 64;

/// Work for the send task, served strictly in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendRequest {
    File(PathBuf),
    /// Send `exit` to the remote side and stop the send task.
    Exit,
}

/// Something the application may want to know about.
#[derive(Debug)]
pub enum PeerEvent {
    Sent(SendReport),
    SendFailed { path: PathBuf, error: SessionError },
    Received(ReceiveReport),
    ReceiveFailed(SessionError),
    /// The remote operator quit.
    PeerExited,
    /// The link failed; no further frames will arrive.
    LinkDown(SocketError),
}

/// A link plus everything both pipelines need, before the tasks start.
pub struct Peer<D: Datagram> {
    link: Arc<D>,
    config: TransferConfig,
    store: Arc<dyn CheckpointStore>,
    output_dir: PathBuf,
}

impl<D: Datagram> Peer<D> {
    pub fn new(
        link: D,
        config: TransferConfig,
        store: Arc<dyn CheckpointStore>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            link: Arc::new(link),
            config,
            store,
            output_dir: output_dir.into(),
        }
    }

    /// Spawn the dispatcher, send, and receive tasks.
    pub fn run(self) -> PeerSession {
        let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&self.link),
            self.config.chunk_size,
            ack_tx,
            frame_tx,
            event_tx.clone(),
        ));

        let sender = Sender::new(
            Arc::clone(&self.link),
            Arc::clone(&self.store),
            self.config,
            ack_rx,
        );
        let sending = tokio::spawn(send_loop(sender, request_rx, event_tx.clone()));

        let receiver = Receiver::new(self.store, self.config, self.output_dir);
        let receiving = tokio::spawn(receive_loop(self.link, receiver, frame_rx, event_tx));

        PeerSession {
            requests: request_tx,
            events: event_rx,
            sending,
            receiving,
            dispatcher,
        }
    }
}

/// Handle returned by [`Peer::run`].
pub struct PeerSession {
    requests: mpsc::Sender<SendRequest>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    sending: JoinHandle<()>,
    receiving: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl PeerSession {
    /// Queue a file for sending.  Files go out one after another.
    pub async fn send_file(&self, path: impl Into<PathBuf>) -> Result<(), SessionError> {
        self.requests
            .send(SendRequest::File(path.into()))
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }

    /// Next event, or `None` once every task has stopped.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        self.events.recv().await
    }

    /// Finish the queued files, tell the remote side we are leaving, then
    /// stop receiving.
    pub async fn exit(self) {
        if self.requests.send(SendRequest::Exit).await.is_ok() {
            let _ = self.sending.await;
        }
        self.receiving.abort();
        self.dispatcher.abort();
    }

    /// Stop every task immediately, as a crash would.  Only the checkpoints
    /// and the bytes already written survive.
    pub fn abort(&self) {
        self.sending.abort();
        self.receiving.abort();
        self.dispatcher.abort();
    }
}

async fn dispatch<D: Datagram>(
    link: Arc<D>,
    max_payload: usize,
    acks: mpsc::Sender<u32>,
    frames: mpsc::Sender<Frame>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let mut buf = vec![0u8; max_datagram(max_payload)];
    loop {
        match link.recv_frame(&mut buf, max_payload).await {
            Ok(Frame::Ack { seq }) => match acks.try_send(seq) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    log::debug!("[sr:peer] ack queue full; ACK:{seq} dropped");
                }
            },
            Ok(Frame::Hello) => log::debug!("[sr:peer] ← HELLO"),
            Ok(frame) => {
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) if e.is_transient() => log::debug!("[sr:peer] datagram dropped: {e}"),
            Err(e) => {
                log::error!("[sr:peer] link failed: {e}");
                let _ = events.send(PeerEvent::LinkDown(e));
                break;
            }
        }
    }
}

async fn send_loop<D: Datagram>(
    mut sender: Sender<D>,
    mut requests: mpsc::Receiver<SendRequest>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            SendRequest::File(path) => {
                let result = sender.send_file(&path).await;
                let link_gone = matches!(result, Err(SessionError::ChannelClosed));
                let event = match result {
                    Ok(report) => PeerEvent::Sent(report),
                    Err(error) => PeerEvent::SendFailed { path, error },
                };
                let _ = events.send(event);
                if link_gone {
                    break;
                }
            }
            SendRequest::Exit => {
                sender.exit().await;
                break;
            }
        }
    }
    log::debug!("[sr:send] send task finished");
}

async fn receive_loop<D: Datagram>(
    link: Arc<D>,
    mut receiver: Receiver,
    mut frames: mpsc::Receiver<Frame>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    while let Some(frame) = frames.recv().await {
        let step = match receiver.on_frame(frame) {
            Ok(step) => step,
            Err(error) => {
                log::error!("[sr:recv] session aborted: {error}");
                let _ = events.send(PeerEvent::ReceiveFailed(error));
                continue;
            }
        };

        if let Some(seq) = step.ack {
            match link.send_frame(&Frame::Ack { seq }).await {
                Ok(()) => log::debug!("[sr:recv] → ACK:{seq}"),
                Err(e) => log::warn!("[sr:recv] ACK:{seq} not sent: {e}"),
            }
        }
        if let Some(report) = step.report {
            let _ = events.send(PeerEvent::Received(report));
        }
        if step.peer_exited {
            let _ = events.send(PeerEvent::PeerExited);
        }
    }
    log::debug!("[sr:recv] receive task finished");
}
