//! Outbound transfer driver.
//!
//! [`Sender`] runs one file at a time through a [`SendWindow`]:
//!
//! 1. Read the send checkpoint for the file name; that many chunks were
//!    confirmed by an earlier run and are skipped.
//! 2. Announce `SESSION_START <name> <total>` and fill the window.
//! 3. Loop until every chunk is acknowledged, multiplexing with `select!`:
//!    - an ACK from the routing task marks its chunk; a slide is persisted
//!      and the window refilled;
//!    - a [`RetransmitTimer`] tick re-evaluates deadlines.
//!
//!    At the top of every iteration each slot that is unsent or past its
//!    deadline goes on the wire.
//! 4. Send `SESSION_END`.
//!
//! A retransmission round that finds no slide since the previous round (or
//! since the session began) re-announces the start frame and reopens any
//! chunks acknowledged above `base`.  A lost start frame costs one timeout,
//! and a receiver that restarted mid-session rejoins from its own checkpoint.
//!
//! The sender never reads the socket.  Acknowledgments reach it over an mpsc
//! channel fed by the peer's routing task.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::config::TransferConfig;
use crate::frame::{is_valid_name, Frame};
use crate::send_window::{AckOutcome, SendWindow};
use crate::session::{SendReport, SessionError};
use crate::socket::Datagram;
use crate::state::SenderState;
use crate::timer::RetransmitTimer;

/// Sending half of a peer.
pub struct Sender<D: Datagram> {
    link: Arc<D>,
    store: Arc<dyn CheckpointStore>,
    config: TransferConfig,
    acks: mpsc::Receiver<u32>,
    state: SenderState,
}

impl<D: Datagram> Sender<D> {
    pub fn new(
        link: Arc<D>,
        store: Arc<dyn CheckpointStore>,
        config: TransferConfig,
        acks: mpsc::Receiver<u32>,
    ) -> Self {
        Self {
            link,
            store,
            config,
            acks,
            state: SenderState::Idle,
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Transfer the file at `path`, resuming from its checkpoint.
    ///
    /// On error the session is abandoned; whatever was checkpointed survives
    /// for the next attempt.
    pub async fn send_file(&mut self, path: &Path) -> Result<SendReport, SessionError> {
        self.state = SenderState::Idle;
        let result = self.transfer(path).await;
        self.state = match &result {
            Ok(_) => SenderState::Done,
            Err(e) => {
                log::error!("[sr:send] {}: session aborted: {e}", path.display());
                SenderState::Aborted
            }
        };
        result
    }

    /// Tell the peer this side is going away.
    pub async fn exit(&self) {
        log::info!("[sr:send] → exit");
        self.announce(&Frame::Exit).await;
    }

    async fn transfer(&mut self, path: &Path) -> Result<SendReport, SessionError> {
        let name = transfer_name(path)?;
        let chunk_size = self.config.chunk_size;

        let mut source = File::open(path)?;
        let chunks = self.config.total_chunks(source.metadata()?.len());
        let total = u32::try_from(chunks).map_err(|_| SessionError::SourceTooLarge { chunks })?;

        let key = CheckpointKey::send(name.as_str());
        let stored = self.store.read(&key)?;
        let base = u32::try_from(stored)
            .ok()
            .filter(|&b| b <= total)
            .ok_or(SessionError::CheckpointBeyondSource {
                checkpoint: stored,
                total,
            })?;
        source.seek(SeekFrom::Start(u64::from(base) * chunk_size as u64))?;

        // Acknowledgments still queued belong to an earlier session.
        while self.acks.try_recv().is_ok() {}

        let mut window = SendWindow::new(base, total, self.config.window_size);
        let mut timer = RetransmitTimer::new(self.config.rto, self.config.poll_interval);
        let mut report = SendReport {
            name: name.clone(),
            total_chunks: total,
            resumed_from: base,
            transmissions: 0,
            retransmissions: 0,
        };

        log::info!("[sr:send] {name}: {total} chunk(s), starting at {base}");
        let start = Frame::Start {
            name: name.clone(),
            total: Some(total),
        };
        self.announce(&start).await;
        // Set by every slide, cleared by every retransmission round.
        let mut progressed = false;

        self.state = SenderState::Streaming;
        window.fill(&mut source, chunk_size)?;

        while !window.is_complete() {
            if window.resend_due(Instant::now()) {
                if !progressed {
                    self.resync(&start, &mut window).await;
                }
                progressed = false;
            }
            self.transmit_due(&mut window, &timer, &mut report).await;
            if self.state == SenderState::Streaming && window.next_seq() == total {
                log::debug!("[sr:send] {name}: every chunk sent once, draining");
                self.state = SenderState::Draining;
            }

            tokio::select! {
                ack = self.acks.recv() => {
                    let seq = ack.ok_or(SessionError::ChannelClosed)?;
                    match window.on_ack(seq) {
                        AckOutcome::Advanced { slid } => {
                            progressed = true;
                            self.store.write(&key, u64::from(window.base()))?;
                            window.fill(&mut source, chunk_size)?;
                            log::debug!(
                                "[sr:send] ← ACK:{seq} slid={slid} base={}",
                                window.base()
                            );
                        }
                        AckOutcome::Marked => {
                            log::debug!("[sr:send] ← ACK:{seq} held, base={}", window.base());
                        }
                        AckOutcome::Ignored => {
                            log::debug!("[sr:send] ← ACK:{seq} ignored");
                        }
                    }
                }

                _ = timer.tick() => {}
            }
        }

        self.announce(&Frame::End).await;
        log::info!(
            "[sr:send] {name}: complete ({} transmissions, {} retransmissions)",
            report.transmissions,
            report.retransmissions
        );
        Ok(report)
    }

    /// Put every slot that is unsent or past its deadline on the wire.
    ///
    /// A failed send leaves the slot's deadline untouched, so it stays due.
    async fn transmit_due(
        &self,
        window: &mut SendWindow,
        timer: &RetransmitTimer,
        report: &mut SendReport,
    ) {
        for seq in window.due(Instant::now()) {
            let Some(data) = window.frame(seq) else {
                continue;
            };
            let resend = window.slot(seq).is_some_and(|s| s.tx_count > 0);
            let len = data.payload.len();

            match self.link.send_frame(&Frame::Data(data)).await {
                Ok(()) => {
                    window.mark_sent(seq, timer.arm(Instant::now()));
                    report.transmissions += 1;
                    if resend {
                        report.retransmissions += 1;
                        log::debug!("[sr:send] → DATA seq={seq} len={len} (retransmit)");
                    } else {
                        log::debug!(
                            "[sr:send] → DATA seq={seq} len={len} in_flight={}",
                            window.in_flight()
                        );
                    }
                }
                Err(e) => log::warn!("[sr:send] DATA seq={seq} not sent: {e}"),
            }
        }
    }

    /// The window is stuck: the receiver may have missed the start frame or
    /// restarted.  Announce the session again and resend the chunks it had
    /// only buffered.
    async fn resync(&self, start: &Frame, window: &mut SendWindow) {
        log::debug!(
            "[sr:send] no progress at base={}, re-announcing session",
            window.base()
        );
        self.announce(start).await;
        let reopened = window.reopen_held();
        if reopened > 0 {
            log::debug!("[sr:send] {reopened} held chunk(s) reopened");
        }
    }

    async fn announce(&self, frame: &Frame) {
        if let Err(e) = self.link.send_frame(frame).await {
            log::warn!("[sr:send] {frame:?} not sent: {e}");
        }
    }
}

/// The name a file travels under: its final path component.
fn transfer_name(path: &Path) -> Result<String, SessionError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| is_valid_name(n))
        .map(str::to_owned)
        .ok_or_else(|| SessionError::InvalidName(path.display().to_string()))
}
