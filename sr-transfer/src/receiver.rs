//! Inbound transfer handling.
//!
//! [`Receiver`] consumes decoded frames and decides what to acknowledge.  It
//! owns the open sink, the [`RecvWindow`], and the receive checkpoint for the
//! session in progress:
//!
//! - `SESSION_START` opens `<output_dir>/received_<name>`, appending when the
//!   checkpoint says earlier chunks are already on disk.
//! - Data frames are buffered; every chunk of the contiguous run starting at
//!   `expected_base` is written, synced, and checkpointed in turn, all
//!   **before** the ACK for the frame is released, so the sender's checkpoint
//!   never gets ahead of the data on disk.
//! - On resume the sink is cut back to the checkpointed length, so a chunk
//!   written before a crash but never counted is not kept twice.
//! - The session closes when the announced chunk count has been delivered or
//!   on `SESSION_END`, whichever comes first.  A closed session still
//!   re-acknowledges stale data for a sender that lost its final ACKs.
//!
//! [`Receiver::on_frame`] does no socket I/O; it returns the ACK to send and
//! lets the peer's receive task put it on the wire.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::config::TransferConfig;
use crate::frame::{DataFrame, Frame};
use crate::recv_window::{DataOutcome, RecvWindow};
use crate::session::{ReceiveReport, SessionError};
use crate::state::ReceiverState;

/// Prefix given to every file written by the receiver.
pub const RECEIVED_PREFIX: &str = "received_";

/// What the caller must do after one frame was handled.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    /// Sequence number to acknowledge.
    pub ack: Option<u32>,
    /// Set when this frame completed a session.
    pub report: Option<ReceiveReport>,
    /// The remote operator quit.
    pub peer_exited: bool,
}

/// State of the inbound session in progress (or the last one, once closed).
#[derive(Debug)]
struct Inbound {
    name: String,
    path: PathBuf,
    key: CheckpointKey,
    total: Option<u32>,
    window: RecvWindow,
    /// `None` once the session is closed.
    sink: Option<File>,
    resumed_from: u64,
}

impl Inbound {
    fn delivered(&self) -> u64 {
        u64::from(self.window.expected_base())
    }

    fn report(&self) -> ReceiveReport {
        ReceiveReport {
            name: self.name.clone(),
            path: self.path.clone(),
            total_chunks: self.total,
            resumed_from: self.resumed_from,
            delivered: self.delivered(),
        }
    }
}

/// Receiving half of a peer.
pub struct Receiver {
    store: Arc<dyn CheckpointStore>,
    config: TransferConfig,
    output_dir: PathBuf,
    state: ReceiverState,
    session: Option<Inbound>,
}

impl Receiver {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        config: TransferConfig,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            config,
            output_dir: output_dir.into(),
            state: ReceiverState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Chunks delivered in the current (or last) session.
    pub fn delivered(&self) -> Option<u64> {
        self.session.as_ref().map(Inbound::delivered)
    }

    /// Handle one inbound frame.
    ///
    /// An error is fatal to the session in progress: it is dropped and the
    /// receiver returns to idle.  Its checkpoint is left as last written.
    pub fn on_frame(&mut self, frame: Frame) -> Result<Step, SessionError> {
        let result = match frame {
            Frame::Start { name, total } => self.on_start(name, total),
            Frame::Data(data) => self.on_data(data),
            Frame::End => Ok(self.on_end()),
            Frame::Exit => {
                log::info!("[sr:recv] ← exit: remote side quit");
                Ok(Step {
                    peer_exited: true,
                    ..Step::default()
                })
            }
            Frame::Ack { .. } | Frame::Hello => Ok(Step::default()),
        };
        if result.is_err() {
            self.session = None;
            self.state = ReceiverState::Idle;
        }
        result
    }

    fn on_start(&mut self, name: String, total: Option<u32>) -> Result<Step, SessionError> {
        if let Some(s) = &self.session {
            if s.name == name && s.total == total {
                log::debug!("[sr:recv] ← SESSION_START {name} repeated; ignored");
                return Ok(Step::default());
            }
            if self.state == ReceiverState::Receiving {
                log::warn!(
                    "[sr:recv] {} abandoned at chunk {} for {name}",
                    s.name,
                    s.delivered()
                );
            }
        }
        self.session = None;

        let saved_name = format!("{RECEIVED_PREFIX}{name}");
        let path = self.output_dir.join(&saved_name);
        let key = CheckpointKey::receive(saved_name);

        let delivered = self.store.read(&key)?;
        let expected_base = u32::try_from(delivered)
            .ok()
            .filter(|&d| total.map_or(true, |t| d <= t))
            .ok_or(SessionError::CheckpointBeyondSource {
                checkpoint: delivered,
                total: total.unwrap_or(u32::MAX),
            })?;

        fs::create_dir_all(&self.output_dir)?;
        let sink = if delivered > 0 {
            let sink = OpenOptions::new().create(true).append(true).open(&path)?;
            // Bytes past the checkpoint were never counted; they are resent.
            let kept = delivered * self.config.chunk_size as u64;
            if sink.metadata()?.len() > kept {
                log::debug!("[sr:recv] {} cut back to {kept} bytes", path.display());
                sink.set_len(kept)?;
            }
            sink
        } else {
            File::create(&path)?
        };

        match total {
            Some(t) => log::info!(
                "[sr:recv] ← SESSION_START {name} ({t} chunk(s)), writing {} from chunk {delivered}",
                path.display()
            ),
            None => log::info!(
                "[sr:recv] ← SESSION_START {name}, writing {} from chunk {delivered}",
                path.display()
            ),
        }

        self.session = Some(Inbound {
            name,
            path,
            key,
            total,
            window: RecvWindow::new(expected_base, self.config.window_size),
            sink: Some(sink),
            resumed_from: delivered,
        });
        self.state = ReceiverState::Receiving;

        Ok(Step {
            report: self.close_if_complete(),
            ..Step::default()
        })
    }

    fn on_data(&mut self, data: DataFrame) -> Result<Step, SessionError> {
        let seq = data.seq;
        let Some(session) = self.session.as_mut() else {
            log::warn!("[sr:recv] DATA seq={seq} outside any session; dropped");
            return Ok(Step::default());
        };
        if session.total.is_some_and(|t| seq >= t) {
            log::warn!("[sr:recv] DATA seq={seq} beyond announced total; dropped");
            return Ok(Step::default());
        }

        let outcome = session.window.on_data(seq, &data.payload);
        match outcome {
            DataOutcome::Stored => {
                log::debug!("[sr:recv] ← DATA seq={seq} len={}", data.payload.len());
                deliver(session, self.store.as_ref())?;
            }
            DataOutcome::Duplicate => log::debug!("[sr:recv] ← DATA seq={seq} duplicate"),
            DataOutcome::Stale => log::debug!("[sr:recv] ← DATA seq={seq} already delivered"),
            DataOutcome::OutOfWindow => {
                log::warn!(
                    "[sr:recv] DATA seq={seq} beyond window at {}; dropped",
                    session.window.expected_base()
                );
            }
        }

        Ok(Step {
            ack: outcome.should_ack().then_some(seq),
            report: self.close_if_complete(),
            ..Step::default()
        })
    }

    fn on_end(&mut self) -> Step {
        if self.state != ReceiverState::Receiving {
            log::debug!("[sr:recv] ← SESSION_END with no open session");
            return Step::default();
        }
        log::info!("[sr:recv] ← SESSION_END");
        Step {
            report: self.close(),
            ..Step::default()
        }
    }

    fn close_if_complete(&mut self) -> Option<ReceiveReport> {
        let session = self.session.as_ref()?;
        let done = session.sink.is_some()
            && session.total.is_some_and(|t| session.delivered() == u64::from(t));
        if done {
            self.close()
        } else {
            None
        }
    }

    /// Close the sink and keep the window so stale data is still answered.
    fn close(&mut self) -> Option<ReceiveReport> {
        let session = self.session.as_mut()?;
        session.sink.take()?;
        self.state = ReceiverState::Closed;
        let report = session.report();
        log::info!(
            "[sr:recv] {} saved to {} ({} chunk(s), {} resumed)",
            report.name,
            report.path.display(),
            report.delivered,
            report.resumed_from
        );
        Some(report)
    }
}

/// Write the contiguous run at `expected_base` to the sink one chunk at a
/// time.  Each chunk is made durable and then counted in the checkpoint.
fn deliver(session: &mut Inbound, store: &dyn CheckpointStore) -> Result<(), SessionError> {
    let Some(sink) = session.sink.as_mut() else {
        return Ok(());
    };
    while let Some(chunk) = session.window.pop_ready() {
        sink.write_all(&chunk)?;
        sink.sync_data()?;
        let delivered = u64::from(session.window.expected_base());
        store.write(&session.key, delivered)?;
        log::debug!("[sr:recv] delivered chunk {}", delivered - 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;

    fn receiver(dir: &Path, window: usize) -> (Receiver, Arc<MemoryCheckpointStore>) {
        let store = Arc::new(MemoryCheckpointStore::new());
        let config = TransferConfig::new(4, window, crate::config::RETRANSMIT_TIMEOUT);
        (Receiver::new(store.clone(), config, dir), store)
    }

    fn start(name: &str, total: u32) -> Frame {
        Frame::Start {
            name: name.into(),
            total: Some(total),
        }
    }

    fn data(seq: u32, payload: &[u8]) -> Frame {
        Frame::Data(DataFrame::new(seq, payload.to_vec(), false))
    }

    #[test]
    fn writes_received_file_and_acks_each_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut rx, store) = receiver(tmp.path(), 4);

        rx.on_frame(start("a.txt", 2)).unwrap();
        assert_eq!(rx.state(), ReceiverState::Receiving);

        let step = rx.on_frame(data(0, b"abcd")).unwrap();
        assert_eq!(step.ack, Some(0));
        assert!(step.report.is_none());

        let step = rx.on_frame(data(1, b"ef")).unwrap();
        assert_eq!(step.ack, Some(1));
        let report = step.report.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(rx.state(), ReceiverState::Closed);

        let saved = tmp.path().join("received_a.txt");
        assert_eq!(report.path, saved);
        assert_eq!(fs::read(saved).unwrap(), b"abcdef");
        assert_eq!(
            store.history(&CheckpointKey::receive("received_a.txt")),
            vec![1, 2]
        );
    }

    #[test]
    fn out_of_order_data_waits_for_gap() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut rx, store) = receiver(tmp.path(), 4);
        rx.on_frame(start("b", 3)).unwrap();

        assert_eq!(rx.on_frame(data(2, b"3333")).unwrap().ack, Some(2));
        assert_eq!(rx.on_frame(data(1, b"2222")).unwrap().ack, Some(1));
        assert_eq!(rx.delivered(), Some(0));

        let step = rx.on_frame(data(0, b"1111")).unwrap();
        assert!(step.report.is_some());
        assert_eq!(
            fs::read(tmp.path().join("received_b")).unwrap(),
            b"111122223333"
        );
        assert_eq!(
            store.history(&CheckpointKey::receive("received_b")),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn beyond_window_is_dropped_without_ack() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut rx, store) = receiver(tmp.path(), 2);
        rx.on_frame(start("c", 10)).unwrap();

        let step = rx.on_frame(data(5, b"xxxx")).unwrap();
        assert_eq!(step.ack, None);
        assert_eq!(rx.delivered(), Some(0));
        assert!(store.history(&CheckpointKey::receive("received_c")).is_empty());
    }

    #[test]
    fn data_past_total_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut rx, _) = receiver(tmp.path(), 8);
        rx.on_frame(start("d", 2)).unwrap();
        assert_eq!(rx.on_frame(data(3, b"zz")).unwrap().ack, None);
    }

    #[test]
    fn closed_session_still_reacks_stale_data() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut rx, _) = receiver(tmp.path(), 4);
        rx.on_frame(start("e", 1)).unwrap();
        rx.on_frame(data(0, b"only")).unwrap();
        assert_eq!(rx.state(), ReceiverState::Closed);

        let step = rx.on_frame(data(0, b"only")).unwrap();
        assert_eq!(step.ack, Some(0));
        assert!(step.report.is_none());
        assert_eq!(fs::read(tmp.path().join("received_e")).unwrap(), b"only");
    }

    #[test]
    fn repeated_start_keeps_progress() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut rx, _) = receiver(tmp.path(), 4);
        rx.on_frame(start("f", 3)).unwrap();
        rx.on_frame(data(0, b"aaaa")).unwrap();
        rx.on_frame(start("f", 3)).unwrap();
        assert_eq!(rx.delivered(), Some(1));
        assert_eq!(rx.state(), ReceiverState::Receiving);
    }

    #[test]
    fn resumes_by_appending_after_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut rx, store) = receiver(tmp.path(), 4);
        fs::write(tmp.path().join("received_g"), b"1111").unwrap();
        store.seed(CheckpointKey::receive("received_g"), 1);

        rx.on_frame(start("g", 2)).unwrap();
        assert_eq!(rx.on_frame(data(0, b"1111")).unwrap().ack, Some(0));
        let report = rx.on_frame(data(1, b"22")).unwrap().report.unwrap();
        assert_eq!(report.resumed_from, 1);
        assert_eq!(fs::read(tmp.path().join("received_g")).unwrap(), b"111122");
    }

    #[test]
    fn resume_drops_bytes_past_the_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut rx, store) = receiver(tmp.path(), 4);
        // Chunk 1 reached the disk but the crash came before its checkpoint.
        fs::write(tmp.path().join("received_j"), b"11112222").unwrap();
        store.seed(CheckpointKey::receive("received_j"), 1);

        rx.on_frame(start("j", 3)).unwrap();
        assert_eq!(fs::read(tmp.path().join("received_j")).unwrap(), b"1111");

        rx.on_frame(data(1, b"2222")).unwrap();
        let report = rx.on_frame(data(2, b"33")).unwrap().report.unwrap();
        assert_eq!(report.resumed_from, 1);
        assert_eq!(
            fs::read(tmp.path().join("received_j")).unwrap(),
            b"1111222233"
        );
    }

    #[test]
    fn session_without_total_completes_on_end() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut rx, _) = receiver(tmp.path(), 4);
        rx.on_frame(Frame::Start {
            name: "h".into(),
            total: None,
        })
        .unwrap();
        rx.on_frame(data(0, b"hh")).unwrap();
        assert_eq!(rx.state(), ReceiverState::Receiving);

        let report = rx.on_frame(Frame::End).unwrap().report.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.total_chunks, None);
        assert_eq!(rx.on_frame(Frame::End).unwrap(), Step::default());
    }

    #[test]
    fn empty_transfer_completes_on_start() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut rx, _) = receiver(tmp.path(), 4);
        let report = rx.on_frame(start("empty", 0)).unwrap().report.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(fs::read(tmp.path().join("received_empty")).unwrap(), b"");
    }

    #[test]
    fn checkpoint_failure_aborts_session() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut rx, store) = receiver(tmp.path(), 4);
        rx.on_frame(start("i", 4)).unwrap();
        store.set_fail_writes(true);

        assert!(matches!(
            rx.on_frame(data(0, b"iiii")),
            Err(SessionError::Checkpoint(_))
        ));
        assert_eq!(rx.state(), ReceiverState::Idle);
        assert_eq!(rx.on_frame(data(1, b"iiii")).unwrap().ack, None);
    }

    #[test]
    fn exit_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut rx, _) = receiver(tmp.path(), 4);
        assert!(rx.on_frame(Frame::Exit).unwrap().peer_exited);
    }
}
