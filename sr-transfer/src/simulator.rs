//! In-memory lossy network for deterministic testing.
//!
//! Real networks drop, reorder, and duplicate datagrams.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! [`Simulator::pair`] returns two connected [`SimLink`]s that implement
//! [`Datagram`] and apply a configurable fault model on every send:
//!
//! | Fault            | Description                                      |
//! |------------------|--------------------------------------------------|
//! | Packet loss      | Drop a datagram with probability `loss_rate`.    |
//! | Reordering       | Delay a datagram by `reorder_delay`, letting     |
//! |                  | later datagrams overtake it.                     |
//! | Duplication      | Deliver a datagram twice.                        |
//! | Link cut         | After `cut_after` sends, drop everything.        |
//!
//! Corruption is deliberately absent: the transfer protocol assumes payload
//! integrity from its transport.  Every link draws from its own seeded RNG so
//! failures are reproducible.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::socket::Datagram;

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is reordered.
    pub reorder_rate: f64,
    /// Fixed delay applied to reordered datagrams.
    pub reorder_delay: Duration,
    /// Probability that a datagram is duplicated.
    pub duplicate_rate: f64,
    /// Drop every datagram after this many have been sent by one end.
    pub cut_after: Option<usize>,
    /// RNG seed; the second link of a pair uses `seed + 1`.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults: a transparent pass-through.
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::ZERO,
            duplicate_rate: 0.0,
            cut_after: None,
            seed: 0,
        }
    }
}

impl SimulatorConfig {
    /// A hostile but still progress-permitting channel.
    pub fn lossy(seed: u64) -> Self {
        Self {
            loss_rate: 0.2,
            reorder_rate: 0.2,
            reorder_delay: Duration::from_millis(15),
            duplicate_rate: 0.1,
            cut_after: None,
            seed,
        }
    }
}

/// Counters of what one link did to the datagrams handed to it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub sent: usize,
    pub dropped: usize,
    pub duplicated: usize,
    pub reordered: usize,
}

/// Factory for connected link pairs.
pub struct Simulator;

impl Simulator {
    /// Two ends of one simulated channel.  Faults apply independently in
    /// each direction.
    pub fn pair(config: SimulatorConfig) -> (SimLink, SimLink) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let mut b_config = config.clone();
        b_config.seed = config.seed.wrapping_add(1);
        (
            SimLink::new(b_tx, a_rx, config),
            SimLink::new(a_tx, b_rx, b_config),
        )
    }
}

/// One end of a simulated channel.
pub struct SimLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
    stats: Mutex<SimStats>,
    sends: AtomicUsize,
    /// Every message handed to `send`, before faults are applied.
    tap: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl SimLink {
    fn new(
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        config: SimulatorConfig,
    ) -> Self {
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            config,
            stats: Mutex::new(SimStats::default()),
            sends: AtomicUsize::new(0),
            tap: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn stats(&self) -> SimStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared view of everything this end has sent.  The handle stays valid
    /// after the link is moved into a peer.
    pub fn tap(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.tap)
    }

    fn roll(&self, p: f64) -> bool {
        p > 0.0
            && self
                .rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .random::<f64>()
                < p
    }

    fn record(&self, f: impl FnOnce(&mut SimStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn deliver(&self, bytes: Vec<u8>) -> io::Result<()> {
        self.tx
            .send(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "simulated peer is gone"))
    }
}

impl Datagram for SimLink {
    async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        self.tap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes.to_vec());
        let n = self.sends.fetch_add(1, Ordering::SeqCst);
        self.record(|s| s.sent += 1);

        if self.config.cut_after.is_some_and(|cut| n >= cut) || self.roll(self.config.loss_rate) {
            log::trace!("[sim] DROP {} bytes", bytes.len());
            self.record(|s| s.dropped += 1);
            return Ok(());
        }

        let copies = if self.roll(self.config.duplicate_rate) {
            self.record(|s| s.duplicated += 1);
            2
        } else {
            1
        };

        for _ in 0..copies {
            if self.roll(self.config.reorder_rate) {
                self.record(|s| s.reordered += 1);
                let tx = self.tx.clone();
                let delay = self.config.reorder_delay;
                let late = bytes.to_vec();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(late);
                });
            } else {
                self.deliver(bytes.to_vec())?;
            }
        }
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let msg = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "simulated peer is gone"))?;
        let n = msg.len().min(buf.len());
        buf[..n].copy_from_slice(&msg[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pass_through_by_default() {
        let (a, b) = Simulator::pair(SimulatorConfig::default());
        a.send(b"one").await.unwrap();
        a.send(b"two").await.unwrap();

        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
        assert_eq!(a.stats().sent, 2);
        assert_eq!(a.stats().dropped, 0);
    }

    #[tokio::test]
    async fn total_loss_drops_everything() {
        let config = SimulatorConfig {
            loss_rate: 1.0,
            ..Default::default()
        };
        let (a, b) = Simulator::pair(config);
        a.send(b"gone").await.unwrap();
        b.send(b"back").await.unwrap();
        assert_eq!(a.stats().dropped, 1);
        assert_eq!(b.stats().dropped, 1);
    }

    #[tokio::test]
    async fn duplication_delivers_twice() {
        let config = SimulatorConfig {
            duplicate_rate: 1.0,
            ..Default::default()
        };
        let (a, b) = Simulator::pair(config);
        a.send(b"twice").await.unwrap();

        let mut buf = [0u8; 16];
        for _ in 0..2 {
            let n = b.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"twice");
        }
        assert_eq!(a.stats().duplicated, 1);
    }

    #[tokio::test]
    async fn reordered_datagram_still_arrives() {
        let config = SimulatorConfig {
            reorder_rate: 1.0,
            reorder_delay: Duration::from_millis(30),
            ..Default::default()
        };
        let (a, b) = Simulator::pair(config);
        a.send(b"late").await.unwrap();
        assert_eq!(a.stats().reordered, 1);

        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late");
    }

    #[tokio::test]
    async fn cut_link_drops_after_threshold() {
        let config = SimulatorConfig {
            cut_after: Some(1),
            ..Default::default()
        };
        let (a, b) = Simulator::pair(config);
        a.send(b"first").await.unwrap();
        a.send(b"second").await.unwrap();

        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");
        assert_eq!(a.stats().dropped, 1);
        assert_eq!(a.tap().lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn recv_fails_once_peer_is_dropped() {
        let (a, b) = Simulator::pair(SimulatorConfig::default());
        drop(a);
        let mut buf = [0u8; 4];
        let err = b.recv(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
