//! Checkpoint resume across interrupted sessions.
//!
//! An "interruption" is simulated by cutting the link mid-transfer and then
//! aborting both peers, which leaves exactly what a crash would: the
//! checkpoints and the bytes already written.  A second pair of peers built
//! on the same stores and directories must finish the job without resending
//! anything the first run had confirmed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;

use sr_transfer::{
    checkpoint::{CheckpointKey, CheckpointStore, MemoryCheckpointStore},
    config::TransferConfig,
    frame::Frame,
    peer::{Peer, PeerEvent, PeerSession},
    session::{ReceiveReport, SendReport, SessionError},
    simulator::{SimLink, Simulator, SimulatorConfig},
    socket::Datagram,
};

const CHUNK: usize = 128;
const CHUNKS: usize = 40;

fn config() -> TransferConfig {
    TransferConfig::new(CHUNK, 8, Duration::from_millis(50))
}

fn source(dir: &Path) -> (PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..CHUNK * CHUNKS).map(|i| (i * 7 % 251) as u8).collect();
    let path = dir.join("data.bin");
    fs::write(&path, &data).unwrap();
    (path, data)
}

fn data_seqs(tap: &Mutex<Vec<Vec<u8>>>) -> Vec<u32> {
    tap.lock()
        .unwrap()
        .iter()
        .filter_map(|bytes| match Frame::decode_with_limit(bytes, CHUNK) {
            Ok(Frame::Data(d)) => Some(d.seq),
            _ => None,
        })
        .collect()
}

fn is_monotonic(history: &[u64]) -> bool {
    history.windows(2).all(|w| w[0] <= w[1])
}

async fn wait_for_received(session: &mut PeerSession) -> ReceiveReport {
    loop {
        match session.next_event().await.expect("peer stopped") {
            PeerEvent::Received(report) => return report,
            PeerEvent::ReceiveFailed(e) => panic!("receive failed: {e}"),
            _ => {}
        }
    }
}

async fn wait_for_sent(session: &mut PeerSession) -> Result<SendReport, SessionError> {
    loop {
        match session.next_event().await.expect("peer stopped") {
            PeerEvent::Sent(report) => return Ok(report),
            PeerEvent::SendFailed { error, .. } => return Err(error),
            _ => {}
        }
    }
}

/// One simulator end shared by successive peers, so a restarted receiver
/// answers from the same address the sender already talks to.
struct SharedLink(Arc<SimLink>);

impl Datagram for SharedLink {
    async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        self.0.send(bytes).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.recv(buf).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn interrupted_transfer_resumes_without_resending_confirmed_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    let (src, data) = source(tmp.path());
    let out = tmp.path().join("out");
    let send_store = Arc::new(MemoryCheckpointStore::new());
    let recv_store = Arc::new(MemoryCheckpointStore::new());
    let send_key = CheckpointKey::send("data.bin");
    let recv_key = CheckpointKey::receive("received_data.bin");

    // First run: both directions go dark after a dozen datagrams.
    let (a, b) = Simulator::pair(SimulatorConfig {
        cut_after: Some(12),
        ..Default::default()
    });
    let client = Peer::new(a, config(), send_store.clone(), tmp.path()).run();
    let server = Peer::new(b, config(), recv_store.clone(), &out).run();
    client.send_file(&src).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    client.abort();
    server.abort();

    let k_send = send_store.read(&send_key).unwrap();
    let k_recv = recv_store.read(&recv_key).unwrap();
    assert!(k_send > 0, "first run confirmed nothing");
    assert!(k_send <= k_recv, "sender {k_send} ahead of receiver {k_recv}");
    assert!(k_recv < CHUNKS as u64, "first run was not interrupted");
    let partial = fs::read(out.join("received_data.bin")).unwrap();
    assert_eq!(partial.len() as u64, k_recv * CHUNK as u64);

    // Second run on a clean link.
    let (a, b) = Simulator::pair(SimulatorConfig::default());
    let tap = a.tap();
    let mut client = Peer::new(a, config(), send_store.clone(), tmp.path()).run();
    let mut server = Peer::new(b, config(), recv_store.clone(), &out).run();
    client.send_file(&src).await.unwrap();

    let received = timeout(Duration::from_secs(30), wait_for_received(&mut server))
        .await
        .expect("resumed transfer timed out");
    let sent = wait_for_sent(&mut client).await.unwrap();

    assert_eq!(u64::from(sent.resumed_from), k_send);
    assert_eq!(received.resumed_from, k_recv);
    assert_eq!(fs::read(&received.path).unwrap(), data);

    let resent = data_seqs(&tap);
    assert!(
        resent.iter().all(|&seq| u64::from(seq) >= k_send),
        "chunks below checkpoint {k_send} were resent: {resent:?}"
    );

    assert!(is_monotonic(&send_store.history(&send_key)));
    assert!(is_monotonic(&recv_store.history(&recv_key)));
    assert_eq!(send_store.read(&send_key).unwrap(), CHUNKS as u64);
    assert_eq!(recv_store.read(&recv_key).unwrap(), CHUNKS as u64);
}

#[tokio::test(start_paused = true)]
async fn seeded_checkpoint_skips_confirmed_prefix() {
    let tmp = tempfile::tempdir().unwrap();
    let (src, data) = source(tmp.path());
    let out = tmp.path().join("out");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("received_data.bin"), &data[..3 * CHUNK]).unwrap();

    let send_store = Arc::new(MemoryCheckpointStore::new());
    let recv_store = Arc::new(MemoryCheckpointStore::new());
    send_store.seed(CheckpointKey::send("data.bin"), 3);
    recv_store.seed(CheckpointKey::receive("received_data.bin"), 3);

    let (a, b) = Simulator::pair(SimulatorConfig::default());
    let tap = a.tap();
    let mut client = Peer::new(a, config(), send_store.clone(), tmp.path()).run();
    let mut server = Peer::new(b, config(), recv_store, &out).run();
    client.send_file(&src).await.unwrap();

    let received = timeout(Duration::from_secs(30), wait_for_received(&mut server))
        .await
        .unwrap();
    let sent = wait_for_sent(&mut client).await.unwrap();

    assert_eq!(sent.resumed_from, 3);
    assert_eq!(received.resumed_from, 3);
    assert_eq!(fs::read(&received.path).unwrap(), data);
    assert_eq!(data_seqs(&tap).iter().min(), Some(&3));
    assert_eq!(sent.transmissions, (CHUNKS - 3) as u64);
}

#[tokio::test(start_paused = true)]
async fn finished_transfer_sends_no_data() {
    let tmp = tempfile::tempdir().unwrap();
    let (src, data) = source(tmp.path());
    let out = tmp.path().join("out");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("received_data.bin"), &data).unwrap();

    let send_store = Arc::new(MemoryCheckpointStore::new());
    let recv_store = Arc::new(MemoryCheckpointStore::new());
    send_store.seed(CheckpointKey::send("data.bin"), CHUNKS as u64);
    recv_store.seed(CheckpointKey::receive("received_data.bin"), CHUNKS as u64);

    let (a, b) = Simulator::pair(SimulatorConfig::default());
    let tap = a.tap();
    let mut client = Peer::new(a, config(), send_store, tmp.path()).run();
    let mut server = Peer::new(b, config(), recv_store, &out).run();
    client.send_file(&src).await.unwrap();

    let received = timeout(Duration::from_secs(5), wait_for_received(&mut server))
        .await
        .unwrap();
    let sent = wait_for_sent(&mut client).await.unwrap();

    assert_eq!(sent.transmissions, 0);
    assert_eq!(received.delivered, CHUNKS as u64);
    assert!(data_seqs(&tap).is_empty());
    assert_eq!(fs::read(&received.path).unwrap(), data);
}

#[tokio::test(start_paused = true)]
async fn checkpoint_failure_aborts_only_the_session() {
    let tmp = tempfile::tempdir().unwrap();
    let (src, data) = source(tmp.path());
    let out = tmp.path().join("out");
    let send_store = Arc::new(MemoryCheckpointStore::new());
    send_store.set_fail_writes(true);

    let (a, b) = Simulator::pair(SimulatorConfig::default());
    let mut client = Peer::new(a, config(), send_store.clone(), tmp.path()).run();
    let mut server = Peer::new(
        b,
        config(),
        Arc::new(MemoryCheckpointStore::new()),
        &out,
    )
    .run();

    client.send_file(&src).await.unwrap();
    let err = timeout(Duration::from_secs(5), wait_for_sent(&mut client))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SessionError::Checkpoint(_)), "got {err:?}");

    // Same peer, store healthy again: the next attempt completes.
    send_store.set_fail_writes(false);
    client.send_file(&src).await.unwrap();
    let sent = timeout(Duration::from_secs(30), wait_for_sent(&mut client))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sent.resumed_from, 0);

    let received = timeout(Duration::from_secs(5), wait_for_received(&mut server))
        .await
        .unwrap();
    assert_eq!(fs::read(&received.path).unwrap(), data);
}

#[tokio::test(start_paused = true)]
async fn receiver_restarted_mid_session_rejoins_from_its_checkpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let (src, data) = source(tmp.path());
    let out = tmp.path().join("out");
    let recv_store = Arc::new(MemoryCheckpointStore::new());
    let recv_key = CheckpointKey::receive("received_data.bin");
    let cfg = TransferConfig::new(CHUNK, 4, Duration::from_millis(50));

    // Every datagram takes 10ms, so the transfer spans many round trips.
    let (a, b) = Simulator::pair(SimulatorConfig {
        reorder_rate: 1.0,
        reorder_delay: Duration::from_millis(10),
        ..Default::default()
    });
    let b = Arc::new(b);
    let mut client = Peer::new(a, cfg, Arc::new(MemoryCheckpointStore::new()), tmp.path()).run();
    let server = Peer::new(SharedLink(Arc::clone(&b)), cfg, recv_store.clone(), &out).run();
    client.send_file(&src).await.unwrap();

    while recv_store.read(&recv_key).unwrap() < 4 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    server.abort();
    let k_recv = recv_store.read(&recv_key).unwrap();
    assert!(k_recv < CHUNKS as u64, "transfer finished before the restart");

    // Down long enough for several retransmission rounds to go unanswered.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut server = Peer::new(SharedLink(b), cfg, recv_store.clone(), &out).run();

    let received = timeout(Duration::from_secs(30), wait_for_received(&mut server))
        .await
        .expect("transfer never completed after the receiver restarted");
    let sent = wait_for_sent(&mut client).await.unwrap();

    assert_eq!(received.resumed_from, k_recv);
    assert_eq!(sent.total_chunks, CHUNKS as u32);
    assert_eq!(fs::read(&received.path).unwrap(), data);
    assert!(is_monotonic(&recv_store.history(&recv_key)));
}
