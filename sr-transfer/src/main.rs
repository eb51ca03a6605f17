//! Entry point for `sr-transfer`.
//!
//! Parses CLI arguments, pairs with the remote peer (**listen** waits for a
//! `HELLO`, **connect** sends one), then sends files named on the command
//! line and on stdin while receiving whatever the peer sends.  `main.rs` owns
//! only process setup; all protocol work lives in the library.

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use sr_transfer::checkpoint::FileCheckpointStore;
use sr_transfer::config::{TransferConfig, WINDOW_SIZE};
use sr_transfer::frame::CHUNK_SIZE;
use sr_transfer::peer::{Peer, PeerEvent};
use sr_transfer::socket::{Socket, UdpLink};

/// Resumable Selective-Repeat file transfer over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Wait for a peer to connect, then exchange files with it.
    Listen {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        #[command(flatten)]
        opts: TransferOpts,
    },
    /// Connect to a listening peer, then exchange files with it.
    Connect {
        /// Remote peer address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        /// Local address to bind.
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
        #[command(flatten)]
        opts: TransferOpts,
    },
}

#[derive(Args)]
struct TransferOpts {
    /// Bytes per chunk; both peers must agree.
    #[arg(long, default_value_t = CHUNK_SIZE)]
    chunk_size: usize,
    /// Chunks outstanding at once.
    #[arg(long, default_value_t = WINDOW_SIZE)]
    window: usize,
    /// Retransmission timeout in milliseconds.
    #[arg(long, default_value_t = 500)]
    rto_ms: u64,
    /// Directory holding the `.checkpoint` files.
    #[arg(long, default_value = ".")]
    checkpoint_dir: PathBuf,
    /// Directory received files are written to.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
    /// Append log records to a file instead of stderr
    /// (`transfer_log.txt` when given without a value).
    #[arg(long, num_args = 0..=1, default_missing_value = "transfer_log.txt")]
    log_file: Option<PathBuf>,
    /// Files to send before reading more names from stdin.
    files: Vec<PathBuf>,
}

impl TransferOpts {
    fn config(&self) -> Result<TransferConfig> {
        ensure!(self.chunk_size >= 1, "--chunk-size must be at least 1");
        ensure!(self.window >= 1, "--window must be at least 1");
        ensure!(self.rto_ms >= 1, "--rto-ms must be at least 1");
        Ok(TransferConfig::new(
            self.chunk_size,
            self.window,
            Duration::from_millis(self.rto_ms),
        ))
    }
}

/// `RUST_LOG` controls verbosity (default `info`).
fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (opts, link) = match cli.mode {
        Mode::Listen { bind, opts } => {
            init_logging(opts.log_file.as_deref())?;
            let socket = Socket::bind(bind)
                .await
                .with_context(|| format!("binding {bind}"))?;
            println!("waiting for a peer on {}", socket.local_addr);
            let link = socket.accept().await.context("waiting for a peer")?;
            (opts, link)
        }
        Mode::Connect { server, bind, opts } => {
            init_logging(opts.log_file.as_deref())?;
            let socket = Socket::bind(bind)
                .await
                .with_context(|| format!("binding {bind}"))?;
            let link = socket
                .connect(server)
                .await
                .with_context(|| format!("greeting {server}"))?;
            (opts, link)
        }
    };

    run(link, &opts).await
}

async fn run(link: UdpLink, opts: &TransferOpts) -> Result<()> {
    let config = opts.config()?;
    println!("paired with {}", link.peer());

    let store = Arc::new(FileCheckpointStore::new(&opts.checkpoint_dir));
    let mut session = Peer::new(link, config, store, &opts.output_dir).run();

    for file in &opts.files {
        session.send_file(file).await?;
    }

    println!("enter file names to send, `exit` to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line.context("reading stdin")? {
                    Some(line) => {
                        let name = line.trim();
                        if name == "exit" {
                            session.exit().await;
                            return Ok(());
                        }
                        if !name.is_empty() {
                            session.send_file(name).await?;
                        }
                    }
                    None => stdin_open = false,
                }
            }

            event = session.next_event() => {
                match event {
                    Some(event) => {
                        if !print_event(&event) {
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = tokio::signal::ctrl_c() => {
                log::info!("[sr:peer] interrupted; progress is checkpointed");
                break;
            }
        }
    }

    session.abort();
    Ok(())
}

/// Print one event for the operator.  Returns `false` when the link is gone.
fn print_event(event: &PeerEvent) -> bool {
    match event {
        PeerEvent::Sent(r) => println!(
            "sent {} ({} chunks, resumed at {}, {} retransmissions)",
            r.name, r.total_chunks, r.resumed_from, r.retransmissions
        ),
        PeerEvent::SendFailed { path, error } => {
            eprintln!("failed to send {}: {error}", path.display())
        }
        PeerEvent::Received(r) => println!(
            "received {} as {} ({} chunks, resumed at {})",
            r.name,
            r.path.display(),
            r.delivered,
            r.resumed_from
        ),
        PeerEvent::ReceiveFailed(error) => eprintln!("receive failed: {error}"),
        PeerEvent::PeerExited => println!("peer disconnected"),
        PeerEvent::LinkDown(error) => {
            eprintln!("link down: {error}");
            return false;
        }
    }
    true
}
