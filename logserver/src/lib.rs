//! # EasySave Log Collector
//!
//! Central sink for transfer records shipped by backup clients.
//!
//! Protocol (plain TCP, UTF-8, newline-delimited):
//! 1. Right after accepting, the collector sends the line `EASYSAVE_LOGSERVER`
//! 2. The client then sends one record per line; there are no acknowledgements
//!
//! Tasks:
//! - Accept loop: one handler task per connection
//! - Handlers: push every non-blank line onto a shared queue; a line longer
//!   than `MAX_LINE_LENGTH` closes the connection
//! - Writer: appends queued lines to `{log_dir}/{yyyy-MM-dd}.log`; a failed
//!   append keeps the line and retries after a delay, so nothing is dropped
//! - Reporter: logs the live counters periodically

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Greeting sent to every client right after accept.
pub const HANDSHAKE: &str = "EASYSAVE_LOGSERVER";

pub const DEFAULT_PORT: u16 = 9000;

/// Longest accepted record line; a client exceeding it is disconnected.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Failed to bind {addr}")]
    Bind { addr: String, source: io::Error },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Interface to listen on
    pub host: String,
    pub port: u16,
    /// Directory receiving one `.log` file per day
    pub log_dir: PathBuf,
    pub report_interval: Duration,
    /// Wait before retrying a failed append
    pub write_retry_delay: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            log_dir: PathBuf::from("logs"),
            report_interval: Duration::from_secs(5),
            write_retry_delay: Duration::from_secs(1),
        }
    }
}

impl CollectorConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Live counters, shared by every collector task.
#[derive(Debug)]
pub struct CollectorStats {
    connections: AtomicU64,
    active: AtomicU64,
    received: AtomicU64,
    written: AtomicU64,
    queued: AtomicU64,
    errors: AtomicU64,
    started: Instant,
}

impl Default for CollectorStats {
    fn default() -> Self {
        CollectorStats {
            connections: AtomicU64::new(0),
            active: AtomicU64::new(0),
            received: AtomicU64::new(0),
            written: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl CollectorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime: self.started.elapsed(),
        }
    }

    fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Connections accepted since start
    pub connections: u64,
    /// Connections currently open
    pub active: u64,
    pub received: u64,
    pub written: u64,
    /// Lines received but not yet written
    pub queued: u64,
    pub errors: u64,
    pub uptime: Duration,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.uptime.as_secs();
        write!(
            f,
            "uptime {:02}:{:02}:{:02} | connections {} ({} open) | received {} | written {} | queued {} | errors {}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            self.connections,
            self.active,
            self.received,
            self.written,
            self.queued,
            self.errors
        )
    }
}

pub struct Collector {
    listener: TcpListener,
    config: CollectorConfig,
    stats: Arc<CollectorStats>,
}

impl Collector {
    pub async fn bind(config: CollectorConfig) -> Result<Self, CollectorError> {
        let addr = config.address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| CollectorError::Bind { addr, source })?;
        Ok(Collector {
            listener,
            config,
            stats: Arc::new(CollectorStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CollectorError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<CollectorStats> {
        Arc::clone(&self.stats)
    }

    /// Serve until `shutdown` fires, then flush the queue and return.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), CollectorError> {
        let Collector {
            listener,
            config,
            stats,
        } = self;
        info!(
            addr = %listener.local_addr()?,
            log_dir = %config.log_dir.display(),
            "Log collector listening"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_entries(
            rx,
            config.log_dir.clone(),
            config.write_retry_delay,
            Arc::clone(&stats),
            shutdown.clone(),
        ));
        let reporter = tokio::spawn(report(
            Arc::clone(&stats),
            config.report_interval,
            shutdown.clone(),
        ));

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer)) => {
                    stats.connections.fetch_add(1, Ordering::Relaxed);
                    stats.active.fetch_add(1, Ordering::Relaxed);
                    info!(%peer, "Client connected");
                    tokio::spawn(handle_connection(
                        socket,
                        peer,
                        tx.clone(),
                        Arc::clone(&stats),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    stats.error();
                    warn!(error = %e, "Accept failed");
                }
            }
        }

        // Handlers hold the remaining senders and exit on shutdown
        drop(tx);
        if let Err(e) = writer.await {
            error!(error = %e, "Writer task failed");
        }
        if let Err(e) = reporter.await {
            error!(error = %e, "Reporter task failed");
        }
        info!(stats = %stats.snapshot(), "Log collector stopped");
        Ok(())
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    queue: mpsc::UnboundedSender<String>,
    stats: Arc<CollectorStats>,
    shutdown: CancellationToken,
) {
    if let Err(e) = socket.write_all(format!("{HANDSHAKE}\n").as_bytes()).await {
        stats.error();
        warn!(%peer, error = %e, "Handshake failed");
        stats.active.fetch_sub(1, Ordering::Relaxed);
        return;
    }

    let mut lines = FramedRead::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = lines.next() => next,
        };
        match next {
            Some(Ok(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                stats.received.fetch_add(1, Ordering::Relaxed);
                stats.queued.fetch_add(1, Ordering::Relaxed);
                if queue.send(line.to_string()).is_err() {
                    stats.queued.fetch_sub(1, Ordering::Relaxed);
                    stats.error();
                    warn!(%peer, "Writer stopped; entry dropped");
                    break;
                }
            }
            None => break,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                stats.error();
                warn!(%peer, limit = MAX_LINE_LENGTH, "Line too long; closing connection");
                break;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                stats.error();
                warn!(%peer, error = %e, "Read failed");
                break;
            }
        }
    }

    stats.active.fetch_sub(1, Ordering::Relaxed);
    info!(%peer, "Client disconnected");
}

/// Append queued entries to the file of the current day, retrying failures.
async fn write_entries(
    mut queue: mpsc::UnboundedReceiver<String>,
    log_dir: PathBuf,
    retry_delay: Duration,
    stats: Arc<CollectorStats>,
    shutdown: CancellationToken,
) {
    while let Some(entry) = queue.recv().await {
        loop {
            match append_entry(&log_dir, &entry).await {
                Ok(()) => {
                    stats.written.fetch_add(1, Ordering::Relaxed);
                    stats.queued.fetch_sub(1, Ordering::Relaxed);
                    break;
                }
                Err(e) => {
                    stats.error();
                    warn!(error = %e, dir = %log_dir.display(), "Append failed; retrying");
                    tokio::select! {
                        // Unwritable at shutdown: stop instead of spinning forever
                        _ = shutdown.cancelled() => {
                            error!(queued = stats.queued.load(Ordering::Relaxed), "Shutting down with unwritten entries");
                            return;
                        }
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                }
            }
        }
    }
    debug!("Writer drained");
}

/// Path of the collector file for today.
pub fn log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(format!("{}.log", Local::now().format("%Y-%m-%d")))
}

async fn append_entry(log_dir: &Path, entry: &str) -> io::Result<()> {
    tokio::fs::create_dir_all(log_dir).await?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(log_dir))
        .await?;
    file.write_all(format!("{entry}\n").as_bytes()).await?;
    file.flush().await
}

async fn report(stats: Arc<CollectorStats>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick fires immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let snapshot = stats.snapshot();
                info!(
                    connections = snapshot.connections,
                    active = snapshot.active,
                    received = snapshot.received,
                    written = snapshot.written,
                    queued = snapshot.queued,
                    errors = snapshot.errors,
                    uptime_secs = snapshot.uptime.as_secs(),
                    "Collector status"
                );
            }
        }
    }
}
