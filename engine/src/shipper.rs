//! Network side of transfer logging.
//!
//! `LogShipper` owns a supervised background task that keeps a connection to
//! the log collector and forwards queued lines, one record per line.
//!
//! Protocol (plain TCP, UTF-8, newline-delimited):
//! 1. The collector sends `EASYSAVE_LOGSERVER` right after accepting.
//! 2. The client validates that line before sending anything.
//! 3. The client then sends one serialized record per line, unacknowledged.
//!
//! Connection state cycles `Connecting -> Connected -> Disconnected -> Connecting`.
//! A line whose write fails is kept and sent first on the next connection
//! (at-least-once delivery).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Greeting line the collector sends after accepting a connection.
pub const HANDSHAKE: &str = "EASYSAVE_LOGSERVER";

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
const IDLE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Handle to the background sender. Cheap to share behind an `Arc`.
pub struct LogShipper {
    queue: mpsc::UnboundedSender<String>,
    endpoint: Arc<RwLock<String>>,
    state: watch::Receiver<ConnectionState>,
    reconnect: Arc<Notify>,
    backlog: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LogShipper {
    /// Start the sender task. Must be called from within a Tokio runtime.
    pub fn spawn(endpoint: impl Into<String>, retry_delay: Duration) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let endpoint = Arc::new(RwLock::new(endpoint.into()));
        let reconnect = Arc::new(Notify::new());
        let backlog = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let worker = ShipperWorker {
            rx,
            pending: None,
            endpoint: Arc::clone(&endpoint),
            state: state_tx,
            reconnect: Arc::clone(&reconnect),
            backlog: Arc::clone(&backlog),
            shutdown: shutdown.clone(),
            retry_delay,
        };
        let handle = tokio::spawn(worker.run());

        LogShipper {
            queue,
            endpoint,
            state,
            reconnect,
            backlog,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue one line for delivery. Never blocks.
    pub fn enqueue(&self, line: String) {
        self.backlog.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(line).is_err() {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
            warn!("Log shipper stopped; dropping entry");
        }
    }

    /// Lines queued but not yet written to a collector.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn endpoint(&self) -> String {
        self.endpoint.read().clone()
    }

    /// Point the sender at a new collector and reconnect immediately.
    pub fn set_endpoint(&self, endpoint: impl Into<String>) {
        *self.endpoint.write() = endpoint.into();
        self.reconnect();
    }

    /// Abort the current connection or backoff and start a new cycle.
    pub fn reconnect(&self) {
        self.reconnect.notify_one();
    }

    /// Wait until the backlog is empty or `timeout` elapses. Returns true when drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.backlog() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Stop the sender task and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Log shipper task panicked");
            }
        }
    }
}

impl Drop for LogShipper {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Best-effort reachability probe: connect, validate the greeting, disconnect.
///
/// Independent from any running `LogShipper`.
pub async fn check_connection(endpoint: &str, timeout: Duration) -> bool {
    let probe = async {
        let stream = TcpStream::connect(endpoint).await.ok()?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.ok()?;
        Some(line.trim_end() == HANDSHAKE)
    };
    matches!(tokio::time::timeout(timeout, probe).await, Ok(Some(true)))
}

enum SessionEnd {
    /// Handshake, connect or stream failure
    Failed(String),
    /// Every sender is gone; nothing more will ever be queued
    QueueClosed,
}

enum Wake {
    Shutdown,
    Reconnect,
    Ended(SessionEnd),
}

struct ShipperWorker {
    rx: mpsc::UnboundedReceiver<String>,
    /// Line taken from the queue but not yet written
    pending: Option<String>,
    endpoint: Arc<RwLock<String>>,
    state: watch::Sender<ConnectionState>,
    reconnect: Arc<Notify>,
    backlog: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    retry_delay: Duration,
}

impl ShipperWorker {
    async fn run(mut self) {
        let shutdown = self.shutdown.clone();
        let reconnect = Arc::clone(&self.reconnect);

        loop {
            self.state.send_replace(ConnectionState::Connecting);
            let endpoint = self.endpoint.read().clone();

            let wake = tokio::select! {
                _ = shutdown.cancelled() => Wake::Shutdown,
                _ = reconnect.notified() => Wake::Reconnect,
                end = self.session(&endpoint) => Wake::Ended(end),
            };

            self.state.send_replace(ConnectionState::Disconnected);
            match wake {
                Wake::Shutdown | Wake::Ended(SessionEnd::QueueClosed) => break,
                Wake::Reconnect => {
                    info!(endpoint = %endpoint, "Reconnect requested");
                    continue;
                }
                Wake::Ended(SessionEnd::Failed(reason)) => {
                    warn!(endpoint = %endpoint, reason = %reason, "Log collector unavailable");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = reconnect.notified() => debug!("Retrying immediately"),
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        debug!("Log shipper stopped");
    }

    async fn session(&mut self, endpoint: &str) -> SessionEnd {
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return SessionEnd::Failed(format!("connect failed: {e}")),
            Err(_) => return SessionEnd::Failed("connect timed out".to_string()),
        };

        let mut reader = BufReader::new(stream);
        let mut greeting = String::new();
        match tokio::time::timeout(CONNECT_TIMEOUT, reader.read_line(&mut greeting)).await {
            Ok(Ok(_)) if greeting.trim_end() == HANDSHAKE => {}
            Ok(Ok(_)) => {
                return SessionEnd::Failed(format!("unexpected greeting {:?}", greeting.trim_end()))
            }
            Ok(Err(e)) => return SessionEnd::Failed(format!("handshake read failed: {e}")),
            Err(_) => return SessionEnd::Failed("handshake timed out".to_string()),
        }
        let mut stream = reader.into_inner();

        self.state.send_replace(ConnectionState::Connected);
        info!(endpoint = %endpoint, "Connected to log collector");

        loop {
            if self.pending.is_none() {
                tokio::select! {
                    entry = self.rx.recv() => match entry {
                        Some(entry) => self.pending = Some(entry),
                        None => return SessionEnd::QueueClosed,
                    },
                    _ = tokio::time::sleep(IDLE_POLL) => {
                        if peer_closed(&stream) {
                            return SessionEnd::Failed("collector closed the connection".to_string());
                        }
                        continue;
                    }
                }
            }

            let Some(entry) = self.pending.as_deref() else {
                continue;
            };
            let mut line = String::with_capacity(entry.len() + 1);
            line.push_str(entry);
            line.push('\n');

            if let Err(e) = stream.write_all(line.as_bytes()).await {
                return SessionEnd::Failed(format!("write failed: {e}"));
            }
            self.pending = None;
            self.backlog.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Non-blocking probe: readable with zero bytes means the peer closed.
fn peer_closed(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 64];
    match stream.try_read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}
