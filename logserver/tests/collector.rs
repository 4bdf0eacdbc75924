//! Collector behavior over real TCP connections.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use logserver::{log_path, Collector, CollectorConfig, CollectorStats, HANDSHAKE, MAX_LINE_LENGTH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    addr: String,
    stats: Arc<CollectorStats>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

async fn start(log_dir: &Path) -> Running {
    let collector = Collector::bind(CollectorConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        log_dir: log_dir.to_path_buf(),
        report_interval: Duration::from_millis(50),
        write_retry_delay: Duration::from_millis(20),
    })
    .await
    .expect("bind");
    let addr = collector.local_addr().expect("addr").to_string();
    let stats = collector.stats();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        collector.run(token).await.expect("run");
    });
    Running {
        addr,
        stats,
        shutdown,
        handle,
    }
}

async fn connect(addr: &str) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(addr).await.expect("connect");
    let mut reader = BufReader::new(stream);
    let mut greeting = String::new();
    reader.read_line(&mut greeting).await.expect("greeting");
    assert_eq!(greeting.trim_end(), HANDSHAKE);
    reader
}

#[tokio::test]
async fn test_lines_from_many_clients_are_persisted() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let Running {
        addr,
        stats,
        shutdown,
        handle,
    } = start(temp_dir.path()).await;

    let mut first = connect(&addr).await;
    let mut second = connect(&addr).await;
    first
        .get_mut()
        .write_all(b"{\"JobName\":\"a\"}\n\n   \n")
        .await
        .expect("write");
    second
        .get_mut()
        .write_all(b"{\"JobName\":\"b\"}\n{\"JobName\":\"c\"}\n")
        .await
        .expect("write");
    drop(first);
    drop(second);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stats.snapshot().written < 3 {
        assert!(tokio::time::Instant::now() < deadline, "entries not written in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let content = std::fs::read_to_string(log_path(temp_dir.path())).expect("read");
    let mut lines: Vec<&str> = content.lines().collect();
    lines.sort_unstable();
    assert_eq!(
        lines,
        vec!["{\"JobName\":\"a\"}", "{\"JobName\":\"b\"}", "{\"JobName\":\"c\"}"]
    );

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.connections, 2);
    assert_eq!(snapshot.received, 3, "blank lines are ignored");
    assert_eq!(snapshot.queued, 0);

    shutdown.cancel();
    handle.await.expect("join");
}

#[tokio::test]
async fn test_disconnect_is_tracked() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let Running {
        addr,
        stats,
        shutdown,
        handle,
    } = start(temp_dir.path()).await;

    let reader = connect(&addr).await;
    drop(reader);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stats.snapshot().active > 0 {
        assert!(tokio::time::Instant::now() < deadline, "disconnect not observed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stats.snapshot().connections, 1);

    shutdown.cancel();
    handle.await.expect("join");
}

#[tokio::test]
async fn test_oversized_line_drops_client() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let Running {
        addr,
        stats,
        shutdown,
        handle,
    } = start(temp_dir.path()).await;

    let mut client = connect(&addr).await;
    let flood = vec![b'x'; MAX_LINE_LENGTH + 4096];
    // The collector may reset the socket before the whole buffer is sent
    let _ = client.get_mut().write_all(&flood).await;

    let mut rest = String::new();
    let read = tokio::time::timeout(Duration::from_secs(5), client.read_line(&mut rest))
        .await
        .expect("collector closed the connection")
        .unwrap_or(0);
    assert_eq!(read, 0);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stats.snapshot().active > 0 {
        assert!(tokio::time::Instant::now() < deadline, "disconnect not observed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.errors, 1);
    assert_eq!(snapshot.received, 0);

    let mut next = connect(&addr).await;
    next.get_mut()
        .write_all(b"{\"JobName\":\"ok\"}\n")
        .await
        .expect("write");
    while stats.snapshot().written < 1 {
        assert!(tokio::time::Instant::now() < deadline, "entry not written in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.cancel();
    handle.await.expect("join");
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let Running {
        addr,
        shutdown,
        handle,
        ..
    } = start(temp_dir.path()).await;

    let mut client = connect(&addr).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("collector stopped")
        .expect("join");

    let mut rest = String::new();
    let read = client.read_line(&mut rest).await.unwrap_or(0);
    assert_eq!(read, 0, "connection closed by collector");
}
