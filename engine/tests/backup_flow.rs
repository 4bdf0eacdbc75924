//! End-to-end runs through the public `JobManager` API.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use engine::{
    EngineError, JobManager, LogDestination, LogShipper, MemoryJobStore, ProcessObserver,
    RunHooks, RunOutcome, RunState, Settings, TransferRecord, HANDSHAKE,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct NoBusinessSoftware;

impl ProcessObserver for NoBusinessSoftware {
    fn running(&self, _names: &[String]) -> Vec<String> {
        Vec::new()
    }
}

fn settings(root: &Path) -> Settings {
    Settings {
        log_directory: root.join("logs"),
        state_file: root.join("state.json"),
        ..Settings::default()
    }
}

fn manager(settings: Settings, shipper: Option<Arc<LogShipper>>) -> Arc<JobManager> {
    Arc::new(
        JobManager::new(
            settings,
            Arc::new(MemoryJobStore::default()),
            Arc::new(NoBusinessSoftware),
            shipper,
        )
        .expect("manager"),
    )
}

fn populate(dir: &Path, files: &[&str]) -> String {
    fs::create_dir_all(dir).expect("mkdir");
    for file in files {
        fs::write(dir.join(file), format!("content of {file}")).expect("write");
    }
    dir.to_string_lossy().into_owned()
}

fn todays_records(manager: &JobManager) -> Vec<TransferRecord> {
    manager
        .logger()
        .daily_log()
        .read(Local::now().date_naive())
        .expect("read daily log")
}

#[tokio::test]
async fn test_single_file_full_backup() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path();
    let manager = manager(settings(root), None);

    let src = populate(&root.join("src"), &["file1.txt"]);
    let dst = root.join("dst");
    let job = manager
        .create_job("single", &src, &dst.to_string_lossy(), true)
        .expect("create");

    let outcome = manager
        .execute_job(job.id, RunHooks::default(), &CancellationToken::new())
        .await
        .expect("run");

    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert_eq!(
        fs::read(dst.join("file1.txt")).expect("read"),
        fs::read(root.join("src").join("file1.txt")).expect("read")
    );

    let records = todays_records(&manager);
    assert_eq!(records.len(), 1);
    assert!(records[0].transfer_time_ms >= 0);
    assert_eq!(records[0].job_name, "single");

    let state = manager
        .logger()
        .state_store()
        .read("single")
        .expect("read state")
        .expect("state present");
    assert_eq!(state.progression, 100);
    assert_eq!(state.state, RunState::Finished);
}

#[tokio::test]
async fn test_priority_barrier_spans_jobs() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path();
    let manager = manager(
        Settings {
            priority_extensions: vec![".pdf".to_string()],
            ..settings(root)
        },
        None,
    );

    let urgent = manager
        .create_job(
            "urgent",
            &populate(&root.join("urgent"), &["a.pdf", "b.pdf", "c.pdf"]),
            &root.join("urgent_dst").to_string_lossy(),
            true,
        )
        .expect("create");
    let plain = manager
        .create_job(
            "plain",
            &populate(&root.join("plain"), &["x.txt", "y.txt", "z.txt"]),
            &root.join("plain_dst").to_string_lossy(),
            true,
        )
        .expect("create");

    // The priority job announces its files, then stalls before copying them
    manager.pause_job(urgent.id);
    let spawn_run = |id: u32| {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .execute_job(id, RunHooks::default(), &CancellationToken::new())
                .await
        })
    };
    let urgent_run = spawn_run(urgent.id);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.priority_gate().outstanding(), 3);

    let plain_run = spawn_run(plain.id);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!root.join("plain_dst").join("x.txt").exists());

    manager.resume_job(urgent.id);
    assert!(urgent_run.await.expect("join").is_ok());
    assert!(plain_run.await.expect("join").is_ok());

    let records = todays_records(&manager);
    assert_eq!(records.len(), 6);
    let first_normal = records
        .iter()
        .position(|r| r.job_name == "plain")
        .expect("normal records");
    assert!(records[..first_normal].iter().all(|r| r.job_name == "urgent"));
    assert_eq!(first_normal, 3);
    assert!(manager.priority_gate().is_clear());
}

#[tokio::test]
async fn test_cancelled_batch_never_finishes() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path();
    let manager = manager(settings(root), None);

    let job = manager
        .create_job(
            "slow",
            &populate(&root.join("src"), &["a.txt", "b.txt"]),
            &root.join("dst").to_string_lossy(),
            true,
        )
        .expect("create");
    manager.pause_job(job.id);

    let cancel = CancellationToken::new();
    let run = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            manager
                .execute_job(job.id, RunHooks::default(), &cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = run.await.expect("join");
    assert!(matches!(result, Err(EngineError::Cancelled)));
    let state = manager
        .logger()
        .state_store()
        .read("slow")
        .expect("read state")
        .expect("state present");
    assert_eq!(state.state, RunState::Active);
    assert!(todays_records(&manager).is_empty());
}

#[tokio::test]
async fn test_records_shipped_to_collector() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr").to_string();
    let collector = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        socket
            .write_all(format!("{HANDSHAKE}\n").as_bytes())
            .await
            .expect("greet");
        let mut lines = BufReader::new(socket).lines();
        lines.next_line().await.expect("read").expect("line")
    });

    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path();
    let shipper = Arc::new(LogShipper::spawn(address, Duration::from_millis(100)));
    let manager = manager(
        Settings {
            log_destination: LogDestination::Centralized,
            ..settings(root)
        },
        Some(shipper.clone()),
    );

    let job = manager
        .create_job(
            "remote",
            &populate(&root.join("src"), &["only.txt"]),
            &root.join("dst").to_string_lossy(),
            true,
        )
        .expect("create");
    manager
        .execute_job(job.id, RunHooks::default(), &CancellationToken::new())
        .await
        .expect("run");

    let line = tokio::time::timeout(Duration::from_secs(5), collector)
        .await
        .expect("collector received a line")
        .expect("join");
    let record: TransferRecord = serde_json::from_str(&line).expect("record json");
    assert_eq!(record.job_name, "remote");
    assert!(!root.join("logs").exists(), "centralized mode writes no local log");

    assert!(shipper.drain(Duration::from_secs(1)).await);
    manager.shutdown(Duration::from_millis(100)).await;
}
