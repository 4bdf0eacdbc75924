//! Per-job execution.
//!
//! `run_job` executes one backup job:
//! - Enumerates the source tree and recreates its directories under the target
//! - Processes priority files first, then normal files once no priority file
//!   is pending anywhere in the system
//! - Takes the large-file slot for oversized copies
//! - Honors the job's pause signal and the run's cancellation token at every
//!   file boundary
//! - Encrypts copied files whose extension is configured for encryption
//! - Records one TransferRecord per attempted copy and publishes a
//!   StateSnapshot after every file
//!
//! Per-file copy or encryption failures are recorded and reported but never
//! abort the run. Cancellation stops the loop and leaves the last published
//! snapshot in place.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::LargeFileThrottle;
use crate::crypto::{self, CryptoOutcome};
use crate::error::EngineError;
use crate::fs_ops::{self, SourceFile, SourceTree};
use crate::logger::TransferLogger;
use crate::model::{operator_identity, Job, SaveType, StateSnapshot, TransferRecord, COPY_FAILED_MS};
use crate::priority::PriorityGate;
use crate::progress::{MessageSink, PasswordPrompt, ProgressHub};
use crate::settings::Settings;

/// Shared resources every run draws on.
///
/// Constructed once by the manager; clones share the gate, the throttle,
/// the logger and the progress hub.
#[derive(Clone)]
pub struct RunContext {
    pub settings: Arc<Settings>,
    pub gate: Arc<PriorityGate>,
    pub throttle: LargeFileThrottle,
    pub logger: Arc<TransferLogger>,
    pub progress: ProgressHub,
    /// Operator identity written into every TransferRecord
    pub client_id: String,
}

impl RunContext {
    pub fn new(settings: Arc<Settings>, logger: Arc<TransferLogger>) -> Self {
        RunContext {
            settings,
            gate: Arc::new(PriorityGate::new()),
            throttle: LargeFileThrottle::default(),
            logger,
            progress: ProgressHub::default(),
            client_id: operator_identity(),
        }
    }
}

/// Optional front-end callbacks for one run.
///
/// The password prompt may block on user input, so it is owned and always
/// invoked on the blocking pool.
#[derive(Clone, Default)]
pub struct RunHooks<'a> {
    pub password: Option<Arc<dyn PasswordPrompt>>,
    pub messages: Option<&'a dyn MessageSink>,
}

impl RunHooks<'_> {
    fn notify(&self, text: &str) {
        if let Some(sink) = self.messages {
            sink.message(text);
        }
    }
}

/// How a run ended, when it was not cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The source directory does not exist; nothing was done
    SourceMissing,
    Completed(RunSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub files_total: usize,
    pub copied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub encryption_failures: usize,
    pub bytes_copied: u64,
    pub final_state: StateSnapshot,
}

/// Result of processing one file.
enum FileResult {
    Skipped,
    Copied(TransferRecord),
}

/// Execute `job`.
///
/// # Errors
/// `Cancelled` when `cancel` fires; enumeration or directory-creation errors
/// when the target tree cannot be prepared.
pub async fn run_job(
    job: &Job,
    ctx: &RunContext,
    hooks: RunHooks<'_>,
    cancel: &CancellationToken,
) -> Result<RunOutcome, EngineError> {
    if !job.source_directory.exists() {
        debug!(job = %job.name, source = %job.source_directory.display(), "Source missing; nothing to do");
        return Ok(RunOutcome::SourceMissing);
    }

    let tree = plan(job).await?;
    let (priority, normal): (Vec<SourceFile>, Vec<SourceFile>) = tree
        .files
        .into_iter()
        .partition(|f| ctx.settings.is_priority(&f.source_path));

    // Announced before any file is touched so normal files everywhere wait
    let mut lease = ctx.gate.lease(priority.len());

    let total_files = (priority.len() + normal.len()) as u64;
    let total_bytes: u64 = priority.iter().chain(normal.iter()).map(|f| f.size).sum();
    let mut snapshot = StateSnapshot::start(&job.name, total_files, total_bytes);
    publish(ctx, &snapshot).await;

    info!(
        job = %job.name,
        files = total_files,
        bytes = total_bytes,
        priority = priority.len(),
        save_type = %job.save_type,
        "Job started"
    );

    let mut summary = RunSummary {
        files_total: total_files as usize,
        copied: 0,
        skipped: 0,
        failed: 0,
        encryption_failures: 0,
        bytes_copied: 0,
        final_state: snapshot.clone(),
    };

    let ordered = priority
        .iter()
        .map(|f| (f, true))
        .chain(normal.iter().map(|f| (f, false)));

    for (file, is_priority) in ordered {
        if cancel.is_cancelled() {
            info!(job = %job.name, "Job cancelled");
            return Err(EngineError::Cancelled);
        }
        job.pause.wait_running(cancel).await?;
        if !is_priority {
            ctx.gate.wait_clear(cancel).await?;
        }

        match process_file(job, ctx, &hooks, file, cancel).await? {
            FileResult::Skipped => summary.skipped += 1,
            FileResult::Copied(record) => {
                if record.copy_failed() {
                    summary.failed += 1;
                } else {
                    summary.copied += 1;
                    summary.bytes_copied += record.file_size;
                }
                if record.encryption_time_ms < 0 {
                    summary.encryption_failures += 1;
                }
                write_record(ctx, record).await;
            }
        }

        snapshot.advance(file.size, &file.source_path, &file.target_path);
        publish(ctx, &snapshot).await;

        if is_priority {
            lease.complete_one();
        }
    }

    snapshot.finish();
    publish(ctx, &snapshot).await;
    summary.final_state = snapshot;

    info!(
        job = %job.name,
        copied = summary.copied,
        skipped = summary.skipped,
        failed = summary.failed,
        "Job finished"
    );
    hooks.notify(&format!(
        "Job '{}' finished: {} copied, {} skipped, {} failed",
        job.name, summary.copied, summary.skipped, summary.failed
    ));

    Ok(RunOutcome::Completed(summary))
}

/// Enumerate the source and recreate the directory structure under the target.
async fn plan(job: &Job) -> Result<SourceTree, EngineError> {
    let source = job.source_directory.clone();
    let target = job.target_directory.clone();
    tokio::task::spawn_blocking(move || {
        let tree = fs_ops::enumerate_tree(&source, &target)?;
        fs_ops::create_directories(&target, &tree.directories)?;
        Ok(tree)
    })
    .await
    .map_err(EngineError::task_failed)?
}

async fn process_file(
    job: &Job,
    ctx: &RunContext,
    hooks: &RunHooks<'_>,
    file: &SourceFile,
    cancel: &CancellationToken,
) -> Result<FileResult, EngineError> {
    let large = file.size > ctx.settings.large_file_threshold_bytes();
    let permit = if large {
        debug!(file = %file.source_path.display(), size = file.size, "Waiting for large-file slot");
        Some(ctx.throttle.acquire(cancel).await?)
    } else {
        None
    };

    let copied = copy_one(job.save_type, file.source_path.clone(), file.target_path.clone()).await;
    drop(permit);

    let transfer_time_ms = match copied? {
        None => {
            debug!(file = %file.source_path.display(), "Target up to date; skipped");
            return Ok(FileResult::Skipped);
        }
        Some(Ok(elapsed_ms)) => elapsed_ms,
        Some(Err(e)) => {
            warn!(file = %file.source_path.display(), error = %e, "Copy failed");
            hooks.notify(&format!("Copy failed for {}: {}", file.source_path.display(), e));
            COPY_FAILED_MS
        }
    };

    let encryption_time_ms = if transfer_time_ms >= 0 && ctx.settings.is_encrypted(&file.target_path)
    {
        encrypt_copy(hooks, &file.target_path).await?
    } else {
        0
    };

    Ok(FileResult::Copied(TransferRecord {
        time_stamp: Local::now(),
        client_id: ctx.client_id.clone(),
        job_name: job.name.clone(),
        source_file: file.source_path.clone(),
        target_file: file.target_path.clone(),
        file_size: file.size,
        transfer_time_ms,
        encryption_time_ms,
    }))
}

/// `None` when the save type says the file is up to date, otherwise the copy
/// duration or the copy error.
async fn copy_one(
    save_type: SaveType,
    source: PathBuf,
    target: PathBuf,
) -> Result<Option<Result<i64, EngineError>>, EngineError> {
    tokio::task::spawn_blocking(move || {
        if !fs_ops::should_copy(save_type, &source, &target) {
            return None;
        }
        let started = Instant::now();
        Some(
            fs_ops::copy_file_with_metadata(&source, &target)
                .map(|_| started.elapsed().as_millis() as i64),
        )
    })
    .await
    .map_err(EngineError::task_failed)
}

/// Encrypt the copied file in place. Returns the duration or a negative code.
async fn encrypt_copy(hooks: &RunHooks<'_>, target: &std::path::Path) -> Result<i64, EngineError> {
    let Some(prompt) = hooks.password.clone() else {
        return Ok(0);
    };
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let question = format!("Password to encrypt {name}");
    let answer = tokio::task::spawn_blocking(move || prompt.password(&question))
        .await
        .map_err(EngineError::task_failed)?;
    let Some(password) = answer else {
        return Ok(0);
    };

    let path = target.to_path_buf();
    let outcome = tokio::task::spawn_blocking(move || crypto::encrypt_file(&path, &path, &password))
        .await
        .map_err(EngineError::task_failed)?;

    match outcome {
        Ok(CryptoOutcome::Completed { elapsed_ms }) => Ok(elapsed_ms),
        Ok(failed) => {
            warn!(file = %target.display(), code = failed.code(), "Encryption failed");
            hooks.notify(&format!("Encryption failed for {name} (code {})", failed.code()));
            Ok(failed.code())
        }
        Err(e) => {
            warn!(file = %target.display(), error = %e, "Encryption rejected");
            hooks.notify(&format!("Encryption failed for {name}: {e}"));
            Ok(crypto::FAILURE_CODE)
        }
    }
}

async fn write_record(ctx: &RunContext, record: TransferRecord) {
    let logger = Arc::clone(&ctx.logger);
    match tokio::task::spawn_blocking(move || logger.record(&record)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to record transfer"),
        Err(e) => warn!(error = %e, "Transfer record task failed"),
    }
}

/// Broadcast the snapshot and overwrite the state file.
async fn publish(ctx: &RunContext, snapshot: &StateSnapshot) {
    ctx.progress.publish(snapshot);
    let logger = Arc::clone(&ctx.logger);
    let snapshot = snapshot.clone();
    match tokio::task::spawn_blocking(move || logger.write_state(&snapshot)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to write state"),
        Err(e) => warn!(error = %e, "State write task failed"),
    }
}
