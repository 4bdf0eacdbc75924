//! Core data model for backup jobs.
//!
//! This module defines the main data structures:
//! - Job: a registered backup definition (source tree, target tree, save type)
//! - StateSnapshot: the single current live-progress record of a running job
//! - TransferRecord: one append-only log entry per copied file
//! - SaveType, RunState: enums controlling behavior

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::control::PauseSignal;

/// Sentinel transfer duration recorded when a copy fails.
pub const COPY_FAILED_MS: i64 = -1;

/// A registered backup job.
///
/// Only the identity, name, paths and save type are persisted. The pause
/// signal is a runtime handle: clones of a `Job` share it, so a copy handed
/// out by the manager can still be used to observe the pause state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Job {
    /// Unique positive identifier
    pub id: u32,

    /// Display name, also used as the key in state and transfer logs
    pub name: String,

    /// Absolute source directory
    pub source_directory: PathBuf,

    /// Absolute target directory
    pub target_directory: PathBuf,

    /// Full or differential copy
    pub save_type: SaveType,

    /// Set when a user paused the job explicitly; business-software
    /// detection never resumes a manually paused job.
    #[serde(skip)]
    pub manually_paused: bool,

    /// Cleared while the job is paused
    #[serde(skip)]
    pub pause: PauseSignal,
}

impl Job {
    /// Build a job with a fresh (running) pause signal.
    pub fn new(
        id: u32,
        name: impl Into<String>,
        source_directory: impl Into<PathBuf>,
        target_directory: impl Into<PathBuf>,
        save_type: SaveType,
    ) -> Self {
        Job {
            id,
            name: name.into(),
            source_directory: source_directory.into(),
            target_directory: target_directory.into(),
            save_type,
            manually_paused: false,
            pause: PauseSignal::default(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.save_type == SaveType::Full
    }
}

/// Backup mode of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveType {
    /// Copy every source file unconditionally
    Full,
    /// Copy a file only if it is missing at the target or newer at the source
    Differential,
}

impl SaveType {
    pub fn from_full_flag(is_full: bool) -> Self {
        if is_full {
            SaveType::Full
        } else {
            SaveType::Differential
        }
    }
}

impl std::fmt::Display for SaveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaveType::Full => write!(f, "Full"),
            SaveType::Differential => write!(f, "Differential"),
        }
    }
}

/// Textual state of a run as written to the state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Active,
    Finished,
}

/// The single current progress record of a job run.
///
/// Overwritten after every file; there is no history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateSnapshot {
    pub name: String,
    pub time_stamp: DateTime<Local>,
    pub state: RunState,
    pub total_files_to_copy: u64,
    pub total_files_size: u64,
    pub files_left_to_do: u64,
    pub bytes_left_to_do: u64,
    /// Integer percent, 0 to 100
    pub progression: u8,
    pub source_file_path: PathBuf,
    pub target_file_path: PathBuf,
}

impl StateSnapshot {
    /// Initial snapshot published before the first file is processed.
    pub fn start(name: &str, total_files: u64, total_bytes: u64) -> Self {
        StateSnapshot {
            name: name.to_string(),
            time_stamp: Local::now(),
            state: RunState::Active,
            total_files_to_copy: total_files,
            total_files_size: total_bytes,
            files_left_to_do: total_files,
            bytes_left_to_do: total_bytes,
            progression: 0,
            source_file_path: PathBuf::new(),
            target_file_path: PathBuf::new(),
        }
    }

    /// Account for one processed file of `size` bytes.
    pub fn advance(&mut self, size: u64, source: &Path, target: &Path) {
        self.time_stamp = Local::now();
        self.files_left_to_do = self.files_left_to_do.saturating_sub(1);
        self.bytes_left_to_do = self.bytes_left_to_do.saturating_sub(size);
        self.source_file_path = source.to_path_buf();
        self.target_file_path = target.to_path_buf();
        self.progression = self.percent();
    }

    /// Terminal snapshot: 100%, paths cleared.
    pub fn finish(&mut self) {
        self.time_stamp = Local::now();
        self.state = RunState::Finished;
        self.files_left_to_do = 0;
        self.bytes_left_to_do = 0;
        self.progression = 100;
        self.source_file_path = PathBuf::new();
        self.target_file_path = PathBuf::new();
    }

    fn percent(&self) -> u8 {
        if self.total_files_to_copy == 0 {
            return 100;
        }
        let processed = self.total_files_to_copy - self.files_left_to_do;
        (processed * 100 / self.total_files_to_copy) as u8
    }
}

/// One append-only log entry describing a copied file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransferRecord {
    pub time_stamp: DateTime<Local>,
    pub client_id: String,
    pub job_name: String,
    pub source_file: PathBuf,
    pub target_file: PathBuf,
    pub file_size: u64,
    /// Copy duration in milliseconds; `COPY_FAILED_MS` when the copy failed
    pub transfer_time_ms: i64,
    /// Encryption duration in milliseconds; 0 when not encrypted, negative on error
    pub encryption_time_ms: i64,
}

impl TransferRecord {
    pub fn copy_failed(&self) -> bool {
        self.transfer_time_ms < 0
    }
}

/// Identity of the operator running the engine, recorded in every transfer.
pub fn operator_identity() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
