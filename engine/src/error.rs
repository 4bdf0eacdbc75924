//! Error types for the backup engine.
//!
//! `EngineError` represents errors that stop the requested action (invalid
//! configuration, unknown job, cancellation). Per-file failures during a run
//! are recorded in the transfer log with sentinel durations instead, and never
//! surface as an `EngineError` from the run itself.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur at the job or manager level.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required field is blank, or a path that must be absolute is relative.
    #[error("Invalid configuration for {field}: {reason}")]
    Configuration { field: String, reason: String },

    /// No job with this id is registered
    #[error("Job {id} not found")]
    JobNotFound { id: u32 },

    /// The job is already executing
    #[error("Job {id} is already running")]
    JobAlreadyRunning { id: u32 },

    /// A configured business application is running; the job was not started
    #[error("Business software is running: {}", names.join(", "))]
    BusinessSoftwareRunning { names: Vec<String> },

    /// The run was cancelled before it finished
    #[error("Job execution was cancelled")]
    Cancelled,

    /// Failed to read from a source file
    #[error("Failed to read file: {}", path.display())]
    ReadError { path: PathBuf, source: io::Error },

    /// Failed to write to a destination file
    #[error("Failed to write file: {}", path.display())]
    WriteError { path: PathBuf, source: io::Error },

    /// Failed to enumerate the source tree
    #[error("Failed to enumerate directory: {}", path.display())]
    EnumerationFailed { path: PathBuf, source: io::Error },

    /// Failed to create a directory
    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed { path: PathBuf, source: io::Error },

    /// A blocking filesystem task panicked or was aborted
    #[error("Background task failed: {reason}")]
    TaskFailed { reason: String },

    /// Failed to load or save a persisted document (registry, logs, state)
    #[error("Persistence failure for {}: {reason}", path.display())]
    Persistence { path: PathBuf, reason: String },
}

impl EngineError {
    /// Shorthand for a configuration error on `field`.
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<u32> {
        match self {
            Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::EnumerationFailed { source, .. }
            | Self::DirectoryCreationFailed { source, .. } => {
                source.raw_os_error().map(|e| e as u32)
            }
            _ => None,
        }
    }

    pub(crate) fn task_failed(err: tokio::task::JoinError) -> Self {
        Self::TaskFailed {
            reason: err.to_string(),
        }
    }

    /// True for errors the caller should report before doing anything else.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}
