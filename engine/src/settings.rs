//! Engine configuration.
//!
//! Settings are a plain value loaded once and handed to the manager; every
//! field has a default so a partial (or missing) settings file still works.
//! Default file locations live in the per-user configuration directory, so
//! the registry is the same whatever the working directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Application folder under the user's configuration directory.
pub const APP_DIR_NAME: &str = "EasySave";

/// Per-user configuration directory (`~/.config/EasySave` on Linux,
/// `%APPDATA%\EasySave` on Windows).
pub fn config_directory() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Default settings file inside the configuration directory.
pub fn default_settings_path() -> PathBuf {
    config_directory().join("settings.json")
}

/// On-disk format of the daily transfer log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Xml,
}

impl LogFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Xml => "xml",
        }
    }
}

/// Where transfer records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogDestination {
    #[default]
    Local,
    Centralized,
    Both,
}

impl LogDestination {
    pub fn includes_local(&self) -> bool {
        matches!(self, LogDestination::Local | LogDestination::Both)
    }

    pub fn includes_centralized(&self) -> bool {
        matches!(self, LogDestination::Centralized | LogDestination::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    /// Extensions encrypted after copy
    pub encrypted_extensions: Vec<String>,
    /// Extensions processed before any other file, system-wide
    pub priority_extensions: Vec<String>,
    /// Files strictly larger than this many kilobytes take the large-file slot
    pub large_file_threshold_kb: u64,
    pub max_concurrent_jobs: usize,
    /// Process names that block or pause backups while running
    pub business_software: Vec<String>,
    pub log_format: LogFormat,
    pub log_destination: LogDestination,
    pub log_directory: PathBuf,
    pub state_file: PathBuf,
    pub jobs_file: PathBuf,
    pub collector_host: String,
    pub collector_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        let dir = config_directory();
        Settings {
            encrypted_extensions: Vec::new(),
            priority_extensions: Vec::new(),
            large_file_threshold_kb: 1024 * 1024,
            max_concurrent_jobs: 3,
            business_software: Vec::new(),
            log_format: LogFormat::Json,
            log_destination: LogDestination::Local,
            log_directory: dir.join("logs"),
            state_file: dir.join("state.json"),
            jobs_file: dir.join("jobs.json"),
            collector_host: "127.0.0.1".to_string(),
            collector_port: 9000,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
            Err(e) => {
                return Err(EngineError::Persistence {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        };
        let settings: Settings = serde_json::from_str(&text)
            .map_err(|e| EngineError::configuration(path.display().to_string(), e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_concurrent_jobs == 0 {
            return Err(EngineError::configuration(
                "MaxConcurrentJobs",
                "must be at least 1",
            ));
        }
        if self.log_destination.includes_centralized() && self.collector_host.trim().is_empty() {
            return Err(EngineError::configuration(
                "CollectorHost",
                "required when logs are centralized",
            ));
        }
        Ok(())
    }

    pub fn large_file_threshold_bytes(&self) -> u64 {
        self.large_file_threshold_kb.saturating_mul(1024)
    }

    /// `host:port` of the log collector.
    pub fn collector_address(&self) -> String {
        format!("{}:{}", self.collector_host, self.collector_port)
    }

    pub fn is_encrypted(&self, path: &Path) -> bool {
        matches_extension(path, &self.encrypted_extensions)
    }

    pub fn is_priority(&self, path: &Path) -> bool {
        matches_extension(path, &self.priority_extensions)
    }
}

/// Case-insensitive extension match; configured entries may carry a leading dot.
pub fn matches_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.'))
        .any(|e| !e.is_empty() && e.eq_ignore_ascii_case(ext))
}
