//! Local persistence of transfer records and live state.
//!
//! - `DailyLog`: one file per day (`yyyy-MM-dd.json` or `.xml`) holding every
//!   TransferRecord of that day. The file is re-read, appended to and
//!   rewritten under a single lock so concurrent jobs never interleave.
//! - `StateStore`: one JSON object keyed by job name, holding the latest
//!   StateSnapshot of each job, overwritten in place.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::{StateSnapshot, TransferRecord};
use crate::settings::LogFormat;

/// XML document root of a daily log.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "DailyLogs")]
struct DailyLogs {
    #[serde(rename = "TransferRecord", default)]
    records: Vec<TransferRecord>,
}

#[derive(Debug)]
pub struct DailyLog {
    directory: PathBuf,
    format: LogFormat,
    lock: Mutex<()>,
}

impl DailyLog {
    pub fn new(directory: impl Into<PathBuf>, format: LogFormat) -> Self {
        DailyLog {
            directory: directory.into(),
            format,
            lock: Mutex::new(()),
        }
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Path of the log file for `date`.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.directory
            .join(format!("{}.{}", date.format("%Y-%m-%d"), self.format.extension()))
    }

    /// Append one record to the file of the record's own date.
    pub fn append(&self, record: &TransferRecord) -> Result<(), EngineError> {
        let path = self.path_for(record.time_stamp.date_naive());
        let _guard = self.lock.lock();

        let mut records = self.load(&path)?;
        records.push(record.clone());
        self.store(&path, records)
    }

    /// All records of `date`; empty when no file exists yet.
    pub fn read(&self, date: NaiveDate) -> Result<Vec<TransferRecord>, EngineError> {
        let path = self.path_for(date);
        let _guard = self.lock.lock();
        self.load(&path)
    }

    fn load(&self, path: &Path) -> Result<Vec<TransferRecord>, EngineError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(persistence(path, e)),
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        match self.format {
            LogFormat::Json => serde_json::from_str(&text).map_err(|e| persistence(path, e)),
            LogFormat::Xml => quick_xml::de::from_str::<DailyLogs>(&text)
                .map(|logs| logs.records)
                .map_err(|e| persistence(path, e)),
        }
    }

    fn store(&self, path: &Path, records: Vec<TransferRecord>) -> Result<(), EngineError> {
        let text = match self.format {
            LogFormat::Json => {
                serde_json::to_string_pretty(&records).map_err(|e| persistence(path, e))?
            }
            LogFormat::Xml => quick_xml::se::to_string(&DailyLogs { records })
                .map_err(|e| persistence(path, e))?,
        };
        write_file(path, &text)
    }
}

/// Latest StateSnapshot of every job, in one JSON document.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StateStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the job's entry with `snapshot`.
    pub fn write(&self, snapshot: &StateSnapshot) -> Result<(), EngineError> {
        let _guard = self.lock.lock();
        let mut states = self.load()?;
        states.insert(snapshot.name.clone(), snapshot.clone());
        let text = serde_json::to_string_pretty(&states).map_err(|e| persistence(&self.path, e))?;
        write_file(&self.path, &text)
    }

    /// Current snapshot of `job_name`, if one was ever written.
    pub fn read(&self, job_name: &str) -> Result<Option<StateSnapshot>, EngineError> {
        let _guard = self.lock.lock();
        Ok(self.load()?.remove(job_name))
    }

    fn load(&self) -> Result<BTreeMap<String, StateSnapshot>, EngineError> {
        match fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => serde_json::from_str(&text).map_err(|e| persistence(&self.path, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(persistence(&self.path, e)),
        }
    }
}

pub(crate) fn write_file(path: &Path, text: &str) -> Result<(), EngineError> {
    crate::fs_ops::ensure_parent_dir_exists(path)?;
    fs::write(path, text).map_err(|e| persistence(path, e))
}

pub(crate) fn persistence(path: &Path, err: impl std::fmt::Display) -> EngineError {
    EngineError::Persistence {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}
