//! Persistence of the job registry.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::EngineError;
use crate::journal::{persistence, write_file};
use crate::model::Job;

/// Loads and saves the full list of registered jobs.
pub trait JobStore: Send + Sync {
    fn load(&self) -> Result<Vec<Job>, EngineError>;
    fn save(&self, jobs: &[Job]) -> Result<(), EngineError>;
}

/// Registry kept as a JSON array on disk.
#[derive(Debug)]
pub struct JsonJobStore {
    path: PathBuf,
}

impl JsonJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonJobStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JobStore for JsonJobStore {
    /// A missing or empty file is an empty registry.
    fn load(&self) -> Result<Vec<Job>, EngineError> {
        match fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(Vec::new()),
            Ok(text) => serde_json::from_str(&text).map_err(|e| persistence(&self.path, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(persistence(&self.path, e)),
        }
    }

    fn save(&self, jobs: &[Job]) -> Result<(), EngineError> {
        let text = serde_json::to_string_pretty(jobs).map_err(|e| persistence(&self.path, e))?;
        write_file(&self.path, &text)
    }
}

/// Registry that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<Job>>,
}

impl MemoryJobStore {
    pub fn with_jobs(jobs: Vec<Job>) -> Self {
        MemoryJobStore {
            jobs: Mutex::new(jobs),
        }
    }
}

impl JobStore for MemoryJobStore {
    fn load(&self) -> Result<Vec<Job>, EngineError> {
        Ok(self.jobs.lock().clone())
    }

    fn save(&self, jobs: &[Job]) -> Result<(), EngineError> {
        *self.jobs.lock() = jobs.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SaveType;

    #[test]
    fn test_json_store_missing_file_is_empty() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = JsonJobStore::new(temp_dir.path().join("jobs.json"));
        assert!(store.load().expect("load").is_empty());
    }

    #[test]
    fn test_json_store_persists_jobs() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("config").join("jobs.json");
        let store = JsonJobStore::new(&path);

        let jobs = vec![
            Job::new(1, "docs", "/data/docs", "/backup/docs", SaveType::Full),
            Job::new(2, "photos", "/data/photos", "/backup/photos", SaveType::Differential),
        ];
        store.save(&jobs).expect("save");

        let loaded = JsonJobStore::new(&path).load().expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].name, "photos");
        assert_eq!(loaded[1].save_type, SaveType::Differential);
        assert!(!loaded[0].pause.is_paused());
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("jobs.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(matches!(
            JsonJobStore::new(&path).load(),
            Err(EngineError::Persistence { .. })
        ));
    }

    #[test]
    fn test_memory_store_round_trips() {
        let store = MemoryJobStore::default();
        store
            .save(&[Job::new(7, "a", "/a", "/b", SaveType::Full)])
            .expect("save");
        assert_eq!(store.load().expect("load")[0].id, 7);
    }
}
