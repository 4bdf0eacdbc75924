//! Transfer record dispatch.
//!
//! `TransferLogger` applies the configured destination policy: records go to
//! the local daily log, to the collector queue, or both. State snapshots are
//! always local and synchronous; they never reach the network.

use std::sync::Arc;

use tracing::warn;

use crate::error::EngineError;
use crate::journal::{DailyLog, StateStore};
use crate::model::{StateSnapshot, TransferRecord};
use crate::settings::{LogDestination, Settings};
use crate::shipper::LogShipper;

pub struct TransferLogger {
    destination: LogDestination,
    daily: DailyLog,
    states: StateStore,
    shipper: Option<Arc<LogShipper>>,
}

impl TransferLogger {
    /// Build from settings. `shipper` is required for centralized delivery;
    /// without one, centralized records are logged as undeliverable.
    pub fn new(settings: &Settings, shipper: Option<Arc<LogShipper>>) -> Self {
        TransferLogger {
            destination: settings.log_destination,
            daily: DailyLog::new(&settings.log_directory, settings.log_format),
            states: StateStore::new(&settings.state_file),
            shipper,
        }
    }

    pub fn destination(&self) -> LogDestination {
        self.destination
    }

    pub fn daily_log(&self) -> &DailyLog {
        &self.daily
    }

    pub fn state_store(&self) -> &StateStore {
        &self.states
    }

    pub fn shipper(&self) -> Option<&Arc<LogShipper>> {
        self.shipper.as_ref()
    }

    /// Record one transfer under the destination policy.
    pub fn record(&self, record: &TransferRecord) -> Result<(), EngineError> {
        if self.destination.includes_centralized() {
            match &self.shipper {
                Some(shipper) => {
                    let line = serde_json::to_string(record).map_err(|e| {
                        EngineError::Persistence {
                            path: record.source_file.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    shipper.enqueue(line);
                }
                None => warn!(job = %record.job_name, "No log shipper configured; record not sent"),
            }
        }
        if self.destination.includes_local() {
            self.daily.append(record)?;
        }
        Ok(())
    }

    /// Overwrite the job's live state.
    pub fn write_state(&self, snapshot: &StateSnapshot) -> Result<(), EngineError> {
        self.states.write(snapshot)
    }
}
