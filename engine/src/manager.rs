//! Job orchestration.
//!
//! `JobManager` owns the job registry and every resource shared by runs:
//! - Bounded admission: at most `MaxConcurrentJobs` runs execute at once
//! - One cancellation handle per running job, for `stop_job`
//! - One business-software watcher per run, pausing and resuming the job
//! - The run context (priority gate, large-file slot, logger, progress hub)
//!
//! The registry is guarded by a single lock. Callers always receive copies of
//! jobs; a copy still shares the job's pause signal.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::control::PauseSignal;
use crate::error::EngineError;
use crate::job::{run_job, RunContext, RunHooks, RunOutcome};
use crate::logger::TransferLogger;
use crate::model::{Job, SaveType, StateSnapshot};
use crate::priority::PriorityGate;
use crate::process::{ProcessObserver, SystemProcessObserver};
use crate::settings::Settings;
use crate::shipper::{LogShipper, DEFAULT_RETRY_DELAY};
use crate::store::{JobStore, JsonJobStore};

/// How often a run's watcher polls for business software.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);

type Registry = Arc<Mutex<Vec<Job>>>;

struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
}

pub struct JobManager {
    jobs: Registry,
    store: Arc<dyn JobStore>,
    observer: Arc<dyn ProcessObserver>,
    admission: Arc<Semaphore>,
    context: RunContext,
    running: Mutex<HashMap<u32, RunHandle>>,
    watch_interval: Duration,
}

impl JobManager {
    /// Build a manager over `store`, loading the persisted registry.
    ///
    /// `shipper` is only used when the log destination includes the collector.
    pub fn new(
        settings: Settings,
        store: Arc<dyn JobStore>,
        observer: Arc<dyn ProcessObserver>,
        shipper: Option<Arc<LogShipper>>,
    ) -> Result<Self, EngineError> {
        settings.validate()?;
        let jobs = store.load()?;
        let logger = Arc::new(TransferLogger::new(&settings, shipper));
        let admission = Arc::new(Semaphore::new(settings.max_concurrent_jobs));

        info!(
            jobs = jobs.len(),
            max_concurrent = settings.max_concurrent_jobs,
            destination = ?settings.log_destination,
            "Job manager ready"
        );

        Ok(JobManager {
            jobs: Arc::new(Mutex::new(jobs)),
            store,
            observer,
            admission,
            context: RunContext::new(Arc::new(settings), logger),
            running: Mutex::new(HashMap::new()),
            watch_interval: DEFAULT_WATCH_INTERVAL,
        })
    }

    /// Production wiring: JSON registry at `settings.jobs_file`, the OS
    /// process table, and a log shipper when records go to the collector.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(settings: Settings) -> Result<Self, EngineError> {
        let store = Arc::new(JsonJobStore::new(&settings.jobs_file));
        let shipper = settings
            .log_destination
            .includes_centralized()
            .then(|| Arc::new(LogShipper::spawn(settings.collector_address(), DEFAULT_RETRY_DELAY)));
        Self::new(
            settings,
            store,
            Arc::new(SystemProcessObserver::default()),
            shipper,
        )
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.context.settings
    }

    pub fn priority_gate(&self) -> &Arc<PriorityGate> {
        &self.context.gate
    }

    pub fn logger(&self) -> &Arc<TransferLogger> {
        &self.context.logger
    }

    /// Receive every StateSnapshot published by any run.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<StateSnapshot> {
        self.context.progress.subscribe()
    }

    /// Register a new job and persist the registry.
    ///
    /// # Errors
    /// `Configuration` when a field is blank or a path is not absolute; the
    /// registry is left unchanged.
    pub fn create_job(
        &self,
        name: &str,
        source: &str,
        target: &str,
        is_full: bool,
    ) -> Result<Job, EngineError> {
        validate_definition(name, source, target)?;

        let mut jobs = self.jobs.lock();
        let id = jobs.iter().map(|j| j.id).max().map_or(1, |max| max + 1);
        let job = Job::new(id, name.trim(), source, target, SaveType::from_full_flag(is_full));
        jobs.push(job.clone());

        if let Err(e) = self.store.save(&jobs) {
            jobs.pop();
            return Err(e);
        }
        info!(id, name = %job.name, "Job created");
        Ok(job)
    }

    /// Remove a job. Unknown ids are ignored.
    pub fn delete_job(&self, id: u32) -> Result<(), EngineError> {
        let mut jobs = self.jobs.lock();
        let Some(index) = jobs.iter().position(|j| j.id == id) else {
            debug!(id, "Delete of unknown job ignored");
            return Ok(());
        };
        let removed = jobs.remove(index);
        if let Err(e) = self.store.save(&jobs) {
            jobs.insert(index, removed);
            return Err(e);
        }
        info!(id, name = %removed.name, "Job deleted");
        Ok(())
    }

    /// Overwrite the name, paths and save type of the job with `job.id`.
    /// Unknown ids are ignored.
    pub fn edit_job(&self, job: &Job) -> Result<(), EngineError> {
        validate_definition(
            &job.name,
            &job.source_directory.to_string_lossy(),
            &job.target_directory.to_string_lossy(),
        )?;

        let mut jobs = self.jobs.lock();
        let Some(existing) = jobs.iter_mut().find(|j| j.id == job.id) else {
            debug!(id = job.id, "Edit of unknown job ignored");
            return Ok(());
        };
        let previous = existing.clone();
        existing.name = job.name.trim().to_string();
        existing.source_directory = job.source_directory.clone();
        existing.target_directory = job.target_directory.clone();
        existing.save_type = job.save_type;

        if let Err(e) = self.store.save(&jobs) {
            if let Some(slot) = jobs.iter_mut().find(|j| j.id == job.id) {
                *slot = previous;
            }
            return Err(e);
        }
        info!(id = job.id, "Job updated");
        Ok(())
    }

    /// Copy of every registered job.
    pub fn get_jobs(&self) -> Vec<Job> {
        self.jobs.lock().clone()
    }

    pub fn get_job(&self, id: u32) -> Option<Job> {
        self.jobs.lock().iter().find(|j| j.id == id).cloned()
    }

    /// Ids of jobs with a run in progress (admitted or waiting for admission).
    pub fn running_jobs(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.running.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Run one job to completion.
    ///
    /// # Errors
    /// - `JobNotFound` for an unknown id
    /// - `BusinessSoftwareRunning` when a configured application is running;
    ///   nothing is started
    /// - `JobAlreadyRunning` when the job already has a run in progress
    /// - `Cancelled` when `cancel` fires or `stop_job` is called
    pub async fn execute_job(
        &self,
        id: u32,
        hooks: RunHooks<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let job = self.get_job(id).ok_or(EngineError::JobNotFound { id })?;

        let blockers = self.business_software_running().await?;
        if !blockers.is_empty() {
            warn!(id, software = ?blockers, "Business software running; job not started");
            if let Some(sink) = hooks.messages {
                sink.message(&format!(
                    "Job '{}' not started: business software running ({})",
                    job.name,
                    blockers.join(", ")
                ));
            }
            return Err(EngineError::BusinessSoftwareRunning { names: blockers });
        }

        let run_id = Uuid::new_v4();
        let run_cancel = cancel.child_token();
        {
            let mut running = self.running.lock();
            if running.contains_key(&id) {
                return Err(EngineError::JobAlreadyRunning { id });
            }
            running.insert(
                id,
                RunHandle {
                    run_id,
                    cancel: run_cancel.clone(),
                },
            );
        }
        let _registration = Registration {
            running: &self.running,
            id,
            run_id,
        };

        let span = info_span!("job", id, name = %job.name, run = %run_id);
        async {
            let _permit = tokio::select! {
                _ = run_cancel.cancelled() => return Err(EngineError::Cancelled),
                permit = self.admission.acquire() => permit.map_err(|e| EngineError::TaskFailed {
                    reason: e.to_string(),
                })?,
            };
            debug!("Admitted");

            let watcher_stop = run_cancel.child_token();
            let _watcher_guard = watcher_stop.clone().drop_guard();
            tokio::spawn(watch_business_software(
                Arc::clone(&self.jobs),
                Arc::clone(&self.observer),
                self.context.settings.business_software.clone(),
                id,
                job.pause.clone(),
                self.watch_interval,
                watcher_stop,
            ));

            run_job(&job, &self.context, hooks, &run_cancel).await
        }
        .instrument(span)
        .await
    }

    /// Run every registered job concurrently and wait for all of them.
    ///
    /// Cancelling `cancel` cancels every run; the cancellation is reported
    /// through the message sink and in the per-job results.
    pub async fn execute_all(
        &self,
        hooks: RunHooks<'_>,
        cancel: &CancellationToken,
    ) -> Vec<(u32, Result<RunOutcome, EngineError>)> {
        let ids: Vec<u32> = self.get_jobs().iter().map(|j| j.id).collect();
        info!(jobs = ids.len(), "Executing all jobs");

        let shared = &hooks;
        let runs = ids.iter().map(|&id| async move {
            let result = self.execute_job(id, shared.clone(), cancel).await;
            if let Err(e) = &result {
                match e {
                    EngineError::Cancelled => {}
                    other => warn!(id, error = %other, "Job did not complete"),
                }
            }
            (id, result)
        });
        let results = join_all(runs).await;

        if cancel.is_cancelled() {
            info!("Batch execution cancelled");
            if let Some(sink) = hooks.messages {
                sink.message("Batch execution cancelled");
            }
        }
        results
    }

    /// Pause a job at its next file boundary. Business-software detection
    /// will not resume it.
    pub fn pause_job(&self, id: u32) {
        if let Some(signal) = self.set_manual_pause(id, true) {
            signal.pause();
            info!(id, "Job paused");
        }
    }

    pub fn resume_job(&self, id: u32) {
        if let Some(signal) = self.set_manual_pause(id, false) {
            signal.resume();
            info!(id, "Job resumed");
        }
    }

    /// Cancel the job's run and open its pause signal so a paused run can
    /// observe the cancellation.
    pub fn stop_job(&self, id: u32) {
        let handle = self.running.lock().remove(&id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            info!(id, run = %handle.run_id, "Job stop requested");
        }
        if let Some(signal) = self.set_manual_pause(id, false) {
            signal.resume();
        }
    }

    /// Cancel every run in progress.
    pub fn stop_all(&self) {
        let ids = self.running_jobs();
        for id in ids {
            self.stop_job(id);
        }
    }

    /// Stop every run and flush the log shipper, if any.
    pub async fn shutdown(&self, flush_timeout: Duration) {
        self.stop_all();
        if let Some(shipper) = self.context.logger.shipper() {
            if !shipper.drain(flush_timeout).await {
                warn!(backlog = shipper.backlog(), "Log shipper not drained before shutdown");
            }
            shipper.shutdown().await;
        }
    }

    fn set_manual_pause(&self, id: u32, paused: bool) -> Option<PauseSignal> {
        let mut jobs = self.jobs.lock();
        let job = jobs.iter_mut().find(|j| j.id == id)?;
        job.manually_paused = paused;
        Some(job.pause.clone())
    }

    async fn business_software_running(&self) -> Result<Vec<String>, EngineError> {
        let names = self.context.settings.business_software.clone();
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let observer = Arc::clone(&self.observer);
        tokio::task::spawn_blocking(move || observer.running(&names))
            .await
            .map_err(EngineError::task_failed)
    }
}

/// Removes a run's handle when the run ends, unless a newer run replaced it.
struct Registration<'a> {
    running: &'a Mutex<HashMap<u32, RunHandle>>,
    id: u32,
    run_id: Uuid,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut running = self.running.lock();
        if running.get(&self.id).is_some_and(|h| h.run_id == self.run_id) {
            running.remove(&self.id);
        }
    }
}

/// Pause the job while business software runs; resume it afterwards unless
/// it was paused manually. Exits when `stop` fires.
async fn watch_business_software(
    jobs: Registry,
    observer: Arc<dyn ProcessObserver>,
    names: Vec<String>,
    id: u32,
    pause: PauseSignal,
    interval: Duration,
    stop: CancellationToken,
) {
    if names.is_empty() {
        return;
    }
    let manually_paused =
        |jobs: &Registry| jobs.lock().iter().any(|j| j.id == id && j.manually_paused);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut paused_by_watcher = false;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let observer = Arc::clone(&observer);
        let wanted = names.clone();
        let detected = match tokio::task::spawn_blocking(move || observer.running(&wanted)).await {
            Ok(detected) => detected,
            Err(e) => {
                warn!(error = %e, "Process observer task failed");
                continue;
            }
        };

        if !detected.is_empty() {
            if !pause.is_paused() {
                info!(id, software = ?detected, "Business software detected; pausing job");
                pause.pause();
                paused_by_watcher = true;
            }
        } else if paused_by_watcher && !manually_paused(&jobs) {
            info!(id, "Business software gone; resuming job");
            pause.resume();
            paused_by_watcher = false;
        }
    }

    if paused_by_watcher && !manually_paused(&jobs) {
        pause.resume();
    }
}

fn validate_definition(name: &str, source: &str, target: &str) -> Result<(), EngineError> {
    for (field, value) in [("name", name), ("source", source), ("target", target)] {
        if value.trim().is_empty() {
            return Err(EngineError::configuration(field, "must not be blank"));
        }
    }
    for (field, value) in [("source", source), ("target", target)] {
        if !Path::new(value).is_absolute() {
            return Err(EngineError::configuration(
                field,
                format!("'{value}' is not an absolute path"),
            ));
        }
    }
    Ok(())
}
