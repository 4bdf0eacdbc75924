//! # EasySave Engine - Backup Job Library
//!
//! A headless backup engine in Rust, shared by every front-end (CLI, collector
//! tooling, automation).
//!
//! ## Overview
//!
//! The engine runs full or differential file-tree backups under resource
//! constraints. It features:
//! - Bounded concurrent job admission
//! - A system-wide priority barrier: priority files of every running job are
//!   copied before any normal file
//! - A single-slot throttle for oversized files
//! - Pause/resume, including automatic pausing while business software runs
//! - Cooperative cancellation
//! - Optional per-file AES-256-CBC encryption
//! - Transfer logging to dated local files and/or a remote log collector
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{default_settings_path, JobManager, RunHooks, Settings};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), engine::EngineError> {
//! let manager = JobManager::open(Settings::load(&default_settings_path())?)?;
//! let job = manager.create_job("docs", "/home/me/docs", "/mnt/backup/docs", true)?;
//!
//! let mut progress = manager.subscribe_progress();
//! tokio::spawn(async move {
//!     while let Ok(state) = progress.recv().await {
//!         println!("{}: {}%", state.name, state.progression);
//!     }
//! });
//!
//! manager
//!     .execute_job(job.id, RunHooks::default(), &CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (Job, StateSnapshot, TransferRecord)
//! - **error**: Error types
//! - **settings**: Configuration
//! - **fs_ops**: Filesystem enumeration and copying
//! - **crypto**: Password-based file encryption
//! - **priority**: System-wide priority barrier
//! - **control**: Pause signal and large-file throttle
//! - **progress**: Front-end callbacks and the snapshot broadcast
//! - **journal**: Daily transfer log and state file
//! - **shipper**: Log collector client
//! - **logger**: Transfer record dispatch
//! - **process**: Business software detection
//! - **job**: Single job execution
//! - **store**: Job registry persistence
//! - **manager**: Job orchestration

pub mod model;
pub mod error;
pub mod settings;
pub mod fs_ops;
pub mod crypto;
pub mod priority;
pub mod control;
pub mod progress;
pub mod journal;
pub mod shipper;
pub mod logger;
pub mod process;
pub mod job;
pub mod store;
pub mod manager;

// Re-export main types and functions
pub use model::{Job, RunState, SaveType, StateSnapshot, TransferRecord};
pub use error::EngineError;
pub use settings::{config_directory, default_settings_path, LogDestination, LogFormat, Settings};
pub use crypto::{decrypt_file, encrypt_file, CryptoOutcome};
pub use priority::{PriorityGate, PriorityLease};
pub use control::{LargeFileThrottle, PauseSignal};
pub use progress::{MessageSink, PasswordPrompt, ProgressHub, StaticPassword};
pub use shipper::{check_connection, ConnectionState, LogShipper, HANDSHAKE};
pub use logger::TransferLogger;
pub use process::{ProcessObserver, SystemProcessObserver};
pub use job::{run_job, RunContext, RunHooks, RunOutcome, RunSummary};
pub use store::{JobStore, JsonJobStore, MemoryJobStore};
pub use manager::JobManager;
