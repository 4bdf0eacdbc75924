//! Run-control primitives shared between the manager and job runs.
//!
//! - `PauseSignal`: per-job flag, set while the job may run
//! - `LargeFileThrottle`: system-wide single slot for oversized file copies

use std::fmt;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// Pause/resume capability of a job. Defaults to running.
///
/// Clones share the same underlying flag.
#[derive(Clone)]
pub struct PauseSignal {
    running: Arc<watch::Sender<bool>>,
}

impl Default for PauseSignal {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(true);
        PauseSignal {
            running: Arc::new(tx),
        }
    }
}

impl fmt::Debug for PauseSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PauseSignal")
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl PauseSignal {
    /// Clear the signal; runs block at their next file boundary.
    pub fn pause(&self) {
        self.running.send_replace(false);
    }

    /// Set the signal; blocked runs continue.
    pub fn resume(&self) {
        self.running.send_replace(true);
    }

    pub fn is_paused(&self) -> bool {
        !*self.running.borrow()
    }

    /// Block until the signal is set. Returns `Cancelled` if `cancel` fires first.
    pub async fn wait_running(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let mut rx = self.running.subscribe();
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let running = *rx.borrow_and_update();
            if running {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::Cancelled);
                    }
                }
            }
        }
    }
}

/// Single-slot throttle: at most one large file is copied at any instant.
#[derive(Debug, Clone)]
pub struct LargeFileThrottle {
    slot: Arc<Semaphore>,
}

impl Default for LargeFileThrottle {
    fn default() -> Self {
        LargeFileThrottle {
            slot: Arc::new(Semaphore::new(1)),
        }
    }
}

impl LargeFileThrottle {
    /// Wait for the slot. The permit releases it on drop, whatever the copy outcome.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SemaphorePermit<'_>, EngineError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            permit = self.slot.acquire() => permit.map_err(|_| EngineError::Cancelled),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }
}
