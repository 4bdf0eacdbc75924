//! Cross-job priority barrier.
//!
//! Every run announces how many priority files it holds before it processes
//! anything. While the system-wide outstanding count is positive, normal files
//! in every running job wait. The gate is owned by the manager and passed into
//! each run; there is no process-wide static.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Outstanding priority-file counter plus its "no priority pending" signal.
///
/// The signal is recomputed from the counter under the watch lock on every
/// change, so it is always the complement of `outstanding() > 0`.
#[derive(Debug)]
pub struct PriorityGate {
    outstanding: AtomicUsize,
    clear: watch::Sender<bool>,
}

impl Default for PriorityGate {
    fn default() -> Self {
        let (clear, _rx) = watch::channel(true);
        PriorityGate {
            outstanding: AtomicUsize::new(0),
            clear,
        }
    }
}

impl PriorityGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `count` outstanding priority files. Closes the gate when `count > 0`.
    pub fn announce(&self, count: usize) {
        if count == 0 {
            return;
        }
        let now = self.outstanding.fetch_add(count, Ordering::SeqCst) + count;
        debug!(count, outstanding = now, "Priority files announced");
        self.sync_signal();
    }

    /// Mark one priority file done. Opens the gate when the count reaches zero.
    pub fn complete(&self) {
        self.release(1);
    }

    /// Mark up to `count` priority files done without going below zero.
    pub fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let result = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(count))
            });
        if let Ok(previous) = result {
            if previous < count {
                warn!(previous, count, "Priority release exceeded outstanding count");
            }
        }
        self.sync_signal();
    }

    /// Number of priority files not yet completed, system-wide.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// True when no priority file is pending anywhere.
    pub fn is_clear(&self) -> bool {
        *self.clear.borrow()
    }

    /// Block until no priority file is pending. Returns `Cancelled` if `cancel` fires first.
    pub async fn wait_clear(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let mut rx = self.clear.subscribe();
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let clear = *rx.borrow_and_update();
            if clear {
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

    /// Announce `count` files and return a lease that releases whatever the
    /// run did not complete when it is dropped (cancellation, early return).
    pub fn lease(self: &Arc<Self>, count: usize) -> PriorityLease {
        self.announce(count);
        PriorityLease {
            gate: Arc::clone(self),
            remaining: count,
        }
    }

    fn sync_signal(&self) {
        self.clear.send_if_modified(|clear| {
            let now_clear = self.outstanding.load(Ordering::SeqCst) == 0;
            if *clear == now_clear {
                false
            } else {
                *clear = now_clear;
                true
            }
        });
    }
}

/// One run's share of the outstanding priority count.
#[derive(Debug)]
pub struct PriorityLease {
    gate: Arc<PriorityGate>,
    remaining: usize,
}

impl PriorityLease {
    /// Report one priority file of this run as done.
    pub fn complete_one(&mut self) {
        if self.remaining == 0 {
            return;
        }
        self.remaining -= 1;
        self.gate.complete();
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Drop for PriorityLease {
    fn drop(&mut self) {
        if self.remaining > 0 {
            debug!(remaining = self.remaining, "Releasing unfinished priority files");
            self.gate.release(self.remaining);
        }
    }
}
