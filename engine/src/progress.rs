//! Progress reporting.
//!
//! This module decouples the engine from any front-end:
//! - `MessageSink`: receives human-readable status lines
//! - `PasswordPrompt`: asked for a password before a file is encrypted
//! - `ProgressHub`: broadcasts every published StateSnapshot
//!
//! The hub is a bounded broadcast channel. A subscriber that falls behind
//! loses the oldest snapshots and sees a `Lagged` error, never blocks a run.

use tokio::sync::broadcast;

use crate::model::StateSnapshot;

/// Snapshot buffer per subscriber before the oldest entries are dropped.
pub const PROGRESS_CAPACITY: usize = 256;

/// Receives status text for whichever front-end is active.
pub trait MessageSink: Send + Sync {
    fn message(&self, text: &str);
}

impl<F> MessageSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn message(&self, text: &str) {
        self(text)
    }
}

/// Supplies the password used to encrypt a copied file.
///
/// Returning `None` leaves the file unencrypted.
pub trait PasswordPrompt: Send + Sync {
    fn password(&self, prompt: &str) -> Option<String>;
}

impl<F> PasswordPrompt for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn password(&self, prompt: &str) -> Option<String> {
        self(prompt)
    }
}

/// Fixed password, for non-interactive front-ends.
#[derive(Debug, Clone)]
pub struct StaticPassword(pub String);

impl PasswordPrompt for StaticPassword {
    fn password(&self, _prompt: &str) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Broadcasts StateSnapshots to any number of subscribers.
#[derive(Debug, Clone)]
pub struct ProgressHub {
    sender: broadcast::Sender<StateSnapshot>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::with_capacity(PROGRESS_CAPACITY)
    }
}

impl ProgressHub {
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity);
        ProgressHub { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateSnapshot> {
        self.sender.subscribe()
    }

    /// Publish a snapshot; silently dropped when nobody listens.
    pub fn publish(&self, snapshot: &StateSnapshot) {
        let _ = self.sender.send(snapshot.clone());
    }
}
