//! Detection of competing business applications.

use parking_lot::Mutex;
use sysinfo::System;

/// Answers whether any of a set of named processes is running.
pub trait ProcessObserver: Send + Sync {
    /// Names from `names` that are currently running.
    fn running(&self, names: &[String]) -> Vec<String>;

    fn is_any_running(&self, names: &[String]) -> bool {
        !self.running(names).is_empty()
    }
}

/// Observer backed by the operating system process table.
pub struct SystemProcessObserver {
    system: Mutex<System>,
}

impl Default for SystemProcessObserver {
    fn default() -> Self {
        SystemProcessObserver {
            system: Mutex::new(System::new()),
        }
    }
}

impl ProcessObserver for SystemProcessObserver {
    fn running(&self, names: &[String]) -> Vec<String> {
        if names.iter().all(|n| n.trim().is_empty()) {
            return Vec::new();
        }
        let mut system = self.system.lock();
        system.refresh_processes();

        let live: Vec<String> = system
            .processes()
            .values()
            .map(|p| normalize(p.name()))
            .collect();

        names
            .iter()
            .filter(|name| {
                let wanted = normalize(name);
                !wanted.is_empty() && live.iter().any(|p| *p == wanted)
            })
            .cloned()
            .collect()
    }
}

/// Lowercase, without a trailing `.exe`.
fn normalize(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    lower
        .strip_suffix(".exe")
        .map(str::to_string)
        .unwrap_or(lower)
}
