use std::time::Duration;

use serde::Deserialize;

/// Tunables for the task module, read from the `[tasks]` table of the
/// server config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Observer refresh cadence in milliseconds.
    pub poll_interval_ms: u64,
    /// How many trailing log lines a task view surfaces.
    pub log_tail: usize,
    /// Upper bound for a single long-poll wait (seconds).
    pub max_long_poll_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            log_tail: 10,
            max_long_poll_secs: 120,
        }
    }
}

impl TaskConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
