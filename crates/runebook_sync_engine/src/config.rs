//! Configuration for the sync engine and orchestrator.

use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of pending ops delivered per push call.
    pub push_batch_size: u32,
    /// Maximum number of remote rows fetched per table per pull call.
    pub pull_batch_size: u32,
    /// Interval of the orchestrator's periodic pull timer.
    pub pull_interval: Duration,
    /// Default trailing-edge debounce for [`schedule_push`].
    ///
    /// [`schedule_push`]: crate::SyncOrchestrator::schedule_push
    pub push_debounce: Duration,
}

impl SyncConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            push_batch_size: 50,
            pull_batch_size: 200,
            pull_interval: Duration::from_secs(30),
            push_debounce: Duration::from_millis(1500),
        }
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: u32) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the pull batch size.
    pub fn with_pull_batch_size(mut self, size: u32) -> Self {
        self.pull_batch_size = size;
        self
    }

    /// Sets the periodic pull interval.
    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = interval;
        self
    }

    /// Sets the default push debounce.
    pub fn with_push_debounce(mut self, debounce: Duration) -> Self {
        self.push_debounce = debounce;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
