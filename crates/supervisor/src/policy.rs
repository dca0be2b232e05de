//! Restart backoff for the long-lived child.

use std::time::Duration;

/// Backoff chosen from how long the child ran before it died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Exits sooner than this after start count as a crash loop.
    pub crash_window: Duration,
    /// Delay before restarting a crash-looping child.
    pub crash_backoff: Duration,
    /// Delay before restarting a child that ran for a while.
    pub steady_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            crash_window: Duration::from_secs(30),
            crash_backoff: Duration::from_secs(10),
            steady_backoff: Duration::from_secs(1),
        }
    }
}

impl RestartPolicy {
    #[must_use]
    pub fn backoff(&self, uptime: Duration) -> Duration {
        if uptime < self.crash_window {
            self.crash_backoff
        } else {
            self.steady_backoff
        }
    }
}
