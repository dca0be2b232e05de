//! Process liveness probing.
//!
//! A single probe sends the null signal: it checks that a pid exists without
//! touching the process. Probes are repeated and decided by majority vote so a
//! process-table flicker during the window does not flip the answer.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

/// Number of probes in one liveness check.
pub const PROBE_ATTEMPTS: u32 = 8;

/// A single non-destructive existence check.
pub trait Prober: Send + Sync {
    fn probe(&self, pid: u32) -> bool;
}

/// Probes real OS processes with `kill(pid, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProber;

impl Prober for OsProber {
    fn probe(&self, pid: u32) -> bool {
        probe_pid(pid)
    }
}

#[cfg(unix)]
fn probe_pid(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // pid 0 and negative values address process groups, never a single process
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn probe_pid(_pid: u32) -> bool {
    false
}

/// How long to wait between probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Urgency {
    /// Swap path: the caller is blocking a restart.
    Urgent,
    /// Lease checks and status requests.
    #[default]
    Normal,
    /// Background reclaim of stale leases.
    Relaxed,
}

impl Urgency {
    #[must_use]
    pub const fn interval(self) -> Duration {
        match self {
            Self::Urgent => Duration::from_millis(50),
            Self::Normal => Duration::from_millis(200),
            Self::Relaxed => Duration::from_millis(500),
        }
    }
}

/// Majority-vote liveness checker.
#[derive(Clone)]
pub struct Liveness {
    prober: Arc<dyn Prober>,
    attempts: u32,
    interval: Duration,
}

impl std::fmt::Debug for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Liveness")
            .field("attempts", &self.attempts)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::os(Urgency::Normal)
    }
}

impl Liveness {
    /// Checker backed by the OS process table.
    #[must_use]
    pub fn os(urgency: Urgency) -> Self {
        Self::new(Arc::new(OsProber), urgency)
    }

    /// Checker backed by a custom prober.
    #[must_use]
    pub fn new(prober: Arc<dyn Prober>, urgency: Urgency) -> Self {
        Self {
            prober,
            attempts: PROBE_ATTEMPTS,
            interval: urgency.interval(),
        }
    }

    /// Override the inter-probe delay.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One probe, no voting.
    #[must_use]
    pub fn probe_once(&self, pid: u32) -> bool {
        self.prober.probe(pid)
    }

    /// Probe up to `PROBE_ATTEMPTS` times; alive when yes-votes outnumber no-votes.
    ///
    /// Stops early once the remaining probes can no longer change the outcome.
    pub async fn is_alive(&self, pid: u32) -> bool {
        let mut yes: u32 = 0;
        let mut no: u32 = 0;

        for attempt in 0..self.attempts {
            if self.prober.probe(pid) {
                yes = yes.saturating_add(1);
            } else {
                no = no.saturating_add(1);
            }

            let remaining = self.attempts.saturating_sub(attempt.saturating_add(1));
            if yes > no.saturating_add(remaining) || no >= yes.saturating_add(remaining) {
                break;
            }
            tokio::time::sleep(self.interval).await;
        }

        trace!(pid, yes, no, "liveness vote");
        yes > no
    }
}
