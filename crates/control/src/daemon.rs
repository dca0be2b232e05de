//! State shared by every handler of one daemon.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tracing::{error, info, warn};

use rotor_core::{DeployConfig, Error, Layout, Result, ResultExt};
use rotor_events::TailReader;
use rotor_lease::{LeaseContent, LeaseStore};

use crate::protocol::Role;

/// Log lines included in a status report.
pub const STATUS_TAIL_LINES: usize = 20;

/// One daemon's identity and lifecycle flags.
#[derive(Debug)]
pub struct DaemonContext {
    pub role: Role,
    pub pid: u32,
    pub config: DeployConfig,
    pub layout: Layout,
    pub leases: LeaseStore,
    terminating: AtomicBool,
    stopping: AtomicBool,
    shutdown: Notify,
}

impl DaemonContext {
    #[must_use]
    pub fn new(role: Role, config: DeployConfig) -> Self {
        let layout = Layout::from_config(&config);
        Self {
            role,
            pid: std::process::id(),
            leases: LeaseStore::new(layout.root()),
            layout,
            config,
            terminating: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Mark the daemon as going away. Only the first caller gets `true`.
    pub fn begin_terminate(&self) -> bool {
        !self.terminating.swap(true, Ordering::SeqCst)
    }

    /// Let the server loop finish.
    pub fn exit(&self) {
        self.terminating.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Resolves once [`DaemonContext::exit`] was called.
    pub async fn shutdown_signal(&self) {
        self.shutdown.notified().await;
        info!(role = %self.role, pid = self.pid, "daemon shutting down");
    }

    /// Claim the stop flag for the duration of a stop. `None` while another
    /// stop is in flight.
    #[must_use]
    pub fn begin_stop(&self) -> Option<StopGuard<'_>> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(StopGuard { flag: &self.stopping })
        }
    }

    /// Re-read our own lease before a mutating action. Losing it means a
    /// newer daemon took over, so this one exits.
    ///
    /// # Errors
    ///
    /// Returns `LockContention` naming the new owner, or `LeaseCorrupt`.
    pub fn ensure_owner(&self) -> Result<()> {
        let lease = self.role.lease();
        match self.leases.is_owner(lease, self.pid) {
            Ok(true) => Ok(()),
            Ok(false) => {
                let owner = self.leases.read(lease).or_default_logged(None).unwrap_or(0);
                warn!(lease = %lease, pid = self.pid, owner, "lease taken over, exiting");
                self.exit();
                Err(Error::lock_contention(lease.as_str(), owner))
            }
            Err(e) => {
                error!(lease = %lease, error = %e, "lease integrity violated, exiting");
                self.exit();
                Err(e)
            }
        }
    }

    /// Drop our lease if it is still ours.
    pub fn release_lease(&self) {
        self.leases
            .remove_if(self.role.lease(), &LeaseContent::Owned(self.pid))
            .map(drop)
            .log_best_effort("release daemon lease");
    }

    /// Last lines of the shared log, for status reports.
    #[must_use]
    pub fn log_tail(&self) -> Vec<String> {
        TailReader::new(self.layout.log_file(), self.config.log_tail_bytes)
            .last_records(STATUS_TAIL_LINES)
            .or_default_logged(Vec::new())
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

/// Clears the stop flag when the stop finishes.
#[derive(Debug)]
pub struct StopGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
