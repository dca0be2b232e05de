//! Supervision of the deployed application.
//!
//! One [`Supervisor`] owns at most one live child. Lifecycle operations
//! (spawn, stop, replace, restart) are serialized; exits are reported by a
//! per-child watcher task and turned into restarts by [`Supervisor::run_restart_loop`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use rotor_core::{DeployConfig, Error, Layout, Result, ResultExt, StartConfig};
use rotor_events::LogWriter;
use rotor_lease::{LeaseContent, LeaseName, LeaseStore};

use crate::child::{ChildSnapshot, ChildState, SupervisedChild};
use crate::manifest::StartCommand;
use crate::policy::RestartPolicy;
use crate::process::WorkerProcess;
use crate::signal::TerminateLadder;

/// Source tag for application output in the shared log.
pub const APP_SOURCE: &str = "app";

/// How long to wait for the watcher to reap a child the ladder saw die.
const REAP_WAIT: Duration = Duration::from_secs(5);

/// Everything a supervisor needs to know up front.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub manifest_file: String,
    pub start: StartConfig,
    pub leases: LeaseStore,
    pub app_log: LogWriter,
    pub ladder: TerminateLadder,
    pub policy: RestartPolicy,
}

impl SupervisorSettings {
    #[must_use]
    pub fn from_config(config: &DeployConfig, layout: &Layout) -> Self {
        Self {
            manifest_file: config.manifest_file.clone(),
            start: config.start.clone(),
            leases: LeaseStore::new(layout.root()),
            app_log: LogWriter::new(layout.log_file(), APP_SOURCE, 0),
            ladder: TerminateLadder::default(),
            policy: RestartPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_ladder(mut self, ladder: TerminateLadder) -> Self {
        self.ladder = ladder;
        self
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// An unexpected exit, reported to the restart loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub generation: u64,
    pub pid: u32,
    pub code: Option<i32>,
    pub uptime: Duration,
}

struct Inner {
    child: SupervisedChild,
    generation: u64,
    exited: Option<watch::Receiver<bool>>,
}

struct Shared {
    settings: SupervisorSettings,
    ops: Mutex<()>,
    inner: Mutex<Inner>,
    exits_tx: mpsc::UnboundedSender<ChildExit>,
    exits_rx: Mutex<Option<mpsc::UnboundedReceiver<ChildExit>>>,
}

/// Handle to the supervisor; clones share the same child.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("settings", &self.shared.settings)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    #[must_use]
    pub fn new(settings: SupervisorSettings) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                settings,
                ops: Mutex::new(()),
                inner: Mutex::new(Inner {
                    child: SupervisedChild::new(),
                    generation: 0,
                    exited: None,
                }),
                exits_tx,
                exits_rx: Mutex::new(Some(exits_rx)),
            }),
        }
    }

    pub async fn snapshot(&self) -> ChildSnapshot {
        self.shared.inner.lock().await.child.snapshot()
    }

    /// Start the application in `slot`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if a child is already running, or a
    /// start-command / spawn error.
    pub async fn spawn(&self, slot: &Path) -> Result<u32> {
        let _op = self.shared.ops.lock().await;
        self.spawn_locked(slot).await
    }

    /// Stop the child through the termination ladder.
    ///
    /// A survivor is fatal only when `mandatory`; otherwise it is logged.
    ///
    /// # Errors
    ///
    /// Returns `SupervisionFailure` for a mandatory stop that failed.
    pub async fn stop(&self, mandatory: bool) -> Result<()> {
        let _op = self.shared.ops.lock().await;
        self.stop_locked(mandatory, true).await
    }

    /// Best-effort stop of the child this supervisor started, for a daemon on
    /// its way out. Unlike [`Supervisor::stop`] it never touches a recorded
    /// instance it did not spawn, which may already belong to a successor.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` or an I/O error; a survivor is only logged.
    pub async fn release(&self) -> Result<()> {
        let _op = self.shared.ops.lock().await;
        self.stop_locked(false, false).await
    }

    /// Stop the current child (confirmed dead) and start `slot`.
    ///
    /// # Errors
    ///
    /// Returns `SupervisionFailure` if the old child survives, or any error
    /// starting the new one.
    pub async fn replace(&self, slot: &Path) -> Result<u32> {
        let _op = self.shared.ops.lock().await;
        self.stop_locked(true, true).await?;
        self.spawn_locked(slot).await
    }

    /// Restart unexpectedly exited children after the policy's backoff.
    /// Runs until the supervisor is dropped; only the first caller gets the
    /// exit stream.
    pub async fn run_restart_loop(&self) {
        let Some(mut exits) = self.shared.exits_rx.lock().await.take() else {
            warn!("restart loop already running");
            return;
        };

        while let Some(exit) = exits.recv().await {
            let delay = self.shared.settings.policy.backoff(exit.uptime);
            info!(
                pid = exit.pid,
                code = ?exit.code,
                uptime_secs = exit.uptime.as_secs(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "restarting application after backoff"
            );
            tokio::time::sleep(delay).await;

            let _op = self.shared.ops.lock().await;
            let slot = {
                let mut inner = self.shared.inner.lock().await;
                if inner.generation != exit.generation || inner.child.state() != ChildState::Exited {
                    debug!(pid = exit.pid, "restart superseded");
                    continue;
                }
                inner.child.count_restart();
                inner.child.slot().map(Path::to_path_buf)
            };
            let Some(slot) = slot else {
                continue;
            };
            if let Err(e) = self.spawn_locked(&slot).await {
                error!(error = %e, slot = %slot.display(), "restart failed");
            }
        }
    }

    async fn spawn_locked(&self, slot: &Path) -> Result<u32> {
        let settings = &self.shared.settings;
        let command = StartCommand::resolve(slot, &settings.manifest_file, &settings.start)?;
        self.clear_orphan(true).await?;

        let generation = {
            let mut inner = self.shared.inner.lock().await;
            inner.child.begin_start(slot)?;
            inner.generation = inner.generation.wrapping_add(1);
            inner.generation
        };

        let config = command
            .process_config(slot)
            .log_to(settings.app_log.clone());
        let process = match WorkerProcess::spawn(config) {
            Ok(process) => process,
            Err(e) => {
                error!(command = %command, slot = %slot.display(), error = %e, "application failed to start");
                let mut inner = self.shared.inner.lock().await;
                inner.child.exited(None).log_best_effort("record failed start");
                return Err(e);
            }
        };

        let pid = process.id();
        let (exited_tx, exited_rx) = watch::channel(false);
        {
            let mut inner = self.shared.inner.lock().await;
            inner.child.started(pid)?;
            inner.exited = Some(exited_rx);
        }
        settings
            .leases
            .record(LeaseName::Instance, pid)
            .log_best_effort("record instance pid");
        info!(pid, slot = %slot.display(), command = %command, "application started");

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let code = process.wait().await.or_default_logged(None);
            shared.on_exit(generation, pid, code).await;
            exited_tx.send_replace(true);
        });

        Ok(pid)
    }

    async fn stop_locked(&self, mandatory: bool, orphans: bool) -> Result<()> {
        let target = {
            let mut inner = self.shared.inner.lock().await;
            match (inner.child.state(), inner.child.pid()) {
                (ChildState::Running, Some(pid)) => {
                    inner.child.begin_stop()?;
                    Some((pid, inner.exited.clone()))
                }
                // an earlier stop left a survivor behind
                (ChildState::Stopping, Some(pid)) => Some((pid, inner.exited.clone())),
                _ => None,
            }
        };

        let Some((pid, exited)) = target else {
            if !orphans {
                return Ok(());
            }
            return settle(self.clear_orphan(mandatory).await, mandatory);
        };

        info!(pid, mandatory, "stopping application");
        let outcome = self.shared.settings.ladder.terminate(pid, mandatory).await;
        if let Ok(termination) = outcome {
            debug!(pid, ?termination, "application terminated");
            if let Some(mut exited) = exited {
                let reaped = tokio::time::timeout(REAP_WAIT, exited.wait_for(|done| *done))
                    .await
                    .is_ok_and(|seen| seen.is_ok());
                if !reaped {
                    warn!(pid, "exit not observed after termination");
                }
            }
        }
        settle(outcome.map(drop), mandatory)
    }

    /// Terminate a live child recorded in `instance.pid` that this
    /// supervisor did not start, e.g. one left by a crashed Manager.
    async fn clear_orphan(&self, mandatory: bool) -> Result<()> {
        let leases = &self.shared.settings.leases;
        let Some(pid) = leases.read(LeaseName::Instance)? else {
            return Ok(());
        };
        let own = self.shared.inner.lock().await.child.snapshot().pid;
        if own == Some(pid) {
            return Ok(());
        }

        if leases.liveness().is_alive(pid).await {
            warn!(pid, "terminating application left by a previous supervisor");
            self.shared.settings.ladder.terminate(pid, mandatory).await?;
        }
        leases.remove_if(LeaseName::Instance, &LeaseContent::Owned(pid))?;
        Ok(())
    }
}

impl Shared {
    async fn on_exit(&self, generation: u64, pid: u32, code: Option<i32>) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        let was_stopping = inner.child.state() == ChildState::Stopping;
        let uptime = inner.child.uptime().unwrap_or_default();
        inner.child.exited(code).log_best_effort("record child exit");
        drop(inner);

        self.settings
            .leases
            .remove_if(LeaseName::Instance, &LeaseContent::Owned(pid))
            .map(drop)
            .log_best_effort("clear instance pid");

        if was_stopping {
            info!(pid, ?code, "application stopped");
            return;
        }

        warn!(pid, ?code, uptime_secs = uptime.as_secs(), "application exited unexpectedly");
        let exit = ChildExit {
            generation,
            pid,
            code,
            uptime,
        };
        if self.exits_tx.send(exit).is_err() {
            debug!(pid, "no restart loop listening");
        }
    }
}

/// A failed stop only propagates when it was mandatory.
fn settle(outcome: Result<()>, mandatory: bool) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(e) if mandatory || !matches!(e, Error::SupervisionFailure { .. }) => Err(e),
        Err(e) => {
            warn!(error = %e, "best-effort stop left the process running");
            Ok(())
        }
    }
}

