//! The termination ladder.
//!
//! A process is asked to stop politely first and forced last: interrupt,
//! terminate, kill its process group, then kill it directly. After each stage
//! the ladder waits for the process to go away and confirms with a
//! majority-vote liveness check before deciding whether to escalate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use rotor_core::{Error, Result};
use rotor_lease::{Liveness, Urgency};

/// Default wait after each stage before re-probing.
pub const STAGE_WAIT: Duration = Duration::from_secs(2);

const SETTLE_POLL: Duration = Duration::from_millis(100);

/// One rung of the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Interrupt,
    Terminate,
    KillGroup,
    ForceKill,
}

impl Stage {
    /// Stages in escalation order.
    pub const LADDER: [Self; 4] = [Self::Interrupt, Self::Terminate, Self::KillGroup, Self::ForceKill];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Terminate => "terminate",
            Self::KillGroup => "kill-group",
            Self::ForceKill => "force-kill",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivers a stage's signal.
pub trait Signaller: Send + Sync {
    /// Send the signal for `stage`. A target that no longer exists is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the signal cannot be delivered.
    fn send(&self, pid: u32, stage: Stage) -> Result<()>;
}

/// Real signals through `kill(2)` / `killpg(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSignaller;

impl Signaller for OsSignaller {
    fn send(&self, pid: u32, stage: Stage) -> Result<()> {
        send_signal(pid, stage)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, stage: Stage) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill, killpg};

    let target = unix_pid(pid)?;
    let sent = match stage {
        Stage::Interrupt => kill(target, Signal::SIGINT),
        Stage::Terminate => kill(target, Signal::SIGTERM),
        Stage::KillGroup => killpg(target, Signal::SIGKILL),
        Stage::ForceKill => kill(target, Signal::SIGKILL),
    };
    match sent {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(Error::Io(std::io::Error::from(errno))),
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _stage: Stage) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn unix_pid(pid: u32) -> Result<nix::unistd::Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(nix::unistd::Pid::from_raw(raw)),
        _ => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        ))),
    }
}

/// SIGKILL the process group led by `pid`.
///
/// # Errors
///
/// Returns an I/O error if the group exists but cannot be signalled.
pub fn kill_group(pid: u32) -> Result<()> {
    send_signal(pid, Stage::KillGroup)
}

/// How a termination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process was already gone before the first stage.
    AlreadyExited,
    /// The process went away after this stage.
    Stopped(Stage),
}

/// Escalating terminator.
#[derive(Clone)]
pub struct TerminateLadder {
    signaller: Arc<dyn Signaller>,
    liveness: Liveness,
    stage_wait: Duration,
}

impl fmt::Debug for TerminateLadder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminateLadder")
            .field("liveness", &self.liveness)
            .field("stage_wait", &self.stage_wait)
            .finish_non_exhaustive()
    }
}

impl Default for TerminateLadder {
    fn default() -> Self {
        Self::new(Arc::new(OsSignaller), Liveness::os(Urgency::Urgent))
    }
}

impl TerminateLadder {
    #[must_use]
    pub fn new(signaller: Arc<dyn Signaller>, liveness: Liveness) -> Self {
        Self {
            signaller,
            liveness,
            stage_wait: STAGE_WAIT,
        }
    }

    #[must_use]
    pub const fn with_stage_wait(mut self, stage_wait: Duration) -> Self {
        self.stage_wait = stage_wait;
        self
    }

    #[must_use]
    pub const fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Walk the ladder until `pid` is confirmed dead.
    ///
    /// `mandatory` marks a stop that blocks a swap; it only changes how the
    /// caller treats the failure.
    ///
    /// # Errors
    ///
    /// Returns `SupervisionFailure` if the process survives every stage.
    pub async fn terminate(&self, pid: u32, mandatory: bool) -> Result<Termination> {
        if !self.liveness.is_alive(pid).await {
            debug!(pid, "process already gone");
            return Ok(Termination::AlreadyExited);
        }

        for stage in Stage::LADDER {
            if let Err(e) = self.signaller.send(pid, stage) {
                warn!(pid, %stage, error = %e, "signal delivery failed, escalating");
            }
            self.settle(pid).await;
            if !self.liveness.is_alive(pid).await {
                info!(pid, %stage, "process stopped");
                return Ok(Termination::Stopped(stage));
            }
            debug!(pid, %stage, "process survived stage");
        }

        Err(Error::supervision_failed(
            pid,
            "survived interrupt, terminate, group kill and forced kill",
            mandatory,
        ))
    }

    /// Wait up to the stage bound, returning early once a single probe misses.
    async fn settle(&self, pid: u32) {
        let deadline = Instant::now() + self.stage_wait;
        while self.liveness.probe_once(pid) && Instant::now() < deadline {
            sleep(SETTLE_POLL.min(self.stage_wait)).await;
        }
    }
}
