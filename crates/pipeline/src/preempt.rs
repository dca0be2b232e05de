//! Cooperative preemption between pipeline runs.
//!
//! A new trigger never kills the run in flight. It publishes itself as the
//! latest run; the running one notices at its next checkpoint and aborts,
//! and the newcomer waits (bounded) for the active slot to free up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use rotor_core::{Error, Result};

use crate::run::RunId;

/// Reason recorded when a run is stopped without a successor.
pub const STOP_REQUEST: &str = "stop request";

/// Latest requested run and the run currently holding the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreemptionState {
    pub latest: Option<RunId>,
    pub active: Option<RunId>,
}

/// Shared handle; clones observe the same state.
#[derive(Debug, Clone)]
pub struct Preemption {
    state: Arc<watch::Sender<PreemptionState>>,
}

impl Default for Preemption {
    fn default() -> Self {
        Self::new()
    }
}

impl Preemption {
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(PreemptionState::default());
        Self {
            state: Arc::new(state),
        }
    }

    #[must_use]
    pub fn state(&self) -> PreemptionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn active(&self) -> Option<RunId> {
        self.state.borrow().active
    }

    /// Publish `id` as the run everyone else should yield to.
    pub fn supersede(&self, id: RunId) {
        self.state.send_modify(|state| {
            if let Some(previous) = state.latest.replace(id) {
                debug!(run_id = %id, superseded = %previous, "newer run requested");
            }
        });
    }

    /// Step-boundary check.
    ///
    /// # Errors
    ///
    /// Returns `Aborted` once `id` is no longer the latest requested run.
    pub fn checkpoint(&self, id: RunId) -> Result<()> {
        match self.state.borrow().latest {
            Some(latest) if latest == id => Ok(()),
            other => Err(aborted(id, other)),
        }
    }

    /// Wait until no run is active.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when the active run does not yield in time.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|state| state.active.is_none()))
            .await
            .map_err(|_| Error::timeout("waiting for the active pipeline run", timeout.as_secs()))?
            .map(drop)
            .map_err(|_| Error::timeout("waiting for the active pipeline run", timeout.as_secs()))
    }

    /// Become the active run once the previous one has yielded.
    ///
    /// # Errors
    ///
    /// Returns `Aborted` if a newer run arrives while waiting, or `Timeout`
    /// if the active run does not reach a checkpoint in time.
    pub async fn claim(&self, id: RunId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut rx = self.state.subscribe();

        loop {
            rx.borrow_and_update();
            let mut outcome = None;
            self.state.send_if_modified(|state| {
                if state.latest != Some(id) {
                    outcome = Some(Err(aborted(id, state.latest)));
                    false
                } else if state.active.is_none() {
                    state.active = Some(id);
                    outcome = Some(Ok(()));
                    true
                } else {
                    false
                }
            });
            if let Some(outcome) = outcome {
                return outcome;
            }

            let waited = tokio::time::timeout_at(deadline, rx.changed()).await;
            if !matches!(waited, Ok(Ok(()))) {
                return Err(Error::timeout(
                    format!("run {id} waiting for the active pipeline run"),
                    timeout.as_secs(),
                ));
            }
        }
    }

    /// Release the active slot if `id` holds it.
    pub fn finish(&self, id: RunId) {
        self.state.send_if_modified(|state| {
            if state.active == Some(id) {
                state.active = None;
                true
            } else {
                false
            }
        });
    }

    /// Make every pending and active run abort at its next checkpoint.
    /// Returns the run that was active.
    pub fn stop(&self) -> Option<RunId> {
        let mut active = None;
        self.state.send_modify(|state| {
            state.latest = None;
            active = state.active;
        });
        if let Some(id) = active {
            info!(run_id = %id, "stop requested for active run");
        }
        active
    }
}

fn aborted(id: RunId, latest: Option<RunId>) -> Error {
    Error::aborted(
        id.to_string(),
        latest.map_or_else(|| STOP_REQUEST.to_string(), |l| l.to_string()),
    )
}
