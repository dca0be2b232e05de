//! Per-child lifecycle state machine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use rotor_core::{Error, Result};

/// Lifecycle of one supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildState {
    Idle,
    Starting,
    Running,
    Stopping,
    Exited,
}

impl ChildState {
    /// Whether `self -> next` is a legal move.
    #[must_use]
    pub const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle | Self::Exited, Self::Starting)
                | (Self::Starting, Self::Running | Self::Exited)
                | (Self::Running, Self::Stopping | Self::Exited)
                | (Self::Stopping, Self::Exited)
        )
    }

    /// A process may exist in this state.
    #[must_use]
    pub const fn has_process(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Exited => "exited",
        }
    }
}

impl fmt::Display for ChildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the supervised child, for status replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildSnapshot {
    pub pid: Option<u32>,
    pub slot: Option<PathBuf>,
    pub state: ChildState,
    pub uptime_secs: Option<u64>,
    pub restarts: u32,
    pub last_exit_code: Option<i32>,
}

/// The supervised child as its owner sees it.
#[derive(Debug, Clone)]
pub struct SupervisedChild {
    pid: Option<u32>,
    slot: Option<PathBuf>,
    state: ChildState,
    started_at: Option<Instant>,
    restarts: u32,
    last_exit_code: Option<i32>,
}

impl Default for SupervisedChild {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisedChild {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pid: None,
            slot: None,
            state: ChildState::Idle,
            started_at: None,
            restarts: 0,
            last_exit_code: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ChildState {
        self.state
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn slot(&self) -> Option<&Path> {
        self.slot.as_deref()
    }

    /// Time since the child reached `Running`.
    #[must_use]
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|at| at.elapsed())
    }

    fn transition(&mut self, next: ChildState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// `Idle|Exited -> Starting` for `slot`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` while a process still exists.
    pub fn begin_start(&mut self, slot: &Path) -> Result<()> {
        self.transition(ChildState::Starting)?;
        self.slot = Some(slot.to_path_buf());
        self.pid = None;
        self.started_at = None;
        Ok(())
    }

    /// `Starting -> Running` with the spawned pid.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the child is starting.
    pub fn started(&mut self, pid: u32) -> Result<()> {
        self.transition(ChildState::Running)?;
        self.pid = Some(pid);
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// `Running -> Stopping`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the child is running.
    pub fn begin_stop(&mut self) -> Result<()> {
        self.transition(ChildState::Stopping)
    }

    /// `Starting|Running|Stopping -> Exited`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when there is no process.
    pub fn exited(&mut self, code: Option<i32>) -> Result<()> {
        self.transition(ChildState::Exited)?;
        self.last_exit_code = code;
        Ok(())
    }

    pub fn count_restart(&mut self) {
        self.restarts = self.restarts.saturating_add(1);
    }

    #[must_use]
    pub fn snapshot(&self) -> ChildSnapshot {
        ChildSnapshot {
            pid: self.pid.filter(|_| self.state.has_process()),
            slot: self.slot.clone(),
            state: self.state,
            uptime_secs: self
                .uptime()
                .filter(|_| self.state == ChildState::Running)
                .map(|d| d.as_secs()),
            restarts: self.restarts,
            last_exit_code: self.last_exit_code,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const ALL: [ChildState; 5] = [
        ChildState::Idle,
        ChildState::Starting,
        ChildState::Running,
        ChildState::Stopping,
        ChildState::Exited,
    ];

    #[test]
    fn test_exactly_the_documented_transitions_are_legal() {
        let legal: Vec<(ChildState, ChildState)> = ALL
            .iter()
            .flat_map(|&from| ALL.iter().map(move |&to| (from, to)))
            .filter(|&(from, to)| from.can_become(to))
            .collect();

        assert_eq!(
            legal,
            vec![
                (ChildState::Idle, ChildState::Starting),
                (ChildState::Starting, ChildState::Running),
                (ChildState::Starting, ChildState::Exited),
                (ChildState::Running, ChildState::Stopping),
                (ChildState::Running, ChildState::Exited),
                (ChildState::Stopping, ChildState::Exited),
                (ChildState::Exited, ChildState::Starting),
            ]
        );
    }

    #[test]
    fn test_full_lifecycle() {
        let mut child = SupervisedChild::new();
        child.begin_start(Path::new("/srv/current-instance")).unwrap();
        child.started(42).unwrap();
        assert_eq!(child.snapshot().pid, Some(42));

        child.begin_stop().unwrap();
        child.exited(Some(0)).unwrap();

        let snapshot = child.snapshot();
        assert_eq!(snapshot.state, ChildState::Exited);
        assert_eq!(snapshot.pid, None);
        assert_eq!(snapshot.last_exit_code, Some(0));
    }

    #[test]
    fn test_cannot_start_twice() {
        let mut child = SupervisedChild::new();
        child.begin_start(Path::new("/a")).unwrap();
        child.started(1).unwrap();

        let err = child.begin_start(Path::new("/b")).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(child.slot(), Some(Path::new("/a")));
    }

    #[test]
    fn test_snapshot_serializes_lowercase_state() {
        let json = serde_json::to_value(SupervisedChild::new().snapshot()).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["restarts"], 0);
    }
}
