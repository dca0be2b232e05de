//! Pipeline run identity, states and progress markers.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use rotor_core::{Error, Result};

use crate::vcs::CommitInfo;

/// Default reference when a trigger names none.
pub const DEFAULT_REFERENCE: &str = "HEAD";

/// Sortable run identifier (ULID, millisecond UTC timestamp prefix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// When the id was minted.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.0.datetime())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::invalid_config("id", format!("{s:?} is not a run id: {e}")))
    }
}

/// Run lifecycle. Steps execute strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Queued,
    Purging,
    CheckingOut,
    CopyingCarryOver,
    Installing,
    Building,
    Swapping,
    Done,
    Aborted,
    Failed,
}

impl RunState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted | Self::Failed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Purging => "Purging",
            Self::CheckingOut => "CheckingOut",
            Self::CopyingCarryOver => "CopyingCarryOver",
            Self::Installing => "Installing",
            Self::Building => "Building",
            Self::Swapping => "Swapping",
            Self::Done => "Done",
            Self::Aborted => "Aborted",
            Self::Failed => "Failed",
        }
    }

    /// Short step name used in error context and as the log source tag.
    #[must_use]
    pub const fn step_name(self) -> &'static str {
        match self {
            Self::Queued => "queue",
            Self::Purging => "purge",
            Self::CheckingOut => "checkout",
            Self::CopyingCarryOver => "carry-over",
            Self::Installing => "install",
            Self::Building => "build",
            Self::Swapping => "swap",
            Self::Done => "done",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        [
            Self::Queued,
            Self::Purging,
            Self::CheckingOut,
            Self::CopyingCarryOver,
            Self::Installing,
            Self::Building,
            Self::Swapping,
            Self::Done,
            Self::Aborted,
            Self::Failed,
        ]
        .into_iter()
        .find(|state| state.as_str() == s)
        .ok_or_else(|| Error::invalid_config("state", format!("unknown run state {s:?}")))
    }
}

/// A trigger: what to deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub id: Option<RunId>,
    pub repository_path: PathBuf,
    #[serde(default)]
    pub reference: Option<String>,
}

impl RunRequest {
    #[must_use]
    pub fn new(repository_path: impl Into<PathBuf>) -> Self {
        Self {
            id: None,
            repository_path: repository_path.into(),
            reference: None,
        }
    }

    #[must_use]
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    #[must_use]
    pub fn reference(&self) -> &str {
        self.reference
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(DEFAULT_REFERENCE)
    }
}

/// One run as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub id: RunId,
    pub repository_path: PathBuf,
    pub source_ref: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
}

impl PipelineRun {
    #[must_use]
    pub fn queued(id: RunId, request: &RunRequest) -> Self {
        Self {
            id,
            repository_path: request.repository_path.clone(),
            source_ref: request.reference().to_string(),
            state: RunState::Queued,
            started_at: Utc::now(),
        }
    }
}

/// Timing of one executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub state: RunState,
    pub duration_ms: u64,
    pub skipped: bool,
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run: PipelineRun,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
    pub commit: Option<CommitInfo>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
}

impl RunReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.run.state == RunState::Done
    }

    #[must_use]
    pub fn was_skipped(&self, state: RunState) -> bool {
        self.steps.iter().any(|step| step.state == state && step.skipped)
    }
}

/// Progress lines the pipeline writes to the shared log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    State(RunState),
    Finished,
    Failed(String),
    Aborted(String),
}

impl Progress {
    /// Render as a log message for run `id`.
    #[must_use]
    pub fn message(&self, id: &RunId) -> String {
        match self {
            Self::State(state) => format!("pipeline {id} state={state}"),
            Self::Finished => format!("pipeline {id} finished"),
            Self::Failed(reason) => format!("pipeline {id} failed: {reason}"),
            Self::Aborted(reason) => format!("pipeline {id} aborted: {reason}"),
        }
    }

    /// Parse a log message back into the run id and progress.
    #[must_use]
    pub fn parse(message: &str) -> Option<(RunId, Self)> {
        let rest = message.strip_prefix("pipeline ")?;
        let (id, detail) = rest.split_once(' ')?;
        let id = id.parse().ok()?;

        let progress = if detail == "finished" {
            Self::Finished
        } else if let Some(state) = detail.strip_prefix("state=") {
            Self::State(state.split_whitespace().next()?.parse().ok()?)
        } else if let Some(reason) = detail.strip_prefix("failed: ") {
            Self::Failed(reason.to_string())
        } else if let Some(reason) = detail.strip_prefix("aborted: ") {
            Self::Aborted(reason.to_string())
        } else {
            return None;
        };
        Some((id, progress))
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::State(_))
    }
}
