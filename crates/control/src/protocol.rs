//! Wire types of the control plane.
//!
//! Every response body is a [`ControlResponse`], tagged by `"type"`.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use rotor_lease::LeaseName;
use rotor_pipeline::{PipelineRun, RunId, RunReport};
use rotor_supervisor::ChildSnapshot;

/// Which long-running daemon is answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Supervises the application instance.
    Manager,
    /// Runs pipelines.
    Processor,
}

impl Role {
    #[must_use]
    pub const fn lease(self) -> LeaseName {
        match self {
            Self::Manager => LeaseName::Manager,
            Self::Processor => LeaseName::Processor,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Processor => "processor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `GET /status` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub role: Role,
    pub pid: u32,
    pub alive: bool,
    pub terminating: bool,
    pub current_slot: PathBuf,
    #[serde(default)]
    pub supervised: Option<ChildSnapshot>,
    #[serde(default)]
    pub active_run: Option<PipelineRun>,
    #[serde(default)]
    pub last_run: Option<RunReport>,
    #[serde(default)]
    pub log_tail: Vec<String>,
}

/// `POST /restart` body. Without a path, `current` is restarted as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartRequest {
    #[serde(default)]
    pub upcoming_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlResponse {
    Status(StatusReport),
    #[serde(rename_all = "camelCase")]
    Ack {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<RunId>,
    },
    Error {
        kind: String,
        message: String,
    },
}

impl ControlResponse {
    pub fn ack(message: impl Into<String>) -> Self {
        Self::Ack {
            message: message.into(),
            pid: None,
            run_id: None,
        }
    }

    #[must_use]
    pub fn with_pid(self, pid: u32) -> Self {
        match self {
            Self::Ack { message, run_id, .. } => Self::Ack {
                message,
                pid: Some(pid),
                run_id,
            },
            other => other,
        }
    }

    #[must_use]
    pub fn with_run_id(self, run_id: RunId) -> Self {
        match self {
            Self::Ack { message, pid, .. } => Self::Ack {
                message,
                pid,
                run_id: Some(run_id),
            },
            other => other,
        }
    }

    #[must_use]
    pub fn error(error: &rotor_core::Error) -> Self {
        Self::Error {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}
