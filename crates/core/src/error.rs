//! Core error types for rotor operations.
//!
//! Every failure carries enough context (command, exit code, path, lease name)
//! to be diagnosed offline from the shared log.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for rotor operations.
#[derive(Debug, Error)]
pub enum Error {
    // Lease errors
    #[error("lease '{lease}' is held by live process {owner_pid}")]
    LockContention { lease: String, owner_pid: u32 },

    #[error("lease '{lease}' points at dead process {pid}")]
    LeaseStale { lease: String, pid: u32 },

    #[error("lease file '{path}' has corrupt content {content:?}")]
    LeaseCorrupt { path: PathBuf, content: String },

    // Pipeline errors
    #[error("step '{step}' failed running '{command}' (exit code {exit_code:?}): {reason}")]
    StepFailure {
        step: String,
        command: String,
        exit_code: Option<i32>,
        reason: String,
    },

    #[error("pipeline run {run_id} aborted, superseded by {superseded_by}")]
    Aborted {
        run_id: String,
        superseded_by: String,
    },

    // Supervision errors
    #[error("process {pid} survived termination: {reason}")]
    SupervisionFailure {
        pid: u32,
        reason: String,
        mandatory: bool,
    },

    #[error("child cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // Control plane errors
    #[error("control plane at {url} is unreachable: {reason}")]
    ControlPlaneUnreachable { url: String, reason: String },

    #[error("address {addr} still in use after {attempts} bind attempts")]
    PortInUse { addr: String, attempts: u32 },

    #[error("control plane request to {url} failed with status {status}: {reason}")]
    ControlPlaneRejected {
        url: String,
        status: u16,
        reason: String,
    },

    // Command errors
    #[error("command not found: {cmd}")]
    CommandNotFound { cmd: String },

    #[error("command failed with exit code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    // Configuration errors
    #[error("invalid configuration for '{key}': {reason}")]
    InvalidConfig { key: String, reason: String },

    // I/O errors
    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    #[error("failed to write file '{path}': {reason}")]
    FileWriteFailed { path: PathBuf, reason: String },

    #[error("failed to create directory '{path}': {reason}")]
    DirectoryCreationFailed { path: PathBuf, reason: String },

    #[error("directory does not exist: {path}")]
    DirectoryNotFound { path: PathBuf },

    // Parsing errors
    #[error("JSON parse error: {reason}")]
    JsonParseFailed { reason: String },

    #[error("TOML parse error: {reason}")]
    TomlParseFailed { reason: String },

    #[error("malformed log line: {line:?}")]
    MalformedLogLine { line: String },

    // Generic I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a lock contention error.
    pub fn lock_contention(lease: impl Into<String>, owner_pid: u32) -> Self {
        Self::LockContention {
            lease: lease.into(),
            owner_pid,
        }
    }

    /// Create a stale lease error for a dead recorded owner.
    pub fn lease_stale(lease: impl Into<String>, pid: u32) -> Self {
        Self::LeaseStale {
            lease: lease.into(),
            pid,
        }
    }

    /// Create a corrupt lease error.
    pub fn lease_corrupt(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self::LeaseCorrupt {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Create a pipeline step failure.
    pub fn step_failed(
        step: impl Into<String>,
        command: impl Into<String>,
        exit_code: Option<i32>,
        reason: impl Into<String>,
    ) -> Self {
        Self::StepFailure {
            step: step.into(),
            command: command.into(),
            exit_code,
            reason: reason.into(),
        }
    }

    /// Create an aborted-run error.
    pub fn aborted(run_id: impl Into<String>, superseded_by: impl Into<String>) -> Self {
        Self::Aborted {
            run_id: run_id.into(),
            superseded_by: superseded_by.into(),
        }
    }

    /// Create a supervision failure. `mandatory` marks a stop that blocks a swap.
    pub fn supervision_failed(pid: u32, reason: impl Into<String>, mandatory: bool) -> Self {
        Self::SupervisionFailure {
            pid,
            reason: reason.into(),
            mandatory,
        }
    }

    /// Create a control-plane-unreachable error.
    pub fn unreachable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ControlPlaneUnreachable {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a command failure.
    pub fn command_failed(code: i32, stderr: impl Into<String>) -> Self {
        Self::CommandFailed {
            code,
            stderr: stderr.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a file write error.
    pub fn file_write_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileWriteFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a directory creation error.
    pub fn directory_creation_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DirectoryCreationFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a JSON parse error.
    pub fn json_parse_failed(reason: impl Into<String>) -> Self {
        Self::JsonParseFailed {
            reason: reason.into(),
        }
    }

    /// Fatal errors end the whole run; everything else is recoverable by a retry
    /// or a later run.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SupervisionFailure {
                mandatory: true,
                ..
            } | Self::LeaseCorrupt { .. }
        )
    }

    /// Stable machine-readable kind, used in control-plane error payloads.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::LockContention { .. } => "lock_contention",
            Self::LeaseStale { .. } => "lease_stale",
            Self::LeaseCorrupt { .. } => "lease_corrupt",
            Self::StepFailure { .. } => "step_failure",
            Self::Aborted { .. } => "aborted",
            Self::SupervisionFailure { .. } => "supervision_failure",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ControlPlaneUnreachable { .. } => "control_plane_unreachable",
            Self::PortInUse { .. } => "port_in_use",
            Self::ControlPlaneRejected { .. } => "control_plane_rejected",
            Self::CommandNotFound { .. } => "command_not_found",
            Self::CommandFailed { .. } => "command_failed",
            Self::Timeout { .. } => "timeout",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::FileReadFailed { .. }
            | Self::FileWriteFailed { .. }
            | Self::DirectoryCreationFailed { .. }
            | Self::DirectoryNotFound { .. }
            | Self::Io(_) => "io",
            Self::JsonParseFailed { .. }
            | Self::TomlParseFailed { .. }
            | Self::MalformedLogLine { .. } => "parse",
        }
    }
}
