//! Version-control capability: materialize a reference into a directory and
//! describe its last commit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use rotor_core::{Error, Result};
use rotor_events::LogWriter;
use rotor_supervisor::{ProcessConfig, ProcessResult, spawn_and_wait};

/// Metadata of the commit a run deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub date: DateTime<Utc>,
    pub message: String,
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Write the tree of `reference` into `target` (which exists and is empty).
    async fn checkout(&self, repository: &Path, reference: &str, target: &Path) -> Result<()>;

    /// Fallback when [`VersionControl::checkout`] left `target` empty.
    async fn clone_full(&self, repository: &Path, reference: &str, target: &Path) -> Result<()>;

    async fn last_commit(&self, repository: &Path, reference: &str) -> Result<CommitInfo>;
}

/// `git` on the `PATH`.
#[derive(Debug, Clone)]
pub struct GitCli {
    timeout: Duration,
    log: Option<LogWriter>,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            log: None,
        }
    }
}

impl GitCli {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, log: None }
    }

    /// Mirror git's output into the shared log.
    #[must_use]
    pub fn log_to(mut self, writer: LogWriter) -> Self {
        self.log = Some(writer);
        self
    }

    async fn git(&self, config: ProcessConfig) -> Result<ProcessResult> {
        let mut config = config.timeout(self.timeout);
        if let Some(log) = &self.log {
            config = config.log_to(log.clone());
        }
        debug!(command = %config.display(), "running git");
        let result = spawn_and_wait(config).await?;
        result.check_success()?;
        Ok(result)
    }
}

/// A work-tree repository keeps its objects in `.git`; a bare one is the
/// directory itself.
fn git_dir(repository: &Path) -> PathBuf {
    let dotgit = repository.join(".git");
    if dotgit.exists() { dotgit } else { repository.to_path_buf() }
}

fn arg(prefix: &str, path: &Path) -> String {
    format!("{prefix}{}", path.display())
}

#[async_trait]
impl VersionControl for GitCli {
    async fn checkout(&self, repository: &Path, reference: &str, target: &Path) -> Result<()> {
        // A private index keeps the source repository's own index untouched.
        let index = target.with_extension("git-index");
        let outcome = self
            .git(
                ProcessConfig::new("git")
                    .arg(arg("--git-dir=", &git_dir(repository)))
                    .arg(arg("--work-tree=", target))
                    .args(["checkout", "-f", reference, "--", "."])
                    .env("GIT_INDEX_FILE", index.to_string_lossy()),
            )
            .await;
        if index.exists() {
            std::fs::remove_file(&index).map_err(|e| Error::file_write_failed(&index, e.to_string()))?;
        }
        outcome.map(drop)
    }

    async fn clone_full(&self, repository: &Path, reference: &str, target: &Path) -> Result<()> {
        self.git(
            ProcessConfig::new("git")
                .arg("clone")
                .arg(repository.to_string_lossy())
                .arg(target.to_string_lossy()),
        )
        .await?;
        self.git(
            ProcessConfig::new("git")
                .arg("-C")
                .arg(target.to_string_lossy())
                .args(["checkout", "-f", reference]),
        )
        .await
        .map(drop)
    }

    async fn last_commit(&self, repository: &Path, reference: &str) -> Result<CommitInfo> {
        let result = self
            .git(
                ProcessConfig::new("git")
                    .arg(arg("--git-dir=", &git_dir(repository)))
                    .args(["log", "-1", "--format=%H%n%cI%n%s", reference]),
            )
            .await?;
        parse_commit(&result.stdout)
    }
}

/// Parse `%H%n%cI%n%s` output.
fn parse_commit(lines: &[String]) -> Result<CommitInfo> {
    let unexpected = || Error::command_failed(-1, format!("unexpected git log output: {lines:?}"));
    let [hash, date, message, ..] = lines else {
        return Err(unexpected());
    };
    let date = DateTime::parse_from_rfc3339(date.trim())
        .map_err(|_| unexpected())?
        .with_timezone(&Utc);
    Ok(CommitInfo {
        hash: hash.trim().to_string(),
        date,
        message: message.clone(),
    })
}
