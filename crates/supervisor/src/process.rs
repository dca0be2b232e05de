//! Subprocess spawning, output routing and bounded waits.
//!
//! Every child is started as the leader of its own process group so a timeout
//! or a group kill reaches whatever it spawned. Output lines are optionally
//! collected and optionally appended to the shared log under the child's pid.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use rotor_core::{Error, Result, ResultExt};
use rotor_events::LogWriter;

use crate::signal::kill_group;

/// How long output readers may linger after the child exits; a grandchild
/// that inherited the pipe can otherwise hold it open forever.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Prefix for stderr lines in the shared log.
pub const STDERR_PREFIX: &str = "stderr: ";

/// Configuration for spawning a process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Command to execute
    pub command: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
    /// Environment variables to set
    pub env: Vec<(String, String)>,
    /// Hard bound on the run; the process group is killed when it passes
    pub timeout: Option<Duration>,
    /// Keep output lines in the result
    pub capture: bool,
    /// Append output lines to the shared log
    pub log: Option<LogWriter>,
}

impl ProcessConfig {
    /// Create a new process configuration with defaults.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout: None,
            capture: true,
            log: None,
        }
    }

    /// Run a shell-style command line through `sh -c`.
    pub fn shell(line: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(line)
    }

    /// Add a command argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple command arguments.
    #[must_use]
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set whether to keep output lines.
    #[must_use]
    pub const fn capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    /// Route output lines to the shared log.
    #[must_use]
    pub fn log_to(mut self, writer: LogWriter) -> Self {
        self.log = Some(writer);
        self
    }

    /// The command line as a human would type it, for error context.
    #[must_use]
    pub fn display(&self) -> String {
        match (self.command.as_str(), self.args.as_slice()) {
            ("sh", [flag, line]) if flag == "-c" => line.clone(),
            (command, []) => command.to_string(),
            (command, args) => format!("{command} {}", args.join(" ")),
        }
    }
}

/// Result of process execution.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// Exit code; `None` when the process died from a signal
    pub exit_code: Option<i32>,
    /// Captured stdout (if enabled)
    pub stdout: Vec<String>,
    /// Captured stderr (if enabled)
    pub stderr: Vec<String>,
}

impl ProcessResult {
    /// Check if the process succeeded (exit code 0).
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Convert to Result, checking for success.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` with the captured stderr on a non-zero exit.
    pub fn check_success(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            Err(Error::command_failed(code, self.stderr.join("\n")))
        }
    }
}

/// Handle to a running process.
pub struct WorkerProcess {
    child: Child,
    config: ProcessConfig,
    pid: u32,
    stdout_task: Option<JoinHandle<Vec<String>>>,
    stderr_task: Option<JoinHandle<Vec<String>>>,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.pid)
            .field("command", &self.config.display())
            .finish_non_exhaustive()
    }
}

impl WorkerProcess {
    /// Spawn a new process and start routing its output.
    ///
    /// # Errors
    ///
    /// Returns `CommandNotFound` when the program does not exist, or
    /// `CommandFailed` for any other spawn failure.
    pub fn spawn(config: ProcessConfig) -> Result<Self> {
        let mut command = Command::new(&config.command);
        command.args(&config.args);

        if let Some(ref dir) = config.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::CommandNotFound {
                    cmd: config.command.clone(),
                }
            } else {
                Error::command_failed(-1, format!("failed to spawn '{}': {e}", config.display()))
            }
        })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::command_failed(-1, "process exited before reporting a pid"))?;
        debug!(pid, command = %config.display(), "spawned process");

        let log = config.log.as_ref().map(|writer| writer.with_pid(pid));
        let stdout_task = child.stdout.take().map(|stream| {
            tokio::spawn(forward_lines(stream, config.capture, log.clone(), ""))
        });
        let stderr_task = child.stderr.take().map(|stream| {
            tokio::spawn(forward_lines(stream, config.capture, log, STDERR_PREFIX))
        });

        Ok(Self {
            child,
            config,
            pid,
            stdout_task,
            stderr_task,
        })
    }

    /// The process id.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.pid
    }

    /// Wait for exit, without a bound, and return the exit code.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` if the exit status cannot be collected.
    pub async fn wait(mut self) -> Result<Option<i32>> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| Error::command_failed(-1, format!("failed to wait for process: {e}")))?;
        Ok(status.code())
    }

    /// Wait for completion within the configured timeout and collect output.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` after killing the process group when the bound
    /// passes, or `CommandFailed` if the exit status cannot be collected.
    pub async fn wait_with_output(mut self) -> Result<ProcessResult> {
        let waited = match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    warn!(pid = self.pid, command = %self.config.display(), "command timed out, killing process group");
                    kill_group(self.pid).log_best_effort("kill timed out process group");
                    self.child.kill().await.ok();
                    abort_reader(self.stdout_task.take());
                    abort_reader(self.stderr_task.take());
                    return Err(Error::timeout(self.config.display(), limit.as_secs()));
                }
            },
            None => self.child.wait().await,
        };
        let status =
            waited.map_err(|e| Error::command_failed(-1, format!("failed to wait for process: {e}")))?;

        let stdout = join_reader(self.stdout_task.take()).await;
        let stderr = join_reader(self.stderr_task.take()).await;

        Ok(ProcessResult {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }

    /// Kill the process group and the process.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` if the kill fails.
    pub async fn kill(mut self) -> Result<()> {
        kill_group(self.pid).log_best_effort("kill process group");
        self.child
            .kill()
            .await
            .map_err(|e| Error::command_failed(-1, format!("failed to kill process: {e}")))
    }
}

async fn forward_lines<T>(
    stream: T,
    capture: bool,
    log: Option<LogWriter>,
    prefix: &'static str,
) -> Vec<String>
where
    T: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut collected = Vec::new();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(ref writer) = log {
                    writer
                        .append(&format!("{prefix}{line}"))
                        .map(drop)
                        .log_best_effort("append child output");
                }
                if capture {
                    collected.push(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "stopped reading child output");
                break;
            }
        }
    }
    collected
}

async fn join_reader(task: Option<JoinHandle<Vec<String>>>) -> Vec<String> {
    let Some(mut task) = task else {
        return Vec::new();
    };
    match tokio::time::timeout(READER_GRACE, &mut task).await {
        Ok(Ok(lines)) => lines,
        Ok(Err(e)) => {
            warn!(error = %e, "output reader failed");
            Vec::new()
        }
        Err(_) => {
            task.abort();
            Vec::new()
        }
    }
}

fn abort_reader(task: Option<JoinHandle<Vec<String>>>) {
    if let Some(task) = task {
        task.abort();
    }
}

/// Spawn and wait for a process.
///
/// # Errors
///
/// Returns spawn, wait and timeout errors; a non-zero exit is not an error.
pub async fn spawn_and_wait(config: ProcessConfig) -> Result<ProcessResult> {
    WorkerProcess::spawn(config)?.wait_with_output().await
}

/// Run a shell command line in `dir` and check success.
///
/// # Errors
///
/// Returns `CommandFailed` on a non-zero exit, or a spawn/timeout error.
pub async fn run_in_dir(line: &str, dir: &Path, timeout: Duration) -> Result<ProcessResult> {
    let result = spawn_and_wait(ProcessConfig::shell(line).working_dir(dir).timeout(timeout)).await?;
    result.check_success()?;
    Ok(result)
}
