//! The directory-rotation pipeline.
//!
//! One run walks purge → checkout → carry-over → install → build/test → swap
//! while holding the pipeline lease. Every step boundary is a preemption
//! checkpoint; a failed step leaves `upcoming` as it was for inspection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use rotor_core::{DeployConfig, Error, Layout, Result, ResultExt, Slot};
use rotor_events::LogWriter;
use rotor_lease::{LeaseName, LeaseStore};
use rotor_supervisor::{ProcessConfig, Supervisor, spawn_and_wait};

use crate::preempt::Preemption;
use crate::run::{PipelineRun, Progress, RunId, RunReport, RunRequest, RunState, StepReport};
use crate::slots;
use crate::vcs::{CommitInfo, VersionControl};

/// Lines of stderr kept in a step failure.
const STDERR_TAIL: usize = 20;

/// Put `upcoming` live and restart the application on it.
#[async_trait]
pub trait Swapper: Send + Sync {
    async fn swap(&self, upcoming: &Path) -> Result<()>;
}

/// Swaps slots on this host and, when given a supervisor, replaces the
/// running child. Used by the Manager itself.
#[derive(Debug, Clone)]
pub struct LocalSwapper {
    layout: Layout,
    supervisor: Option<Supervisor>,
}

impl LocalSwapper {
    #[must_use]
    pub const fn new(layout: Layout, supervisor: Option<Supervisor>) -> Self {
        Self { layout, supervisor }
    }
}

#[async_trait]
impl Swapper for LocalSwapper {
    async fn swap(&self, upcoming: &Path) -> Result<()> {
        let layout = &self.layout;
        slots::adopt_upcoming(layout, upcoming)?;
        slots::promote(layout)?;

        let current = layout.slot(Slot::Current);
        if let Some(supervisor) = &self.supervisor {
            if let Err(e) = supervisor.replace(current).await {
                error!(error = %e, "new instance failed to start, rolling back");
                slots::rollback(layout).log_best_effort("roll back slots");
                if !e.is_fatal() {
                    supervisor
                        .spawn(current)
                        .await
                        .map(drop)
                        .log_best_effort("restart previous instance");
                }
                return Err(e);
            }
        }

        slots::discard_retired(layout)?;
        info!(current = %current.display(), "instance swapped");
        Ok(())
    }
}

/// What a run produced so far.
struct Tracker {
    run: PipelineRun,
    steps: Vec<StepReport>,
    commit: Option<CommitInfo>,
}

impl Tracker {
    fn record(&mut self, state: RunState, started: Instant, skipped: bool) {
        self.steps.push(StepReport {
            state,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            skipped,
        });
    }
}

struct Shared {
    config: DeployConfig,
    layout: Layout,
    leases: LeaseStore,
    vcs: Arc<dyn VersionControl>,
    swapper: Arc<dyn Swapper>,
    preemption: Preemption,
    current: watch::Sender<Option<PipelineRun>>,
    pid: u32,
}

/// Runs pipelines for one deployment root. Clones share state.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("root", &self.shared.layout.root())
            .field("pid", &self.shared.pid)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(config: DeployConfig, vcs: Arc<dyn VersionControl>, swapper: Arc<dyn Swapper>) -> Self {
        let layout = Layout::from_config(&config);
        let (current, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                leases: LeaseStore::new(layout.root()),
                layout,
                config,
                vcs,
                swapper,
                preemption: Preemption::new(),
                current,
                pid: std::process::id(),
            }),
        }
    }

    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.shared.layout
    }

    #[must_use]
    pub fn preemption(&self) -> &Preemption {
        &self.shared.preemption
    }

    /// The run holding the pipeline, if any.
    #[must_use]
    pub fn current_run(&self) -> Option<PipelineRun> {
        self.shared.current.borrow().clone()
    }

    /// Abort the active run, and any run waiting for it, at the next checkpoint.
    pub fn stop(&self) -> Option<RunId> {
        self.shared.preemption.stop()
    }

    /// Execute one run to a terminal state. Never fails; the outcome is in
    /// the report.
    pub async fn run(&self, request: RunRequest) -> RunReport {
        let shared = &self.shared;
        let id = request.id.unwrap_or_default();
        let mut tracker = Tracker {
            run: PipelineRun::queued(id, &request),
            steps: Vec::new(),
            commit: None,
        };
        shared.preemption.supersede(id);
        info!(
            run_id = %id,
            repository = %request.repository_path.display(),
            reference = request.reference(),
            "{}",
            Progress::State(RunState::Queued).message(&id)
        );

        if let Err(e) = shared.preemption.claim(id, shared.config.timeouts.preempt_wait).await {
            return Self::conclude(tracker, Err(e));
        }
        shared.current.send_replace(Some(tracker.run.clone()));

        let outcome = match shared
            .leases
            .acquire_within(LeaseName::Pipeline, shared.pid, shared.config.timeouts.lease_wait)
            .await
        {
            Ok(lease) => {
                let outcome = self.execute(&mut tracker, &request).await;
                shared
                    .leases
                    .release(&lease)
                    .map(drop)
                    .log_best_effort("release pipeline lease");
                outcome
            }
            Err(e) => Err(e),
        };

        shared.preemption.finish(id);
        shared.current.send_if_modified(|run| {
            if run.as_ref().is_some_and(|r| r.id == id) {
                *run = None;
                true
            } else {
                false
            }
        });
        Self::conclude(tracker, outcome)
    }

    async fn execute(&self, tracker: &mut Tracker, request: &RunRequest) -> Result<()> {
        let shared = &self.shared;
        let layout = shared.layout.clone();
        let upcoming = layout.slot(Slot::Upcoming).to_path_buf();
        let current = layout.slot(Slot::Current).to_path_buf();

        let started = self.enter(tracker, RunState::Purging)?;
        let purge_layout = layout.clone();
        blocking(move || slots::purge(&purge_layout)).await?;
        tracker.record(RunState::Purging, started, false);

        let started = self.enter(tracker, RunState::CheckingOut)?;
        self.checkout(request, &upcoming)
            .await
            .map_err(|e| step_error(RunState::CheckingOut, "checkout", e))?;
        tracker.commit = shared
            .vcs
            .last_commit(&request.repository_path, request.reference())
            .await
            .into_option_logged();
        tracker.record(RunState::CheckingOut, started, false);

        let started = self.enter(tracker, RunState::CopyingCarryOver)?;
        let (from, to, patterns) = (current.clone(), upcoming.clone(), shared.config.carry_over.clone());
        let stats = blocking(move || slots::carry_over(&from, &to, &patterns)).await?;
        info!(run_id = %tracker.run.id, copied = stats.copied, skipped = stats.skipped, "carry-over copied");
        tracker.record(RunState::CopyingCarryOver, started, false);

        let started = self.enter(tracker, RunState::Installing)?;
        match self.install_command(&current, &upcoming)? {
            Some(command) => {
                self.run_step(RunState::Installing, &command, &upcoming, shared.config.timeouts.install)
                    .await?;
                tracker.record(RunState::Installing, started, false);
            }
            None => {
                info!(run_id = %tracker.run.id, "install skipped, manifest and lock file unchanged");
                tracker.record(RunState::Installing, started, true);
            }
        }

        let started = self.enter(tracker, RunState::Building)?;
        let commands = shared
            .config
            .build_commands
            .iter()
            .chain(&shared.config.test_commands);
        for (index, command) in commands.enumerate() {
            if index > 0 {
                shared.preemption.checkpoint(tracker.run.id)?;
            }
            self.run_step(RunState::Building, command, &upcoming, shared.config.timeouts.build)
                .await?;
        }
        tracker.record(RunState::Building, started, false);

        let started = self.enter(tracker, RunState::Swapping)?;
        shared.swapper.swap(&upcoming).await?;
        tracker.record(RunState::Swapping, started, false);
        Ok(())
    }

    /// Checkpoint, then move the run into `state`.
    fn enter(&self, tracker: &mut Tracker, state: RunState) -> Result<Instant> {
        let shared = &self.shared;
        let id = tracker.run.id;
        shared.preemption.checkpoint(id)?;
        tracker.run.state = state;
        shared.current.send_replace(Some(tracker.run.clone()));
        info!(run_id = %id, "{}", Progress::State(state).message(&id));
        Ok(Instant::now())
    }

    async fn checkout(&self, request: &RunRequest, upcoming: &Path) -> Result<()> {
        let vcs = &self.shared.vcs;
        let repository = &request.repository_path;
        let reference = request.reference();

        let checked = vcs.checkout(repository, reference, upcoming).await;
        let retry = match &checked {
            Err(e) => {
                warn!(error = %e, "checkout failed, retrying with a full clone");
                true
            }
            Ok(()) => slots::is_empty_dir(upcoming)?,
        };
        if retry {
            if checked.is_ok() {
                warn!(reference, "checkout produced an empty tree, retrying with a full clone");
            }
            slots::clear_dir(upcoming)?;
            vcs.clone_full(repository, reference, upcoming).await?;
        }
        if slots::is_empty_dir(upcoming)? {
            return Err(Error::step_failed(
                RunState::CheckingOut.step_name(),
                format!("checkout {reference}"),
                None,
                "reference produced an empty tree",
            ));
        }
        Ok(())
    }

    /// The install command, unless the manifest and lock file match the
    /// running instance byte for byte.
    fn install_command(&self, current: &Path, upcoming: &Path) -> Result<Option<String>> {
        let config = &self.shared.config;
        let Some(command) = config.install_command.clone() else {
            return Ok(None);
        };
        let manifest = Path::new(&config.manifest_file);
        let lock = Path::new(&config.lock_file);
        if !upcoming.join(manifest).exists() {
            return Ok(None);
        }
        let unchanged = slots::same_file(&current.join(manifest), &upcoming.join(manifest))?
            && slots::same_file(&current.join(lock), &upcoming.join(lock))?;
        Ok((!unchanged).then_some(command))
    }

    async fn run_step(&self, state: RunState, command: &str, dir: &Path, timeout: Duration) -> Result<()> {
        let log = LogWriter::new(self.shared.layout.log_file(), state.step_name(), 0);
        let config = ProcessConfig::shell(command)
            .working_dir(dir)
            .timeout(timeout)
            .log_to(log);
        let result = spawn_and_wait(config)
            .await
            .map_err(|e| step_error(state, command, e))?;
        result.check_success().map_err(|e| step_error(state, command, e))
    }

    fn conclude(mut tracker: Tracker, outcome: Result<()>) -> RunReport {
        let id = tracker.run.id;
        let (state, progress, error) = match outcome {
            Ok(()) => (RunState::Done, Progress::Finished, None),
            Err(e @ Error::Aborted { .. }) => (RunState::Aborted, Progress::Aborted(e.to_string()), Some(e)),
            Err(e) => (RunState::Failed, Progress::Failed(e.to_string()), Some(e)),
        };
        tracker.run.state = state;

        let report = RunReport {
            run: tracker.run,
            finished_at: Utc::now(),
            steps: tracker.steps,
            commit: tracker.commit,
            error: error.as_ref().map(ToString::to_string),
            error_kind: error.as_ref().map(|e| e.kind().to_string()),
        };
        info!(
            run_id = %id,
            steps = report.steps.len(),
            commit = report.commit.as_ref().map_or("", |c| c.hash.as_str()),
            "{}",
            progress.message(&id)
        );
        if let Some(e) = &error {
            if e.is_fatal() {
                error!(run_id = %id, error = %e, "fatal pipeline error");
            }
        }
        report
    }
}

/// Name the step and command on command-level failures.
fn step_error(state: RunState, command: &str, error: Error) -> Error {
    let step = state.step_name();
    match error {
        Error::CommandFailed { code, stderr } => {
            let skip = stderr.lines().count().saturating_sub(STDERR_TAIL);
            let tail = stderr.lines().skip(skip).collect::<Vec<_>>().join("\n");
            Error::step_failed(step, command, Some(code), tail)
        }
        Error::Timeout { seconds, .. } => {
            Error::step_failed(step, command, None, format!("timed out after {seconds}s"))
        }
        Error::CommandNotFound { cmd } => {
            Error::step_failed(step, command, None, format!("command not found: {cmd}"))
        }
        other => other,
    }
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

/// Absolute repository path for a trigger relative to `base`.
#[must_use]
pub fn resolve_repository(base: &Path, repository: &Path) -> PathBuf {
    if repository.is_absolute() {
        repository.to_path_buf()
    } else {
        base.join(repository)
    }
}
