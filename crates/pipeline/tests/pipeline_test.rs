//! End-to-end pipeline runs against a directory-copy version control.
//!
//! A "repository" here is a directory with one subdirectory per reference;
//! checking out a reference copies that subdirectory into `upcoming`.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use rotor_core::{DeployConfig, Layout, Result, Slot};
use rotor_lease::{LeaseName, LeaseStore};
use rotor_pipeline::slots::copy_tree;
use rotor_pipeline::{
    CommitInfo, LocalSwapper, Pipeline, RunRequest, RunState, Swapper, VersionControl,
};

#[derive(Default)]
struct CopyVcs {
    empty_checkout: bool,
    clones: AtomicUsize,
}

#[async_trait]
impl VersionControl for CopyVcs {
    async fn checkout(&self, repository: &Path, reference: &str, target: &Path) -> Result<()> {
        if self.empty_checkout {
            return Ok(());
        }
        copy_tree(&repository.join(reference), target)
    }

    async fn clone_full(&self, repository: &Path, reference: &str, target: &Path) -> Result<()> {
        self.clones.fetch_add(1, Ordering::SeqCst);
        copy_tree(&repository.join(reference), target)
    }

    async fn last_commit(&self, _repository: &Path, reference: &str) -> Result<CommitInfo> {
        Ok(CommitInfo {
            hash: reference.to_string(),
            date: Utc::now(),
            message: format!("release {reference}"),
        })
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: DeployConfig,
    layout: Layout,
    repo: PathBuf,
}

const MANIFEST: &str = r#"{"name":"shop","scripts":{"start":"node server.js"}}"#;

fn fixture(install: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("repo");
    let config = DeployConfig {
        root: dir.path().join("deploy"),
        install_command: Some(install.to_string()),
        carry_over: vec![".env".to_string()],
        ..DeployConfig::default()
    };
    fs::create_dir_all(&config.root).unwrap();
    let layout = Layout::from_config(&config);
    Fixture {
        _dir: dir,
        config,
        layout,
        repo,
    }
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

/// A release in the repository and, optionally, as the live instance.
fn release(root: &Path, version: &str) {
    write(&root.join("package.json"), MANIFEST);
    write(&root.join("package-lock.json"), "{\"lockfileVersion\":3}");
    write(&root.join("version.txt"), version);
}

fn pipeline(fx: &Fixture, vcs: Arc<CopyVcs>, swapper: Arc<dyn Swapper>) -> Pipeline {
    Pipeline::new(fx.config.clone(), vcs, swapper)
}

fn local(fx: &Fixture) -> Arc<dyn Swapper> {
    Arc::new(LocalSwapper::new(fx.layout.clone(), None))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unchanged_manifest_skips_install_on_every_run() {
    // Given: the live instance and the repository share manifest and lock file,
    // and an install command that would fail if it ran
    let fx = fixture("exit 1");
    release(fx.layout.slot(Slot::Current), "v1");
    release(&fx.repo.join("v2"), "v2");
    release(&fx.repo.join("v3"), "v3");
    let pipeline = pipeline(&fx, Arc::new(CopyVcs::default()), local(&fx));

    // When: two runs deploy new code with the same dependencies
    let first = pipeline.run(RunRequest::new(&fx.repo).with_reference("v2")).await;
    let second = pipeline.run(RunRequest::new(&fx.repo).with_reference("v3")).await;

    // Then: both succeed without installing
    for report in [&first, &second] {
        assert!(report.is_success(), "run failed: {:?}", report.error);
        assert!(report.was_skipped(RunState::Installing));
    }
    assert_eq!(read(&fx.layout.slot(Slot::Current).join("version.txt")), "v3");
    assert_eq!(second.commit.as_ref().unwrap().hash, "v3");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_changed_lock_file_runs_install_in_upcoming() {
    let fx = fixture("echo installed > installed.txt");
    release(fx.layout.slot(Slot::Current), "v1");
    release(&fx.repo.join("v2"), "v2");
    write(&fx.repo.join("v2/package-lock.json"), "{\"lockfileVersion\":3,\"new\":true}");
    let pipeline = pipeline(&fx, Arc::new(CopyVcs::default()), local(&fx));

    let report = pipeline.run(RunRequest::new(&fx.repo).with_reference("v2")).await;

    assert!(report.is_success(), "run failed: {:?}", report.error);
    assert!(!report.was_skipped(RunState::Installing));
    assert_eq!(read(&fx.layout.slot(Slot::Current).join("installed.txt")), "installed\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trigger_during_install_preempts_the_running_pipeline() {
    // Given: run A is inside a slow install
    let fx = fixture("sleep 1");
    release(fx.layout.slot(Slot::Current), "v1");
    release(&fx.repo.join("a"), "a");
    write(&fx.repo.join("a/package-lock.json"), "changed-a");
    release(&fx.repo.join("b"), "b");
    write(&fx.repo.join("b/package-lock.json"), "changed-b");
    let pipeline = pipeline(&fx, Arc::new(CopyVcs::default()), local(&fx));

    let run_a = {
        let pipeline = pipeline.clone();
        let request = RunRequest::new(&fx.repo).with_reference("a");
        tokio::spawn(async move { pipeline.run(request).await })
    };
    let mut installing = false;
    for _ in 0..100 {
        if pipeline
            .current_run()
            .is_some_and(|run| run.state == RunState::Installing)
        {
            installing = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(installing, "run A never reached Installing");

    // When: run B is triggered
    let report_b = pipeline.run(RunRequest::new(&fx.repo).with_reference("b")).await;
    let report_a = run_a.await.unwrap();

    // Then: A aborted at the next boundary, B completed the rotation
    assert_eq!(report_a.run.state, RunState::Aborted);
    assert_eq!(report_a.error_kind.as_deref(), Some("aborted"));
    assert!(
        report_a
            .steps
            .iter()
            .all(|step| step.state != RunState::Swapping)
    );
    assert!(report_b.is_success(), "run B failed: {:?}", report_b.error);
    assert_eq!(read(&fx.layout.slot(Slot::Previous).join("version.txt")), "v1");
    assert_eq!(read(&fx.layout.slot(Slot::Current).join("version.txt")), "b");
    assert!(pipeline.current_run().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_build_leaves_upcoming_and_releases_lease() {
    // Given: a build command that fails
    let mut fx = fixture("true");
    fx.config.build_commands = vec!["echo compiling; echo broken >&2; exit 7".to_string()];
    release(fx.layout.slot(Slot::Current), "v1");
    release(&fx.repo.join("v2"), "v2");
    let pipeline = pipeline(&fx, Arc::new(CopyVcs::default()), local(&fx));

    // When: the run executes
    let report = pipeline.run(RunRequest::new(&fx.repo).with_reference("v2")).await;

    // Then: it fails with the step context, live instance untouched
    assert_eq!(report.run.state, RunState::Failed);
    assert_eq!(report.error_kind.as_deref(), Some("step_failure"));
    let error = report.error.unwrap();
    assert!(error.contains("build"), "{error}");
    assert!(error.contains("Some(7)"), "{error}");
    assert!(error.contains("broken"), "{error}");
    assert_eq!(read(&fx.layout.slot(Slot::Current).join("version.txt")), "v1");
    assert_eq!(read(&fx.layout.slot(Slot::Upcoming).join("version.txt")), "v2");
    assert_eq!(LeaseStore::new(&fx.config.root).read(LeaseName::Pipeline).unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_checkout_falls_back_to_full_clone() {
    let fx = fixture("true");
    release(&fx.repo.join("v1"), "v1");
    let vcs = Arc::new(CopyVcs {
        empty_checkout: true,
        ..CopyVcs::default()
    });
    let pipeline = pipeline(&fx, Arc::clone(&vcs), local(&fx));

    let report = pipeline.run(RunRequest::new(&fx.repo).with_reference("v1")).await;

    assert!(report.is_success(), "run failed: {:?}", report.error);
    assert_eq!(vcs.clones.load(Ordering::SeqCst), 1);
    assert_eq!(read(&fx.layout.slot(Slot::Current).join("version.txt")), "v1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_carry_over_brings_secrets_into_the_new_instance() {
    let fx = fixture("true");
    release(fx.layout.slot(Slot::Current), "v1");
    write(&fx.layout.slot(Slot::Current).join(".env"), "TOKEN=abc");
    release(&fx.repo.join("v2"), "v2");
    let pipeline = pipeline(&fx, Arc::new(CopyVcs::default()), local(&fx));

    let report = pipeline.run(RunRequest::new(&fx.repo).with_reference("v2")).await;

    assert!(report.is_success(), "run failed: {:?}", report.error);
    assert_eq!(read(&fx.layout.slot(Slot::Current).join(".env")), "TOKEN=abc");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_aborts_the_active_run() {
    let fx = fixture("sleep 1");
    release(&fx.repo.join("v1"), "v1");
    let pipeline = pipeline(&fx, Arc::new(CopyVcs::default()), local(&fx));

    let run = {
        let pipeline = pipeline.clone();
        let request = RunRequest::new(&fx.repo).with_reference("v1");
        tokio::spawn(async move { pipeline.run(request).await })
    };
    for _ in 0..100 {
        if pipeline.current_run().is_some_and(|r| r.state == RunState::Installing) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(pipeline.stop().is_some());

    let report = run.await.unwrap();
    assert_eq!(report.run.state, RunState::Aborted);
    assert!(report.error.unwrap().contains("stop request"));
    assert!(!fx.layout.slot(Slot::Current).exists());
}

#[cfg(unix)]
mod supervised {
    use super::*;

    use rotor_lease::{Liveness, Urgency};
    use rotor_supervisor::{Supervisor, SupervisorSettings, TerminateLadder};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_successful_run_replaces_the_child_after_old_one_is_dead() {
        // Given: v1 is live and supervised
        let mut fx = fixture("true");
        fx.config.start.command = Some("exec sleep 30".to_string());
        release(fx.layout.slot(Slot::Current), "v1");
        release(&fx.repo.join("v2"), "v2");

        let settings = SupervisorSettings::from_config(&fx.config, &fx.layout)
            .with_ladder(TerminateLadder::default().with_stage_wait(Duration::from_millis(300)));
        let supervisor = Supervisor::new(settings);
        let old_pid = supervisor.spawn(fx.layout.slot(Slot::Current)).await.unwrap();
        let swapper = Arc::new(LocalSwapper::new(fx.layout.clone(), Some(supervisor.clone())));
        let pipeline = pipeline(&fx, Arc::new(CopyVcs::default()), swapper);

        // When: v2 is deployed
        let report = pipeline.run(RunRequest::new(&fx.repo).with_reference("v2")).await;

        // Then: exactly one slot keeps v1, current is v2, and only the new child lives
        assert!(report.is_success(), "run failed: {:?}", report.error);
        assert_eq!(read(&fx.layout.slot(Slot::Current).join("version.txt")), "v2");
        assert_eq!(read(&fx.layout.slot(Slot::Previous).join("version.txt")), "v1");
        assert!(!fx.layout.slot(Slot::Old).exists());
        assert!(!fx.layout.retired().exists());

        let liveness = Liveness::os(Urgency::Urgent);
        let new_pid = supervisor.snapshot().await.pid.unwrap();
        assert_ne!(new_pid, old_pid);
        assert!(!liveness.is_alive(old_pid).await);
        assert!(liveness.is_alive(new_pid).await);
        assert_eq!(
            LeaseStore::new(&fx.config.root).read(LeaseName::Instance).unwrap(),
            Some(new_pid)
        );

        supervisor.stop(true).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_instance_that_cannot_start_is_rolled_back() {
        // Given: v1 is live; v2 has no way to start
        let mut fx = fixture("true");
        fx.config.start.entries = vec!["index.js".to_string()];
        release(fx.layout.slot(Slot::Current), "v1");
        write(
            &fx.layout.slot(Slot::Current).join("package.json"),
            r#"{"scripts":{"start":"exec sleep 30"}}"#,
        );
        write(&fx.repo.join("v2/version.txt"), "v2");

        let settings = SupervisorSettings::from_config(&fx.config, &fx.layout)
            .with_ladder(TerminateLadder::default().with_stage_wait(Duration::from_millis(300)));
        let supervisor = Supervisor::new(settings);
        supervisor.spawn(fx.layout.slot(Slot::Current)).await.unwrap();
        let swapper = Arc::new(LocalSwapper::new(fx.layout.clone(), Some(supervisor.clone())));
        let pipeline = pipeline(&fx, Arc::new(CopyVcs::default()), swapper);

        // When: v2 is deployed
        let report = pipeline.run(RunRequest::new(&fx.repo).with_reference("v2")).await;

        // Then: the swap fails and v1 is live again
        assert_eq!(report.run.state, RunState::Failed);
        assert_eq!(read(&fx.layout.slot(Slot::Current).join("version.txt")), "v1");
        assert_eq!(read(&fx.layout.slot(Slot::Upcoming).join("version.txt")), "v2");
        let pid = supervisor.snapshot().await.pid.unwrap();
        assert!(Liveness::os(Urgency::Urgent).is_alive(pid).await);

        supervisor.stop(true).await.unwrap();
    }
}
