//! The termination ladder against simulated and real stubborn processes.
//!
//! The simulated process ignores a chosen set of stages; the ladder must
//! escalate past exactly those and report success only once the liveness
//! vote says the process is gone.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rotor_core::{Error, Result};
use rotor_lease::{Liveness, Prober, Urgency};
use rotor_supervisor::{Signaller, Stage, TerminateLadder, Termination};

struct FakeProcess {
    alive: AtomicBool,
    ignores: Vec<Stage>,
    received: Mutex<Vec<Stage>>,
}

impl FakeProcess {
    fn ignoring(ignores: &[Stage]) -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            ignores: ignores.to_vec(),
            received: Mutex::new(Vec::new()),
        })
    }

    fn dead() -> Arc<Self> {
        let process = Self::ignoring(&[]);
        process.alive.store(false, Ordering::SeqCst);
        process
    }

    fn received(&self) -> Vec<Stage> {
        self.received.lock().unwrap().clone()
    }
}

impl Signaller for FakeProcess {
    fn send(&self, _pid: u32, stage: Stage) -> Result<()> {
        self.received.lock().unwrap().push(stage);
        if !self.ignores.contains(&stage) {
            self.alive.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Prober for FakeProcess {
    fn probe(&self, _pid: u32) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

fn ladder_for(process: &Arc<FakeProcess>) -> TerminateLadder {
    let liveness =
        Liveness::new(Arc::clone(process) as Arc<dyn Prober>, Urgency::Urgent).with_interval(Duration::ZERO);
    TerminateLadder::new(Arc::clone(process) as Arc<dyn Signaller>, liveness)
        .with_stage_wait(Duration::from_millis(1))
}

#[tokio::test]
async fn test_polite_process_stops_at_interrupt() {
    let process = FakeProcess::ignoring(&[]);

    let outcome = ladder_for(&process).terminate(100, true).await.unwrap();

    assert_eq!(outcome, Termination::Stopped(Stage::Interrupt));
    assert_eq!(process.received(), vec![Stage::Interrupt]);
}

#[tokio::test]
async fn test_ignoring_interrupt_and_terminate_escalates_to_group_kill() {
    // Given: a child that traps interrupt and terminate
    let process = FakeProcess::ignoring(&[Stage::Interrupt, Stage::Terminate]);

    // When: the ladder runs
    let outcome = ladder_for(&process).terminate(100, true).await.unwrap();

    // Then: it escalates exactly to the group kill and the child is gone
    assert_eq!(outcome, Termination::Stopped(Stage::KillGroup));
    assert_eq!(
        process.received(),
        vec![Stage::Interrupt, Stage::Terminate, Stage::KillGroup]
    );
    assert!(!process.alive.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_escaping_the_group_reaches_forced_kill() {
    let process = FakeProcess::ignoring(&[Stage::Interrupt, Stage::Terminate, Stage::KillGroup]);

    let outcome = ladder_for(&process).terminate(100, true).await.unwrap();

    assert_eq!(outcome, Termination::Stopped(Stage::ForceKill));
    assert_eq!(process.received(), Stage::LADDER.to_vec());
    assert!(!process.alive.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_unkillable_process_is_a_supervision_failure() {
    let process = FakeProcess::ignoring(&Stage::LADDER);

    let mandatory = ladder_for(&process).terminate(100, true).await.unwrap_err();
    match &mandatory {
        Error::SupervisionFailure { pid, mandatory, .. } => {
            assert_eq!(*pid, 100);
            assert!(*mandatory);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(mandatory.is_fatal());

    let best_effort = ladder_for(&process).terminate(100, false).await.unwrap_err();
    assert!(!best_effort.is_fatal());
}

#[tokio::test]
async fn test_dead_process_gets_no_signals() {
    let process = FakeProcess::dead();

    let outcome = ladder_for(&process).terminate(100, true).await.unwrap();

    assert_eq!(outcome, Termination::AlreadyExited);
    assert!(process.received().is_empty());
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_real_process_trapping_signals_dies_to_group_kill() {
    // Given: a shell that ignores SIGINT and SIGTERM, leading its own group
    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg("trap '' INT TERM; while true; do sleep 1; done")
        .process_group(0)
        .spawn()
        .unwrap();
    let pid = child.id().unwrap();
    let reaper = tokio::spawn(async move { child.wait().await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    // When: the OS ladder runs with a short stage wait
    let ladder = TerminateLadder::default().with_stage_wait(Duration::from_millis(400));
    let outcome = ladder.terminate(pid, true).await.unwrap();

    // Then: interrupt and terminate were ignored, the group kill worked
    assert_eq!(outcome, Termination::Stopped(Stage::KillGroup));
    let status = reaper.await.unwrap().unwrap();
    assert!(!status.success());
    assert!(!ladder.liveness().is_alive(pid).await);
}
