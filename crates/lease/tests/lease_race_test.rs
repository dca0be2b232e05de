//! Two writers racing for one lease.
//!
//! The claim protocol is check, write, then re-read after the verification
//! delay. These tests replay every interleaving of those steps for two
//! simulated writers and check that at most one ends up confirmed.

#![forbid(unsafe_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use rotor_core::Error;
use rotor_lease::{AcquireMode, LeaseName, LeaseStore, Liveness, Prober, Urgency, WriteOutcome};

const LEASE: LeaseName = LeaseName::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Confirmed,
    Lost { saw: Option<u32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Check,
    Write,
    Verify,
}

const STEPS: [Step; 3] = [Step::Check, Step::Write, Step::Verify];

struct Writer {
    pid: u32,
    next: usize,
    outcome: Option<Outcome>,
    trace: Vec<Step>,
}

impl Writer {
    const fn new(pid: u32) -> Self {
        Self {
            pid,
            next: 0,
            outcome: None,
            trace: Vec::new(),
        }
    }

    fn advance(&mut self, store: &LeaseStore) {
        let Some(step) = STEPS.get(self.next).copied() else {
            return;
        };
        self.next += 1;
        if self.outcome.is_some() {
            return;
        }
        self.trace.push(step);

        match step {
            Step::Check => {
                // every simulated owner counts as alive
                if let Some(owner) = store.read(LEASE).unwrap() {
                    if owner != self.pid {
                        self.outcome = Some(Outcome::Lost { saw: Some(owner) });
                    }
                }
            }
            Step::Write => {
                if let WriteOutcome::Occupied(owner) = store.write(LEASE, self.pid).unwrap() {
                    self.outcome = Some(Outcome::Lost { saw: owner });
                }
            }
            Step::Verify => {
                let seen = store.read(LEASE).unwrap();
                self.outcome = Some(if seen == Some(self.pid) {
                    Outcome::Confirmed
                } else {
                    Outcome::Lost { saw: seen }
                });
            }
        }
    }
}

/// All orderings of three steps from writer A (false) and three from B (true).
fn schedules() -> Vec<Vec<bool>> {
    fn build(a_left: usize, b_left: usize, prefix: &mut Vec<bool>, out: &mut Vec<Vec<bool>>) {
        if a_left == 0 && b_left == 0 {
            out.push(prefix.clone());
            return;
        }
        if a_left > 0 {
            prefix.push(false);
            build(a_left - 1, b_left, prefix, out);
            prefix.pop();
        }
        if b_left > 0 {
            prefix.push(true);
            build(a_left, b_left - 1, prefix, out);
            prefix.pop();
        }
    }

    let mut out = Vec::new();
    build(3, 3, &mut Vec::new(), &mut out);
    out
}

fn replay(mode: AcquireMode, schedule: &[bool]) -> (Writer, Writer) {
    let dir = tempfile::tempdir().unwrap();
    let store = LeaseStore::new(dir.path()).with_mode(mode);
    let mut a = Writer::new(1001);
    let mut b = Writer::new(1002);

    for &is_b in schedule {
        if is_b {
            b.advance(&store);
        } else {
            a.advance(&store);
        }
    }
    (a, b)
}

fn confirmed(writer: &Writer) -> bool {
    writer.outcome == Some(Outcome::Confirmed)
}

#[test]
fn test_exclusive_create_confirms_exactly_one_writer_in_every_interleaving() {
    let all = schedules();
    assert_eq!(all.len(), 20);

    for schedule in &all {
        // Given: two writers racing with exclusive create
        // When: their steps interleave in this order
        let (a, b) = replay(AcquireMode::ExclusiveCreate, schedule);

        // Then: exactly one is confirmed
        let winners = usize::from(confirmed(&a)) + usize::from(confirmed(&b));
        assert_eq!(winners, 1, "schedule {schedule:?}: a={:?} b={:?}", a.trace, b.trace);

        // And: the loser observed the winner's pid
        let (winner, loser) = if confirmed(&a) { (&a, &b) } else { (&b, &a) };
        assert_eq!(
            loser.outcome,
            Some(Outcome::Lost {
                saw: Some(winner.pid)
            }),
            "schedule {schedule:?}"
        );
    }
}

#[test]
fn test_write_then_verify_settles_on_last_writer_within_window() {
    // Only schedules where both writers finish check+write before either
    // verifies: the verification delay covers the other writer's write.
    let windowed: Vec<Vec<bool>> = schedules()
        .into_iter()
        .filter(|s| {
            let first_four = s.iter().take(4).filter(|&&is_b| is_b).count();
            first_four == 2
        })
        .collect();
    assert_eq!(windowed.len(), 12);

    for schedule in &windowed {
        let (a, b) = replay(AcquireMode::WriteThenVerify, schedule);

        let winners = usize::from(confirmed(&a)) + usize::from(confirmed(&b));
        assert!(winners <= 1, "schedule {schedule:?}");

        let losers = [&a, &b]
            .into_iter()
            .filter(|w| !confirmed(w))
            .collect::<Vec<_>>();
        for loser in losers {
            match loser.outcome {
                Some(Outcome::Lost { saw: Some(pid) }) => assert_ne!(pid, loser.pid),
                other => panic!("loser should see a foreign pid, got {other:?}"),
            }
        }
    }
}

struct AlwaysAlive;

impl Prober for AlwaysAlive {
    fn probe(&self, _pid: u32) -> bool {
        true
    }
}

async fn race(mode: AcquireMode) {
    let dir = tempfile::tempdir().unwrap();
    let store = LeaseStore::new(dir.path())
        .with_mode(mode)
        .with_liveness(Liveness::new(Arc::new(AlwaysAlive), Urgency::Urgent).with_interval(Duration::ZERO))
        .with_verify_delay(Duration::from_millis(10), Duration::from_millis(30));

    let (first, second) = tokio::join!(store.acquire(LEASE, 1001), store.acquire(LEASE, 1002));

    let (winner, loser) = match (first, second) {
        (Ok(lease), Err(err)) | (Err(err), Ok(lease)) => (lease, err),
        (Ok(_), Ok(_)) => panic!("both writers confirmed"),
        (Err(a), Err(b)) => panic!("nobody won: {a} / {b}"),
    };

    match loser {
        Error::LockContention { owner_pid, .. } => assert_eq!(owner_pid, winner.owner_pid),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.read(LEASE).unwrap(), Some(winner.owner_pid));
}

#[tokio::test]
async fn test_concurrent_acquire_has_one_owner_with_exclusive_create() {
    race(AcquireMode::ExclusiveCreate).await;
}

#[tokio::test]
async fn test_concurrent_acquire_has_one_owner_with_write_then_verify() {
    race(AcquireMode::WriteThenVerify).await;
}
