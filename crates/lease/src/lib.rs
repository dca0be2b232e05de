#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # rotor-lease
//!
//! Cross-process coordination with nothing but the filesystem and the
//! process table:
//! - [`LeaseStore`]: pid files claimed by write-then-reverify
//! - [`Liveness`]: repeated null-signal probes decided by majority vote
//!
//! Unrelated processes (short-lived CLI calls, the daemons, the supervised
//! app) share no pipe, so every wait here is a bounded, jittered poll.

pub mod lease;
pub mod liveness;

pub use lease::{AcquireMode, Lease, LeaseContent, LeaseName, LeaseStore, WriteOutcome};
pub use liveness::{Liveness, OsProber, PROBE_ATTEMPTS, Prober, Urgency};
