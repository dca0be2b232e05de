#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # rotor-pipeline
//!
//! The deployment pipeline: turn a repository reference into the running
//! instance by rotating whole slot directories.
//!
//! This crate provides:
//! - [`Pipeline`] runs under the pipeline lease, one at a time
//! - Cooperative [`Preemption`]: a newer trigger aborts the run in flight at
//!   its next step boundary
//! - Slot rotation ([`slots`]) with carry-over of secrets and caches
//! - The [`VersionControl`] and [`Swapper`] seams, with [`GitCli`] and
//!   [`LocalSwapper`] implementations
//!
//! # Design Principles
//!
//! - **Whole-slot moves**: a slot is moved, copied or cleared as a unit
//! - **No panics**: every failure is a typed `rotor_core::Error`
//! - **Bounded waits**: install, build, lease and preemption waits all time out

pub mod pipeline;
pub mod preempt;
pub mod run;
pub mod slots;
pub mod vcs;

pub use pipeline::{LocalSwapper, Pipeline, Swapper, resolve_repository};
pub use preempt::{Preemption, PreemptionState, STOP_REQUEST};
pub use run::{DEFAULT_REFERENCE, PipelineRun, Progress, RunId, RunReport, RunRequest, RunState, StepReport};
pub use slots::CarryOverStats;
pub use vcs::{CommitInfo, GitCli, VersionControl};
