#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # rotor-supervisor
//!
//! Running other programs:
//! - [`process`]: bounded command runs for install/build/test steps
//! - [`manifest`]: start-command resolution for the deployed app
//! - [`signal`]: the interrupt / terminate / group kill / force kill ladder
//! - [`Supervisor`]: one long-lived child with restart backoff

pub mod child;
pub mod manifest;
pub mod policy;
pub mod process;
pub mod signal;
pub mod supervisor;

pub use child::{ChildSnapshot, ChildState, SupervisedChild};
pub use manifest::{StartCommand, StartSource};
pub use policy::RestartPolicy;
pub use process::{ProcessConfig, ProcessResult, WorkerProcess, run_in_dir, spawn_and_wait};
pub use signal::{OsSignaller, STAGE_WAIT, Signaller, Stage, TerminateLadder, Termination, kill_group};
pub use supervisor::{APP_SOURCE, ChildExit, Supervisor, SupervisorSettings};
