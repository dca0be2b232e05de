//! Rotor control plane
//!
//! Loopback HTTP API for the two daemons. The Manager supervises the
//! deployed application; the Processor runs pipelines and hands the swap to
//! the Manager. Each daemon holds a lease file, and a newcomer replaces a
//! running daemon by asking it to `POST /terminate`.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod client;
pub mod daemon;
pub mod error;
pub mod manager;
pub mod processor;
pub mod protocol;
pub mod server;

pub use client::{ControlClient, ManagerSwapper};
pub use daemon::{DaemonContext, STATUS_TAIL_LINES, StopGuard};
pub use error::AppError;
pub use manager::{ManagerState, run_manager, serve_state};
pub use processor::{ProcessorState, default_pipeline, run_processor};
pub use protocol::{ControlResponse, RestartRequest, Role, StatusReport};
pub use server::{BindPolicy, bind_with_replacement, claim_lease, serve, socket_addr};
