#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # Rotor
//!
//! Self-hosted continuous deployment. This crate is the thin CLI on top of
//! the workspace crates; see `rotor-control` for the daemons.

pub mod cli;
pub mod commands;
