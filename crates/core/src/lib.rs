#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # rotor-core
//!
//! Shared vocabulary for the rotor workspace:
//! - [`Error`] taxonomy and the crate-wide [`Result`]
//! - [`Settings`] (opaque key/value map) and the typed [`DeployConfig`]
//! - [`Layout`] of a deployment root and its four [`Slot`]s

pub mod config;
pub mod error;
pub mod layout;
pub mod result;

pub use config::{DeployConfig, Settings, SlotPaths, StartConfig, Timeouts};
pub use error::Error;
pub use layout::{Layout, Slot};
pub use result::{Result, ResultExt};
