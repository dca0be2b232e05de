//! # Rotor - command-line entry point
//!
//! `rotor manager` and `rotor processor` run the two daemons in the
//! foreground; every other subcommand is a short-lived client of theirs.
//!
//! Everything a daemon logs is appended to `<root>/rotor.log`, which is how
//! a CLI that spawned a daemon detached follows what it does.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use anyhow::{Context, Result};
use clap::Parser;

use rotor::cli::Cli;
use rotor::commands::{execute_command, load_config};
use rotor_core::Layout;

/// Daemons and clients alike run on a single-threaded event loop.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.global)?;
    let layout = Layout::from_config(&config);

    if cli.command.is_daemon() {
        std::fs::create_dir_all(layout.root())
            .with_context(|| format!("creating deployment root {}", layout.root().display()))?;
    }
    let log_file = layout.log_file();
    let shared_log = layout.root().is_dir().then_some(log_file.as_path());
    rotor_events::subscriber::init(cli.command.log_source(), shared_log)?;

    execute_command(cli.command, &cli.global, config).await
}
