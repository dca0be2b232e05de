//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Rotor - self-hosted continuous deployment
#[derive(Parser, Debug)]
#[command(name = "rotor")]
#[command(version)]
#[command(about = "Rotate instance slots, swap, supervise")]
#[command(
    long_about = "Rotor checks out a repository reference into a fresh slot, installs and builds it, swaps it in for the running instance and keeps the application alive."
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options every subcommand understands.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// TOML configuration file (defaults to ./rotor.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Deployment root, overriding the configuration
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the Manager daemon in the foreground
    Manager,

    /// Run the Processor daemon in the foreground
    Processor,

    /// Trigger a deployment and follow it
    Deploy {
        /// Repository to deploy from
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Reference to check out (defaults to HEAD)
        #[arg(long = "ref")]
        reference: Option<String>,

        /// Return once the run is accepted
        #[arg(long, default_value_t = false)]
        no_follow: bool,
    },

    /// Show both daemons' status
    Status,

    /// Abort the active run and stop the application
    Stop,

    /// Stop everything and exit both daemons
    Shutdown,

    /// Print the shared log
    Logs {
        /// Keep printing new records
        #[arg(short, long, default_value_t = false)]
        follow: bool,

        /// Records to print before following
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}

impl Commands {
    /// Source tag this invocation writes to the shared log with.
    #[must_use]
    pub const fn log_source(&self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Processor => "processor",
            _ => "cli",
        }
    }

    /// Whether this invocation runs a daemon.
    #[must_use]
    pub const fn is_daemon(&self) -> bool {
        matches!(self, Self::Manager | Self::Processor)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_deploy_flags() {
        let cli = Cli::try_parse_from(["rotor", "deploy", "--repo", "/srv/repo", "--ref", "main", "--no-follow"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Deploy {
                repo: PathBuf::from("/srv/repo"),
                reference: Some("main".to_string()),
                no_follow: true,
            }
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["rotor", "status", "--root", "/srv/app"]).unwrap();
        assert_eq!(cli.global.root, Some(PathBuf::from("/srv/app")));
        assert_eq!(cli.command.log_source(), "cli");
        assert!(!cli.command.is_daemon());
    }

    #[test]
    fn test_daemon_sources() {
        let cli = Cli::try_parse_from(["rotor", "processor"]).unwrap();
        assert!(cli.command.is_daemon());
        assert_eq!(cli.command.log_source(), "processor");
    }
}
