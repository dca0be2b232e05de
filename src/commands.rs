//! CLI command handlers.
//!
//! Short-lived commands talk to the daemons over their control planes. A
//! daemon that is not running is spawned detached; since there is no pipe
//! back from it, its start and the run's progress are observed through the
//! shared log.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use rotor_control::{ControlClient, ControlResponse, Role, run_manager, run_processor};
use rotor_core::{DeployConfig, Error, Layout, Settings};
use rotor_events::{
    POLL_INTERVAL, TailCursor, TailReader, WaitOptions, follow_until, wait_for_child_start, wait_for_update,
};
use rotor_pipeline::{Progress, RunId, RunRequest};

use crate::cli::{Commands, GlobalArgs};

/// Configuration file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "rotor.toml";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "ROTOR";

/// Slack on top of the configured step timeouts when following a run.
const FOLLOW_SLACK: Duration = Duration::from_secs(120);

/// Build the configuration: TOML file, then `ROTOR_*` variables, then flags.
///
/// # Errors
///
/// Returns an error for an unreadable file or a value that does not parse.
pub fn load_config(global: &GlobalArgs) -> Result<DeployConfig> {
    let file = global
        .config
        .clone()
        .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()));

    let base = match file {
        Some(path) => Settings::from_toml_file(&path).with_context(|| format!("loading {}", path.display()))?,
        None => Settings::new(),
    };
    let mut settings = base.merge(Settings::from_env(ENV_PREFIX));
    if let Some(root) = &global.root {
        settings = settings.with("root", root.to_string_lossy());
    }
    Ok(DeployConfig::from_settings(&settings)?)
}

/// Execute a CLI command.
///
/// This is the main command dispatcher that routes to the appropriate handler.
pub async fn execute_command(command: Commands, global: &GlobalArgs, config: DeployConfig) -> Result<()> {
    match command {
        Commands::Manager => Ok(run_manager(config).await?),
        Commands::Processor => Ok(run_processor(config).await?),
        Commands::Deploy {
            repo,
            reference,
            no_follow,
        } => cmd_deploy(global, &config, &repo, reference, no_follow).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Stop => cmd_stop(&config).await,
        Commands::Shutdown => cmd_shutdown(&config).await,
        Commands::Logs { follow, lines } => cmd_logs(&config, follow, lines).await,
    }
}

/// Trigger a run, starting daemons as needed, and follow it to its end.
async fn cmd_deploy(
    global: &GlobalArgs,
    config: &DeployConfig,
    repo: &Path,
    reference: Option<String>,
    no_follow: bool,
) -> Result<()> {
    let layout = Layout::from_config(config);
    let mut cursor = TailCursor::from_now(TailReader::new(layout.log_file(), config.log_tail_bytes))?;

    for role in [Role::Manager, Role::Processor] {
        ensure_running(global, config, role, &mut cursor).await?;
    }

    let repository = std::path::absolute(repo).with_context(|| format!("resolving {}", repo.display()))?;
    let request = match reference {
        Some(reference) => RunRequest::new(repository).with_reference(reference),
        None => RunRequest::new(repository),
    };
    let id = processor_client(config).deploy(&request).await?;
    println!("run {id} accepted");

    if no_follow {
        return Ok(());
    }
    match follow_run(&mut cursor, config, id).await? {
        Progress::Finished => {
            println!("run {id} finished");
            Ok(())
        }
        Progress::Failed(reason) => bail!("run {id} failed: {reason}"),
        Progress::Aborted(reason) => bail!("run {id} aborted: {reason}"),
        Progress::State(state) => bail!("run {id} stopped reporting in state {state}"),
    }
}

/// Print every record until `id` reaches a terminal marker.
async fn follow_run(cursor: &mut TailCursor, config: &DeployConfig, id: RunId) -> Result<Progress> {
    let timeouts = &config.timeouts;
    let commands = u32::try_from(config.build_commands.len() + config.test_commands.len()).unwrap_or(u32::MAX);
    let bound = timeouts.preempt_wait
        + timeouts.lease_wait
        + timeouts.install
        + timeouts.build.saturating_mul(commands.max(1))
        + FOLLOW_SLACK;

    let progress = follow_until(cursor, WaitOptions::within(bound), "follow pipeline run", |record| {
        println!("{record}");
        Progress::parse(&record.message)
            .filter(|(run, progress)| *run == id && progress.is_terminal())
            .map(|(_, progress)| progress)
    })
    .await?;
    Ok(progress)
}

/// Make sure the daemon for `role` answers, spawning it detached if not.
async fn ensure_running(
    global: &GlobalArgs,
    config: &DeployConfig,
    role: Role,
    cursor: &mut TailCursor,
) -> Result<()> {
    let client = client_for(config, role);
    match client.status_once().await {
        Ok(report) => {
            info!(role = %role, pid = report.pid, "daemon running");
            return Ok(());
        }
        Err(Error::ControlPlaneUnreachable { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    let known = cursor.snapshot_pids()?;
    let pid = spawn_detached(global, config, role)?;
    info!(role = %role, pid, "daemon spawned");

    let options = WaitOptions::within(config.timeouts.lease_wait);
    let started = wait_for_child_start(cursor, &known, Some(role.as_str()), options)
        .await
        .with_context(|| format!("{role} did not start"))?;
    println!("{started}");

    // the daemon logs before it binds; the status retries cover the gap
    client.status().await.with_context(|| format!("{role} did not come up"))?;
    Ok(())
}

/// Start `rotor <role>` in its own process group with no pipes back.
fn spawn_detached(global: &GlobalArgs, config: &DeployConfig, role: Role) -> Result<u32> {
    let exe = std::env::current_exe().context("locating the rotor executable")?;
    let mut command = tokio::process::Command::new(exe);
    command.arg(role.as_str());
    if let Some(file) = &global.config {
        command.arg("--config").arg(file);
    }
    command
        .arg("--root")
        .arg(&config.root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn().with_context(|| format!("spawning {role}"))?;
    child.id().with_context(|| format!("{role} exited immediately"))
}

async fn cmd_status(config: &DeployConfig) -> Result<()> {
    for role in [Role::Manager, Role::Processor] {
        match client_for(config, role).status().await {
            Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            Err(Error::ControlPlaneUnreachable { .. }) => println!("{role}: not running"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn cmd_stop(config: &DeployConfig) -> Result<()> {
    report(Role::Processor, processor_client(config).stop().await)?;
    report(Role::Manager, client_for(config, Role::Manager).stop().await)
}

async fn cmd_shutdown(config: &DeployConfig) -> Result<()> {
    report(Role::Processor, processor_client(config).shutdown().await)?;
    report(Role::Manager, client_for(config, Role::Manager).shutdown().await)
}

fn report(role: Role, outcome: rotor_core::Result<ControlResponse>) -> Result<()> {
    match outcome {
        Ok(ControlResponse::Ack { message, .. }) => println!("{role}: {message}"),
        Ok(other) => println!("{role}: {other:?}"),
        Err(Error::ControlPlaneUnreachable { .. }) => println!("{role}: not running"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn cmd_logs(config: &DeployConfig, follow: bool, lines: usize) -> Result<()> {
    let layout = Layout::from_config(config);
    let reader = TailReader::new(layout.log_file(), config.log_tail_bytes);
    let records = reader.last_records(lines)?;
    for record in &records {
        println!("{record}");
    }
    if !follow {
        return Ok(());
    }

    let mut cursor = match records.last() {
        Some(last) => TailCursor::after(reader, last.timestamp),
        None => TailCursor::from_start(reader),
    };
    let options = WaitOptions::within(Duration::from_secs(60)).with_interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            fresh = wait_for_update(&mut cursor, options) => match fresh {
                Ok(fresh) => fresh.iter().for_each(|record| println!("{record}")),
                Err(Error::Timeout { .. }) => {}
                Err(e) => {
                    warn!(error = %e, "log follow failed");
                    return Err(e.into());
                }
            },
        }
    }
}

fn client_for(config: &DeployConfig, role: Role) -> ControlClient {
    let url = match role {
        Role::Manager => config.manager_url(),
        Role::Processor => config.processor_url(),
    };
    ControlClient::new(url).with_retries(config.status_retries)
}

fn processor_client(config: &DeployConfig) -> ControlClient {
    client_for(config, Role::Processor)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_root_flag_overrides_configuration() {
        let global = GlobalArgs {
            config: None,
            root: Some(PathBuf::from("/srv/shop")),
        };
        let config = load_config(&global).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/shop"));
    }

    #[test]
    fn test_config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("deploy.toml");
        std::fs::write(&file, "[manager]\nport = 5100\n").unwrap();
        let global = GlobalArgs {
            config: Some(file),
            root: None,
        };
        let config = load_config(&global).unwrap();
        assert_eq!(config.manager_port, 5100);
        assert_eq!(config.manager_url(), "http://127.0.0.1:5100");
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let global = GlobalArgs {
            config: Some(PathBuf::from("/nonexistent/rotor.toml")),
            root: None,
        };
        assert!(load_config(&global).is_err());
    }
}
