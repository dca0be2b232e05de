//! Working out how to start the deployed application.
//!
//! Fallback chain: configured command, manifest `scripts.start`, manifest
//! `main`, then the first configured entry file that exists in the slot.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use rotor_core::{Error, Result, StartConfig};

use crate::process::ProcessConfig;

/// Where the start command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartSource {
    Configured,
    Script,
    Main,
    Entry,
}

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    scripts: BTreeMap<String, String>,
    #[serde(default)]
    main: Option<String>,
}

/// A resolved start command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCommand {
    pub program: String,
    pub args: Vec<String>,
    pub source: StartSource,
}

impl StartCommand {
    /// Resolve the start command for the application in `slot`.
    ///
    /// # Errors
    ///
    /// Returns `JsonParseFailed` for an unreadable manifest and
    /// `InvalidConfig` when nothing in the chain applies.
    pub fn resolve(slot: &Path, manifest_file: &str, start: &StartConfig) -> Result<Self> {
        if let Some(ref line) = start.command {
            return Ok(Self::shell(line, StartSource::Configured));
        }

        let manifest = read_manifest(&slot.join(manifest_file))?;

        if let Some(script) = manifest.scripts.get("start").filter(|s| !s.trim().is_empty()) {
            return Ok(Self::shell(script, StartSource::Script));
        }

        if let Some(main) = manifest.main.filter(|m| slot.join(m).is_file()) {
            return Ok(Self::runtime(&start.runtime, main, StartSource::Main));
        }

        start
            .entries
            .iter()
            .find(|entry| slot.join(entry).is_file())
            .map(|entry| Self::runtime(&start.runtime, entry.clone(), StartSource::Entry))
            .ok_or_else(|| {
                Error::invalid_config(
                    "start.command",
                    format!(
                        "no start command, start script, main file or entry file in {}",
                        slot.display()
                    ),
                )
            })
    }

    fn shell(line: &str, source: StartSource) -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), line.trim().to_string()],
            source,
        }
    }

    fn runtime(runtime: &str, file: String, source: StartSource) -> Self {
        Self {
            program: runtime.to_string(),
            args: vec![file],
            source,
        }
    }

    /// Process configuration running this command inside `slot`.
    ///
    /// Local package binaries (`node_modules/.bin`) go first on `PATH`, the
    /// way a package manager runs its scripts.
    #[must_use]
    pub fn process_config(&self, slot: &Path) -> ProcessConfig {
        let mut config = ProcessConfig::new(&self.program)
            .args(self.args.iter().cloned())
            .working_dir(slot)
            .capture(false);

        let local_bin = slot.join("node_modules").join(".bin");
        if local_bin.is_dir() {
            let mut paths = vec![local_bin];
            if let Some(existing) = std::env::var_os("PATH") {
                paths.extend(std::env::split_paths(&existing));
            }
            if let Ok(joined) = std::env::join_paths(paths) {
                config = config.env("PATH", joined.to_string_lossy());
            }
        }
        config
    }
}

impl fmt::Display for StartCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.program.as_str(), self.args.as_slice()) {
            ("sh", [_, line]) => f.write_str(line),
            (program, args) => write!(f, "{program} {}", args.join(" ")),
        }
    }
}

fn read_manifest(path: &Path) -> Result<Manifest> {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text)
            .map_err(|e| Error::json_parse_failed(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
        Err(e) => Err(Error::file_read_failed(path, e.to_string())),
    }
}
