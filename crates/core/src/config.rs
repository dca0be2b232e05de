//! Deployment configuration.
//!
//! The setup collaborator hands over an opaque key/value map ([`Settings`]).
//! [`DeployConfig`] is the typed view the daemons and the pipeline consume.
//! Keys are dotted (`manager.port`, `timeout.install_secs`); list values are
//! comma separated.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;
use crate::result::Result;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_MANAGER_PORT: u16 = 4100;
const DEFAULT_PROCESSOR_PORT: u16 = 4101;
const DEFAULT_CARRY_OVER: &str = ".env,node_modules";
const DEFAULT_MANIFEST: &str = "package.json";
const DEFAULT_LOCKFILE: &str = "package-lock.json";
const DEFAULT_INSTALL: &str = "npm ci";
const DEFAULT_RUNTIME: &str = "node";
const DEFAULT_ENTRIES: &str = "index.js,server.js,app.js,main.js";
const DEFAULT_LOG_TAIL_BYTES: u64 = 64 * 1024;

/// Opaque key/value configuration map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl Settings {
    /// Create an empty settings map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document, flattening nested tables into dotted keys.
    ///
    /// # Errors
    ///
    /// Returns `TomlParseFailed` if the document is not valid TOML.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(text).map_err(|e| Error::TomlParseFailed {
            reason: e.to_string(),
        })?;

        let mut settings = Self::new();
        flatten_table("", &table, &mut settings.values);
        Ok(settings)
    }

    /// Load a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` if the file cannot be read, or a parse error.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        Self::from_toml_str(&text)
    }

    /// Build settings from `PREFIX_SECTION__KEY=value` pairs.
    ///
    /// A double underscore separates nesting levels, so `ROTOR_MANAGER__PORT`
    /// becomes `manager.port` and `ROTOR_CARRY_OVER` becomes `carry_over`.
    #[must_use]
    pub fn from_vars(prefix: &str, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let marker = format!("{prefix}_");
        let values = vars
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&marker)
                    .map(|rest| (rest.to_lowercase().replace("__", "."), value))
            })
            .collect();
        Self { values }
    }

    /// Build settings from the process environment.
    #[must_use]
    pub fn from_env(prefix: &str) -> Self {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.values.extend(other.values);
        self
    }

    /// Set a single key.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Get a raw value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Parse a value, falling back to `default` when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the value is present but does not parse.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e: T::Err| Error::invalid_config(key, format!("{raw:?}: {e}"))),
        }
    }

    /// Read a comma-separated list, falling back to `default`.
    #[must_use]
    pub fn list_or(&self, key: &str, default: &str) -> Vec<String> {
        split_list(self.get(key).unwrap_or(default))
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        self.get(key)
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

fn flatten_table(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, String>) {
    for (key, value) in table {
        let full_key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(nested) => flatten_table(&full_key, nested, out),
            other => {
                out.insert(full_key, scalar_text(other));
            }
        }
    }
}

fn scalar_text(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Array(items) => items.iter().map(scalar_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

/// Per-slot directory overrides. `None` uses the default directory name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPaths {
    pub old: Option<PathBuf>,
    pub previous: Option<PathBuf>,
    pub current: Option<PathBuf>,
    pub upcoming: Option<PathBuf>,
}

/// How the supervised application is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartConfig {
    /// Explicit start command; wins over anything in the manifest.
    pub command: Option<String>,
    /// Interpreter used for a guessed entry file.
    pub runtime: String,
    /// Candidate entry files, tried in order.
    pub entries: Vec<String>,
}

/// Bounds on every wait in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub install: Duration,
    pub command: Duration,
    pub build: Duration,
    pub lease_wait: Duration,
    pub preempt_wait: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            install: Duration::from_secs(180),
            command: Duration::from_secs(10),
            build: Duration::from_secs(600),
            lease_wait: Duration::from_secs(30),
            preempt_wait: Duration::from_secs(60),
        }
    }
}

/// Typed deployment configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployConfig {
    pub root: PathBuf,
    pub host: String,
    pub manager_port: u16,
    pub processor_port: u16,
    pub slots: SlotPaths,
    /// Glob patterns (relative to a slot) copied from `current` into `upcoming`.
    pub carry_over: Vec<String>,
    pub manifest_file: String,
    pub lock_file: String,
    /// `None` disables the install step.
    pub install_command: Option<String>,
    pub build_commands: Vec<String>,
    pub test_commands: Vec<String>,
    pub start: StartConfig,
    pub timeouts: Timeouts,
    pub status_retries: u32,
    pub log_tail_bytes: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            host: DEFAULT_HOST.to_string(),
            manager_port: DEFAULT_MANAGER_PORT,
            processor_port: DEFAULT_PROCESSOR_PORT,
            slots: SlotPaths::default(),
            carry_over: split_list(DEFAULT_CARRY_OVER),
            manifest_file: DEFAULT_MANIFEST.to_string(),
            lock_file: DEFAULT_LOCKFILE.to_string(),
            install_command: Some(DEFAULT_INSTALL.to_string()),
            build_commands: Vec::new(),
            test_commands: Vec::new(),
            start: StartConfig {
                command: None,
                runtime: DEFAULT_RUNTIME.to_string(),
                entries: split_list(DEFAULT_ENTRIES),
            },
            timeouts: Timeouts::default(),
            status_retries: 5,
            log_tail_bytes: DEFAULT_LOG_TAIL_BYTES,
        }
    }
}

impl DeployConfig {
    /// Build the typed configuration from an opaque settings map.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first key whose value does not parse.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            settings
                .parse_or(key, default.as_secs())
                .map(Duration::from_secs)
        };

        let install_command = match settings.get("install.command") {
            None => defaults.install_command,
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(raw.trim().to_string()),
        };

        let config = Self {
            root: settings.path("root").unwrap_or(defaults.root),
            host: settings
                .get("host")
                .map_or(defaults.host, |h| h.trim().to_string()),
            manager_port: settings.parse_or("manager.port", defaults.manager_port)?,
            processor_port: settings.parse_or("processor.port", defaults.processor_port)?,
            slots: SlotPaths {
                old: settings.path("slots.old"),
                previous: settings.path("slots.previous"),
                current: settings.path("slots.current"),
                upcoming: settings.path("slots.upcoming"),
            },
            carry_over: settings.list_or("carry_over", DEFAULT_CARRY_OVER),
            manifest_file: settings
                .get("manifest")
                .map_or(defaults.manifest_file, |m| m.trim().to_string()),
            lock_file: settings
                .get("lockfile")
                .map_or(defaults.lock_file, |l| l.trim().to_string()),
            install_command,
            build_commands: settings.list_or("build.commands", ""),
            test_commands: settings.list_or("test.commands", ""),
            start: StartConfig {
                command: settings
                    .get("start.command")
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from),
                runtime: settings
                    .get("start.runtime")
                    .map_or(defaults.start.runtime, |r| r.trim().to_string()),
                entries: settings.list_or("start.entries", DEFAULT_ENTRIES),
            },
            timeouts: Timeouts {
                install: secs("timeout.install_secs", defaults.timeouts.install)?,
                command: secs("timeout.command_secs", defaults.timeouts.command)?,
                build: secs("timeout.build_secs", defaults.timeouts.build)?,
                lease_wait: secs("timeout.lease_wait_secs", defaults.timeouts.lease_wait)?,
                preempt_wait: secs("timeout.preempt_wait_secs", defaults.timeouts.preempt_wait)?,
            },
            status_retries: settings.parse_or("status.retries", defaults.status_retries)?,
            log_tail_bytes: settings.parse_or("log.tail_bytes", defaults.log_tail_bytes)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.manager_port != 0 && self.manager_port == self.processor_port {
            return Err(Error::invalid_config(
                "processor.port",
                "manager and processor cannot share a port",
            ));
        }
        if self.manifest_file.is_empty() {
            return Err(Error::invalid_config("manifest", "must not be empty"));
        }
        Ok(())
    }

    /// Base URL of the Manager control plane.
    #[must_use]
    pub fn manager_url(&self) -> String {
        format!("http://{}:{}", self.host, self.manager_port)
    }

    /// Base URL of the Processor control plane.
    #[must_use]
    pub fn processor_url(&self) -> String {
        format!("http://{}:{}", self.host, self.processor_port)
    }
}
