//! Deployment-root layout: the four instance slots, lease files and logs.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::DeployConfig;

/// Name of the shared append-only log.
pub const LOG_FILE: &str = "rotor.log";

/// Scratch directory `current` is renamed to while a swap is in flight.
pub const RETIRED_DIR: &str = "retired-instance";

/// One of the four named instance directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    Old,
    Previous,
    Current,
    Upcoming,
}

impl Slot {
    /// All slots, oldest first.
    pub const ALL: [Self; 4] = [Self::Old, Self::Previous, Self::Current, Self::Upcoming];

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Old => "old",
            Self::Previous => "previous",
            Self::Current => "current",
            Self::Upcoming => "upcoming",
        }
    }

    /// Default directory name under the deployment root.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Old => "old-instance",
            Self::Previous => "previous-instance",
            Self::Current => "current-instance",
            Self::Upcoming => "upcoming-instance",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved paths under one deployment root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
    old: PathBuf,
    previous: PathBuf,
    current: PathBuf,
    upcoming: PathBuf,
}

impl Layout {
    /// Layout with default slot directory names.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            old: root.join(Slot::Old.dir_name()),
            previous: root.join(Slot::Previous.dir_name()),
            current: root.join(Slot::Current.dir_name()),
            upcoming: root.join(Slot::Upcoming.dir_name()),
            root,
        }
    }

    /// Layout honoring slot overrides; relative overrides resolve against the root.
    #[must_use]
    pub fn from_config(config: &DeployConfig) -> Self {
        let base = Self::new(&config.root);
        let resolve = |over: Option<&PathBuf>, fallback: PathBuf| {
            over.map_or(fallback, |p| base.root.join(p))
        };
        Self {
            old: resolve(config.slots.old.as_ref(), base.old.clone()),
            previous: resolve(config.slots.previous.as_ref(), base.previous.clone()),
            current: resolve(config.slots.current.as_ref(), base.current.clone()),
            upcoming: resolve(config.slots.upcoming.as_ref(), base.upcoming.clone()),
            root: base.root.clone(),
        }
    }

    /// Deployment root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a slot.
    #[must_use]
    pub fn slot(&self, slot: Slot) -> &Path {
        match slot {
            Slot::Old => &self.old,
            Slot::Previous => &self.previous,
            Slot::Current => &self.current,
            Slot::Upcoming => &self.upcoming,
        }
    }

    /// Where `current` is parked during a swap.
    #[must_use]
    pub fn retired(&self) -> PathBuf {
        self.root.join(RETIRED_DIR)
    }

    /// A `<name>.pid` lease file.
    #[must_use]
    pub fn pid_file(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    /// The shared log.
    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }
}
