//! File-backed single-owner claims.
//!
//! A lease file holds exactly the decimal pid of its owner. Claims are
//! written, then re-read after a short randomized delay: the writer owns the
//! lease only if it still sees its own pid. Empty or non-numeric content reads
//! as absent. A lease whose pid fails the liveness vote is stale and may be
//! reclaimed without asking anyone.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use rotor_core::{Error, Result};
use tracing::{debug, info, warn};

use crate::liveness::Liveness;

/// Default bounds of the randomized verification delay.
const VERIFY_DELAY_MIN: Duration = Duration::from_millis(20);
const VERIFY_DELAY_MAX: Duration = Duration::from_millis(80);

/// Poll interval while waiting for a lease to free up.
const WAIT_POLL: Duration = Duration::from_millis(250);

/// The well-known leases under a deployment root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseName {
    /// Manager daemon claim.
    Manager,
    /// Processor daemon claim.
    Processor,
    /// Pid of the supervised application instance.
    Instance,
    /// Pipeline lock; at most one run per deployment root.
    Pipeline,
}

impl LeaseName {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Processor => "processor",
            Self::Instance => "instance",
            Self::Pipeline => "process",
        }
    }

    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Manager => "manager.pid",
            Self::Processor => "processor.pid",
            Self::Instance => "instance.pid",
            Self::Pipeline => "process.pid",
        }
    }
}

impl fmt::Display for LeaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the claim is written before verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquireMode {
    /// Overwrite unconditionally; contention is only caught by the re-read.
    WriteThenVerify,
    /// Create-new: a second writer sees the file exists and backs off.
    #[default]
    ExclusiveCreate,
}

/// Raw content of a lease file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseContent {
    Missing,
    Owned(u32),
    /// Empty or non-numeric content.
    Garbage(String),
}

impl LeaseContent {
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        match self {
            Self::Owned(pid) => Some(*pid),
            Self::Missing | Self::Garbage(_) => None,
        }
    }
}

/// Result of a single write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Exclusive create found an existing file; carries its pid if readable.
    Occupied(Option<u32>),
}

/// A confirmed claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: LeaseName,
    pub path: PathBuf,
    pub owner_pid: u32,
    pub created_at: DateTime<Utc>,
}

/// Lease files in one directory (the deployment root).
#[derive(Debug, Clone)]
pub struct LeaseStore {
    dir: PathBuf,
    mode: AcquireMode,
    liveness: Liveness,
    verify_delay: (Duration, Duration),
}

impl LeaseStore {
    /// Store with the default mode and OS liveness checks.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            mode: AcquireMode::default(),
            liveness: Liveness::default(),
            verify_delay: (VERIFY_DELAY_MIN, VERIFY_DELAY_MAX),
        }
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: AcquireMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_liveness(mut self, liveness: Liveness) -> Self {
        self.liveness = liveness;
        self
    }

    /// Bounds of the randomized delay between write and re-read.
    #[must_use]
    pub const fn with_verify_delay(mut self, min: Duration, max: Duration) -> Self {
        self.verify_delay = (min, max);
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub const fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    #[must_use]
    pub fn path(&self, name: LeaseName) -> PathBuf {
        self.dir.join(name.file_name())
    }

    /// Raw lease content.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` for I/O errors other than a missing file.
    pub fn inspect(&self, name: LeaseName) -> Result<LeaseContent> {
        let path = self.path(name);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(parse_content(&text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(LeaseContent::Missing),
            Err(e) => Err(Error::file_read_failed(&path, e.to_string())),
        }
    }

    /// Owner pid, or `None` when the lease is absent.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` for unexpected I/O errors.
    pub fn read(&self, name: LeaseName) -> Result<Option<u32>> {
        self.inspect(name).map(|content| content.pid())
    }

    /// Write `pid` according to the store's mode.
    ///
    /// # Errors
    ///
    /// Returns `FileWriteFailed` if the file cannot be written.
    pub fn write(&self, name: LeaseName, pid: u32) -> Result<WriteOutcome> {
        let path = self.path(name);
        match self.mode {
            AcquireMode::WriteThenVerify => {
                fs::write(&path, pid.to_string())
                    .map_err(|e| Error::file_write_failed(&path, e.to_string()))?;
                Ok(WriteOutcome::Written)
            }
            AcquireMode::ExclusiveCreate => {
                let opened = OpenOptions::new().write(true).create_new(true).open(&path);
                match opened {
                    Ok(mut file) => {
                        file.write_all(pid.to_string().as_bytes())
                            .map_err(|e| Error::file_write_failed(&path, e.to_string()))?;
                        Ok(WriteOutcome::Written)
                    }
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        Ok(WriteOutcome::Occupied(self.read(name)?))
                    }
                    Err(e) => Err(Error::file_write_failed(&path, e.to_string())),
                }
            }
        }
    }

    /// Record `pid` unconditionally, e.g. the pid of a freshly spawned child.
    ///
    /// # Errors
    ///
    /// Returns `FileWriteFailed` if the file cannot be written.
    pub fn record(&self, name: LeaseName, pid: u32) -> Result<()> {
        let path = self.path(name);
        fs::write(&path, pid.to_string()).map_err(|e| Error::file_write_failed(&path, e.to_string()))
    }

    /// Remove the file only if it still holds `expected`.
    ///
    /// # Errors
    ///
    /// Returns `FileWriteFailed` if the file exists but cannot be removed.
    pub fn remove_if(&self, name: LeaseName, expected: &LeaseContent) -> Result<bool> {
        let current = self.inspect(name)?;
        if &current != expected || current == LeaseContent::Missing {
            return Ok(false);
        }
        let path = self.path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::file_write_failed(&path, e.to_string())),
        }
    }

    /// Claim `name` for `pid`.
    ///
    /// A live foreign owner is `LockContention`. A dead owner or unreadable
    /// content is reclaimed. After writing, the claim is re-read once the
    /// randomized delay has passed; seeing a foreign pid is `LockContention`.
    ///
    /// # Errors
    ///
    /// Returns `LockContention` when another live process holds or wins the
    /// lease, or an I/O error.
    pub async fn acquire(&self, name: LeaseName, pid: u32) -> Result<Lease> {
        match self.inspect(name)? {
            LeaseContent::Owned(owner) if owner == pid => {
                debug!(lease = %name, pid, "lease already held by caller");
            }
            LeaseContent::Owned(owner) => {
                if self.liveness.is_alive(owner).await {
                    return Err(Error::lock_contention(name.as_str(), owner));
                }
                let stale = Error::lease_stale(name.as_str(), owner);
                info!(lease = %name, stale_pid = owner, error = %stale, "reclaiming stale lease");
                self.remove_if(name, &LeaseContent::Owned(owner))?;
            }
            garbage @ LeaseContent::Garbage(_) => {
                warn!(lease = %name, content = ?garbage, "discarding unreadable lease");
                self.remove_if(name, &garbage)?;
            }
            LeaseContent::Missing => {}
        }

        if self.read(name)? != Some(pid) {
            if let WriteOutcome::Occupied(owner) = self.write(name, pid)? {
                return Err(Error::lock_contention(name.as_str(), owner.unwrap_or(0)));
            }
        }

        tokio::time::sleep(self.jittered_delay()).await;

        match self.read(name)? {
            Some(owner) if owner == pid => {
                debug!(lease = %name, pid, "lease acquired");
                Ok(Lease {
                    name,
                    path: self.path(name),
                    owner_pid: pid,
                    created_at: Utc::now(),
                })
            }
            Some(owner) => {
                warn!(lease = %name, pid, winner = owner, "lost lease race");
                Err(Error::lock_contention(name.as_str(), owner))
            }
            None => {
                warn!(lease = %name, pid, "lease vanished during verification");
                Err(Error::lock_contention(name.as_str(), 0))
            }
        }
    }

    /// Keep trying to acquire until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns the last `LockContention` once the bound is exceeded, or any
    /// non-contention error immediately.
    pub async fn acquire_within(&self, name: LeaseName, pid: u32, timeout: Duration) -> Result<Lease> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.acquire(name, pid).await {
                Ok(lease) => return Ok(lease),
                Err(Error::LockContention { lease, owner_pid }) => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockContention { lease, owner_pid });
                    }
                    debug!(lease = %name, owner_pid, "lease busy, backing off");
                    tokio::time::sleep(self.backoff()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait until the lease is absent or its owner is dead.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if a live owner still holds it after `timeout`.
    pub async fn wait_released(&self, name: LeaseName, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.holder(name).await {
                Ok(None) | Err(Error::LeaseStale { .. }) => return Ok(()),
                Ok(Some(_)) if Instant::now() >= deadline => {
                    return Err(Error::timeout(
                        format!("waiting for lease '{name}'"),
                        timeout.as_secs(),
                    ));
                }
                Ok(Some(_)) => tokio::time::sleep(WAIT_POLL).await,
                Err(e) => return Err(e),
            }
        }
    }

    /// The live owner of `name`, or `None` when the lease is absent.
    ///
    /// # Errors
    ///
    /// Returns `LeaseStale` when the recorded owner is dead, or
    /// `FileReadFailed` for unexpected I/O errors.
    pub async fn holder(&self, name: LeaseName) -> Result<Option<u32>> {
        match self.read(name)? {
            None => Ok(None),
            Some(owner) if self.liveness.is_alive(owner).await => Ok(Some(owner)),
            Some(owner) => Err(Error::lease_stale(name.as_str(), owner)),
        }
    }

    /// Owner pid if that process is alive.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` for unexpected I/O errors.
    pub async fn live_owner(&self, name: LeaseName) -> Result<Option<u32>> {
        match self.holder(name).await {
            Err(Error::LeaseStale { .. }) => Ok(None),
            other => other,
        }
    }

    /// Ownership re-validation for a process that believes it holds `name`.
    ///
    /// # Errors
    ///
    /// Returns `LeaseCorrupt` if the file holds unreadable content, which is
    /// an integrity violation for a held lease.
    pub fn is_owner(&self, name: LeaseName, pid: u32) -> Result<bool> {
        match self.inspect(name)? {
            LeaseContent::Owned(owner) => Ok(owner == pid),
            LeaseContent::Missing => Ok(false),
            LeaseContent::Garbage(content) => Err(Error::lease_corrupt(self.path(name), content)),
        }
    }

    /// Release a confirmed lease. Returns `false` if someone else owns it now.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be removed.
    pub fn release(&self, lease: &Lease) -> Result<bool> {
        let removed = self.remove_if(lease.name, &LeaseContent::Owned(lease.owner_pid))?;
        if removed {
            debug!(lease = %lease.name, pid = lease.owner_pid, "lease released");
        } else {
            warn!(lease = %lease.name, pid = lease.owner_pid, "lease no longer ours, not releasing");
        }
        Ok(removed)
    }

    fn jittered_delay(&self) -> Duration {
        let (min, max) = self.verify_delay;
        if max <= min {
            return min;
        }
        let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    fn backoff(&self) -> Duration {
        let millis = rand::thread_rng().gen_range(150..=450_u64);
        Duration::from_millis(millis)
    }
}

fn parse_content(text: &str) -> LeaseContent {
    let trimmed = text.trim();
    match trimmed.parse::<u32>() {
        Ok(pid) if pid > 0 => LeaseContent::Owned(pid),
        _ => LeaseContent::Garbage(trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;
    use crate::liveness::{Prober, Urgency};
    use std::sync::Arc;

    struct Fixed(bool);

    impl Prober for Fixed {
        fn probe(&self, _pid: u32) -> bool {
            self.0
        }
    }

    fn store(dir: &Path, alive: bool) -> LeaseStore {
        LeaseStore::new(dir)
            .with_liveness(Liveness::new(Arc::new(Fixed(alive)), Urgency::Urgent).with_interval(Duration::ZERO))
            .with_verify_delay(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_empty_and_non_numeric_content_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), true);

        fs::write(store.path(LeaseName::Processor), "").unwrap();
        assert_eq!(store.read(LeaseName::Processor).unwrap(), None);

        fs::write(store.path(LeaseName::Processor), "not-a-pid").unwrap();
        assert_eq!(store.read(LeaseName::Processor).unwrap(), None);

        fs::write(store.path(LeaseName::Processor), "1234\n").unwrap();
        assert_eq!(store.read(LeaseName::Processor).unwrap(), Some(1234));
    }

    #[tokio::test]
    async fn test_acquire_then_release() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), true);

        let lease = store.acquire(LeaseName::Pipeline, 4242).await.expect("free lease");
        assert_eq!(lease.owner_pid, 4242);
        assert_eq!(fs::read_to_string(&lease.path).unwrap(), "4242");

        assert!(store.release(&lease).unwrap());
        assert_eq!(store.read(LeaseName::Pipeline).unwrap(), None);
    }

    #[tokio::test]
    async fn test_live_foreign_owner_is_contention() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), true);
        store.record(LeaseName::Manager, 1111).unwrap();

        let err = store.acquire(LeaseName::Manager, 2222).await.unwrap_err();
        match err {
            Error::LockContention { owner_pid, .. } => assert_eq!(owner_pid, 1111),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_dead_owner_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), false);
        store.record(LeaseName::Manager, 1111).unwrap();

        let lease = store.acquire(LeaseName::Manager, 2222).await.expect("stale lease reclaimed");
        assert_eq!(lease.owner_pid, 2222);
        assert_eq!(store.read(LeaseName::Manager).unwrap(), Some(2222));
    }

    #[tokio::test]
    async fn test_dead_owner_reports_stale_but_does_not_block() {
        // Given: a lease recorded by a process that has died
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), false);
        store.record(LeaseName::Processor, 3333).unwrap();

        // When: the holder is checked
        let err = store.holder(LeaseName::Processor).await.unwrap_err();

        // Then: the lease is stale, which nobody has to wait for
        match err {
            Error::LeaseStale { ref lease, pid } => {
                assert_eq!(lease, "processor");
                assert_eq!(pid, 3333);
            }
            ref other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.kind(), "lease_stale");
        assert_eq!(store.live_owner(LeaseName::Processor).await.unwrap(), None);
        store
            .wait_released(LeaseName::Processor, Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_holder_reports_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), true);
        assert_eq!(store.holder(LeaseName::Manager).await.unwrap(), None);

        store.record(LeaseName::Manager, 4444).unwrap();
        assert_eq!(store.holder(LeaseName::Manager).await.unwrap(), Some(4444));
    }

    #[tokio::test]
    async fn test_garbage_lease_is_discarded_on_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), true);
        fs::write(store.path(LeaseName::Processor), "???").unwrap();

        let lease = store.acquire(LeaseName::Processor, 77).await.expect("garbage discarded");
        assert_eq!(lease.owner_pid, 77);
    }

    #[test]
    fn test_release_refuses_foreign_lease() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), true);
        store.record(LeaseName::Pipeline, 9).unwrap();

        let stolen = Lease {
            name: LeaseName::Pipeline,
            path: store.path(LeaseName::Pipeline),
            owner_pid: 8,
            created_at: Utc::now(),
        };
        assert!(!store.release(&stolen).unwrap());
        assert_eq!(store.read(LeaseName::Pipeline).unwrap(), Some(9));
    }

    #[test]
    fn test_is_owner_flags_corrupt_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), true);
        fs::write(store.path(LeaseName::Manager), "oops").unwrap();

        let err = store.is_owner(LeaseName::Manager, 5).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_wait_released_times_out_on_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), true);
        store.record(LeaseName::Pipeline, 31).unwrap();

        let result = store
            .wait_released(LeaseName::Pipeline, Duration::from_millis(300))
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_wait_released_returns_for_dead_owner() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), false);
        store.record(LeaseName::Pipeline, 31).unwrap();

        store
            .wait_released(LeaseName::Pipeline, Duration::from_secs(1))
            .await
            .expect("dead owner counts as released");
    }
}
