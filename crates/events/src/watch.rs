//! Bounded waits on the shared log.
//!
//! There is no pipe back from a detached child, so these helpers poll the
//! tail with a [`TailCursor`] until something shows up or the deadline
//! passes. The log is advisory; `/status` stays the authority.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::debug;

use rotor_core::{Error, Result};

use crate::record::LogRecord;
use crate::tail::TailCursor;

/// Default pause between polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Poll cadence and deadline for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitOptions {
    #[must_use]
    pub const fn within(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: POLL_INTERVAL,
        }
    }

    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Poll until `accept` returns `Some` for a fresh record.
///
/// Every fresh record is offered to `accept` in file order, so callers can
/// also use this to stream progress while waiting for a terminal marker.
///
/// # Errors
///
/// Returns `Timeout` when the deadline passes first, or a read error.
pub async fn follow_until<T>(
    cursor: &mut TailCursor,
    options: WaitOptions,
    operation: &str,
    mut accept: impl FnMut(&LogRecord) -> Option<T>,
) -> Result<T> {
    let deadline = Instant::now() + options.timeout;
    loop {
        for record in cursor.poll()? {
            if let Some(found) = accept(&record) {
                return Ok(found);
            }
        }
        if Instant::now() >= deadline {
            debug!(operation, "log wait timed out");
            return Err(Error::timeout(operation, options.timeout.as_secs()));
        }
        sleep(options.interval).await;
    }
}

/// Wait for a record from a pid not in `known`, optionally from one source.
///
/// # Errors
///
/// Returns `Timeout` if no new writer shows up in time.
pub async fn wait_for_child_start(
    cursor: &mut TailCursor,
    known: &HashSet<u32>,
    source: Option<&str>,
    options: WaitOptions,
) -> Result<LogRecord> {
    follow_until(cursor, options, "wait for child start", |record| {
        let from_source = source.is_none_or(|tag| record.source == tag);
        (from_source && !known.contains(&record.pid)).then(|| record.clone())
    })
    .await
}

/// Wait for any record past the cursor; returns every fresh record from the
/// first non-empty poll.
///
/// # Errors
///
/// Returns `Timeout` if the log does not move in time.
pub async fn wait_for_update(cursor: &mut TailCursor, options: WaitOptions) -> Result<Vec<LogRecord>> {
    let deadline = Instant::now() + options.timeout;
    loop {
        let fresh = cursor.poll()?;
        if !fresh.is_empty() {
            return Ok(fresh);
        }
        if Instant::now() >= deadline {
            return Err(Error::timeout("wait for log update", options.timeout.as_secs()));
        }
        sleep(options.interval).await;
    }
}
