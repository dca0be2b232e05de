//! The log line format shared by every rotor process.
//!
//! One record per line: `<timestamp> - <source> - <pid> - <message>`.
//! Timestamps are ISO-8601 UTC with microsecond precision.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};

use rotor_core::Error;

/// Field separator on the wire.
pub const SEPARATOR: &str = " - ";

static LAST_STAMP_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Next timestamp for a record written by this process.
///
/// Strictly increasing within the process: two records written in the same
/// clock tick still get distinct, ordered stamps.
#[must_use]
pub fn next_stamp() -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let mut prev = LAST_STAMP_MICROS.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(prev.saturating_add(1));
        match LAST_STAMP_MICROS.compare_exchange_weak(
            prev,
            candidate,
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => return DateTime::from_timestamp_micros(candidate).unwrap_or_else(Utc::now),
            Err(actual) => prev = actual,
        }
    }
}

/// Render a timestamp the way it appears on the wire.
#[must_use]
pub fn format_stamp(stamp: &DateTime<Utc>) -> String {
    stamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// One event in the shared log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub pid: u32,
    pub message: String,
}

impl LogRecord {
    /// Stamp a new record with the next process-local timestamp.
    #[must_use]
    pub fn new(source: &str, pid: u32, message: &str) -> Self {
        Self::at(next_stamp(), source, pid, message)
    }

    /// Build a record with an explicit timestamp.
    ///
    /// The source tag and message are flattened to a single line; a source
    /// tag never contains the field separator.
    #[must_use]
    pub fn at(timestamp: DateTime<Utc>, source: &str, pid: u32, message: &str) -> Self {
        Self {
            timestamp,
            source: sanitize_source(source),
            pid,
            message: single_line(message),
        }
    }

    /// The wire form, including the trailing newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }

    /// Parse one line; `None` when it is not a record.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        line.parse().ok()
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            format_stamp(&self.timestamp),
            self.source,
            self.pid,
            self.message
        )
    }
}

impl FromStr for LogRecord {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        let mut parts = line.splitn(4, SEPARATOR);
        let (Some(stamp), Some(source), Some(pid), Some(message)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed(line));
        };

        let timestamp = DateTime::parse_from_rfc3339(stamp)
            .map_err(|_| malformed(line))?
            .with_timezone(&Utc);
        let pid = pid.parse().map_err(|_| malformed(line))?;

        Ok(Self {
            timestamp,
            source: source.to_string(),
            pid,
            message: message.to_string(),
        })
    }
}

fn malformed(line: &str) -> Error {
    Error::MalformedLogLine {
        line: line.to_string(),
    }
}

fn sanitize_source(source: &str) -> String {
    let cleaned: String = source
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

fn single_line(message: &str) -> String {
    message
        .trim_end_matches(['\n', '\r'])
        .replace(['\n', '\r'], " ")
}
