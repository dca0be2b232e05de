//! Reading the end of the shared log.
//!
//! Consumers never read the whole file: each poll reads a bounded trailing
//! window, drops a partial first line and an unterminated last line, and
//! parses what is left. Lines that are not records are skipped.

use std::collections::HashSet;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use rotor_core::{Error, Result};

use crate::record::LogRecord;

/// Reads complete records from the trailing window of a log file.
#[derive(Debug, Clone)]
pub struct TailReader {
    path: PathBuf,
    window: u64,
}

impl TailReader {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, window: u64) -> Self {
        Self {
            path: path.into(),
            window: window.max(1),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All complete records inside the window, in file order.
    ///
    /// A missing file reads as empty.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` on any other I/O failure.
    pub fn read_window(&self) -> Result<Vec<LogRecord>> {
        let bytes = match self.window_bytes() {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::file_read_failed(&self.path, e.to_string())),
        };
        let text = String::from_utf8_lossy(&bytes);
        Ok(text.lines().filter_map(LogRecord::parse).collect())
    }

    /// The last `count` records in the window.
    ///
    /// # Errors
    ///
    /// Same as [`read_window`](Self::read_window).
    pub fn last_records(&self, count: usize) -> Result<Vec<LogRecord>> {
        let mut records = self.read_window()?;
        let skip = records.len().saturating_sub(count);
        records.drain(..skip);
        Ok(records)
    }

    /// Bytes of the window trimmed to whole lines.
    fn window_bytes(&self) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        let start = len.saturating_sub(self.window);

        // Read one byte before the window to learn whether it starts on a
        // line boundary.
        let read_from = start.saturating_sub(1);
        file.seek(SeekFrom::Start(read_from))?;
        let mut bytes = Vec::new();
        file.take(len.saturating_sub(read_from)).read_to_end(&mut bytes)?;

        let head = if start == 0 {
            0
        } else {
            bytes
                .iter()
                .position(|&b| b == b'\n')
                .map_or(bytes.len(), |pos| pos.saturating_add(1))
        };
        let tail = bytes
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos.saturating_add(1));

        if tail <= head {
            return Ok(Vec::new());
        }
        Ok(bytes.get(head..tail).map(<[u8]>::to_vec).unwrap_or_default())
    }
}

/// A consumer position in the log: the timestamp of the last record seen.
#[derive(Debug, Clone)]
pub struct TailCursor {
    reader: TailReader,
    last_seen: Option<DateTime<Utc>>,
}

impl TailCursor {
    /// A cursor that yields everything currently in the window.
    #[must_use]
    pub const fn from_start(reader: TailReader) -> Self {
        Self {
            reader,
            last_seen: None,
        }
    }

    /// A cursor positioned after an explicit timestamp.
    #[must_use]
    pub const fn after(reader: TailReader, timestamp: DateTime<Utc>) -> Self {
        Self {
            reader,
            last_seen: Some(timestamp),
        }
    }

    /// A cursor positioned after the newest record already in the window.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` if the log cannot be read.
    pub fn from_now(reader: TailReader) -> Result<Self> {
        let last_seen = reader
            .read_window()?
            .into_iter()
            .map(|record| record.timestamp)
            .max();
        Ok(Self { reader, last_seen })
    }

    #[must_use]
    pub const fn position(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    #[must_use]
    pub const fn reader(&self) -> &TailReader {
        &self.reader
    }

    /// Records newer than the cursor, in file order; advances the cursor.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` if the log cannot be read.
    pub fn poll(&mut self) -> Result<Vec<LogRecord>> {
        let fresh: Vec<LogRecord> = self
            .reader
            .read_window()?
            .into_iter()
            .filter(|record| self.last_seen.is_none_or(|seen| record.timestamp > seen))
            .collect();

        if let Some(newest) = fresh.iter().map(|record| record.timestamp).max() {
            self.last_seen = Some(newest);
        }
        Ok(fresh)
    }

    /// Pids that appear in the window right now.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` if the log cannot be read.
    pub fn snapshot_pids(&self) -> Result<HashSet<u32>> {
        Ok(self
            .reader
            .read_window()?
            .into_iter()
            .map(|record| record.pid)
            .collect())
    }
}
