//! Appending records to the shared log.
//!
//! Every record is written with a single `write` on a file opened in append
//! mode, so lines from concurrent writers never interleave mid-line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use rotor_core::{Error, Result};

use crate::record::LogRecord;

/// Open `path` for appending, creating it and its parent directory.
///
/// # Errors
///
/// Returns `FileWriteFailed` if the file cannot be opened.
pub fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::directory_creation_failed(parent, e.to_string()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::file_write_failed(path, e.to_string()))
}

/// Append one record.
///
/// # Errors
///
/// Returns `FileWriteFailed` if the write fails.
pub fn append_record(path: &Path, record: &LogRecord) -> Result<()> {
    let mut file = open_append(path)?;
    file.write_all(record.to_line().as_bytes())
        .map_err(|e| Error::file_write_failed(path, e.to_string()))
}

/// Writes records for one (source, pid) pair.
#[derive(Debug, Clone)]
pub struct LogWriter {
    path: PathBuf,
    source: String,
    pid: u32,
}

impl LogWriter {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, source: impl Into<String>, pid: u32) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            pid,
        }
    }

    /// Writer tagged with the current process id.
    #[must_use]
    pub fn for_current_process(path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        Self::new(path, source, std::process::id())
    }

    /// Same file and source, different pid (a freshly spawned child).
    #[must_use]
    pub fn with_pid(&self, pid: u32) -> Self {
        Self {
            path: self.path.clone(),
            source: self.source.clone(),
            pid,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Stamp and append `message`, returning the written record.
    ///
    /// # Errors
    ///
    /// Returns `FileWriteFailed` if the log cannot be written.
    pub fn append(&self, message: &str) -> Result<LogRecord> {
        let record = LogRecord::new(&self.source, self.pid, message);
        append_record(&self.path, &record)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn test_append_creates_file_and_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("rotor.log");
        let writer = LogWriter::new(&path, "manager", 12);

        writer.append("started").unwrap();
        writer.append("ready").unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let records: Vec<_> = text.lines().filter_map(LogRecord::parse).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "started");
        assert_eq!(records[1].pid, 12);
        assert!(records[0].timestamp < records[1].timestamp);
    }

    #[test]
    fn test_concurrent_writers_never_split_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotor.log");

        let handles: Vec<_> = (0..4u32)
            .map(|n| {
                let writer = LogWriter::new(&path, "app", 100 + n);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        writer.append(&format!("line {i} {}", "x".repeat(200))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 200);
        assert!(text.lines().all(|line| LogRecord::parse(line).is_some()));
    }
}
