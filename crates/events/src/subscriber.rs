//! Tracing integration.
//!
//! Every `tracing` event a rotor process emits is also appended to the shared
//! log as a [`LogRecord`](crate::record::LogRecord) line, which makes tracing
//! the producer side of the tail channel.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use rotor_core::{Error, Result};

use crate::record::LogRecord;
use crate::writer::open_append;

/// Formats events as single-line log records.
#[derive(Debug, Clone)]
pub struct RecordFormat {
    source: String,
    pid: u32,
}

impl RecordFormat {
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            pid: std::process::id(),
        }
    }
}

impl<S, N> FormatEvent<S, N> for RecordFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut message = String::new();
        let level = *event.metadata().level();
        if level != Level::INFO {
            message.push_str(level.as_str());
            message.push(' ');
        }
        ctx.field_format()
            .format_fields(format::Writer::new(&mut message), event)?;

        let record = LogRecord::new(&self.source, self.pid, &message);
        writeln!(writer, "{record}")
    }
}

/// Install the global subscriber: `RUST_LOG` filter (default `info`), a plain
/// stderr layer, and, when `log_path` is given, the shared-log record layer.
///
/// # Errors
///
/// Returns an error if the log file cannot be opened or a global subscriber
/// is already installed.
pub fn init(source: &str, log_path: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_path {
        Some(path) => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .event_format(RecordFormat::new(source))
                .with_writer(Mutex::new(open_append(path)?)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]
    #![allow(clippy::expect_used)]

    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture(emit: impl FnOnce()) -> Vec<LogRecord> {
        let buffer = Buffer::default();
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .event_format(RecordFormat::new("processor"))
                .with_writer(buffer.clone()),
        );
        tracing::subscriber::with_default(subscriber, emit);

        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| LogRecord::parse(line).expect("every line is a record"))
            .collect()
    }

    #[test]
    fn test_events_render_as_records_with_fields() {
        let records = capture(|| {
            tracing::info!(run_id = "01J", "pipeline started");
        });

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, "processor");
        assert_eq!(records[0].pid, std::process::id());
        assert!(records[0].message.contains("pipeline started"));
        assert!(records[0].message.contains("run_id=\"01J\""));
    }

    #[test]
    fn test_non_info_levels_are_prefixed() {
        let records = capture(|| {
            tracing::warn!("lease looks stale");
        });
        assert_eq!(records[0].message, "WARN lease looks stale");
    }

    #[test]
    fn test_multiline_messages_stay_on_one_line() {
        let records = capture(|| {
            tracing::info!("stderr:\nboom");
        });
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "stderr: boom");
    }
}
