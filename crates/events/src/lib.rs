//! Log-tail event channel.
//!
//! Every rotor process appends single-line records to one shared log; any
//! other process can tail it. This is how a short-lived CLI observes a
//! daemon it spawned detached. Key pieces:
//!
//! - **Records**: `<timestamp> - <source> - <pid> - <message>` lines
//! - **Writer**: append-only, one write per line
//! - **Tail**: bounded trailing window plus a timestamp cursor
//! - **Watch**: bounded waits for a new writer or any update
//! - **Subscriber**: routes `tracing` events into the log
//!
//! # Example
//!
//! ```ignore
//! use rotor_events::{LogWriter, TailCursor, TailReader};
//!
//! let writer = LogWriter::for_current_process("rotor.log", "cli");
//! let mut cursor = TailCursor::from_now(TailReader::new("rotor.log", 64 * 1024))?;
//! writer.append("deploy requested")?;
//! for record in cursor.poll()? {
//!     println!("{record}");
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod record;
pub mod subscriber;
pub mod tail;
pub mod watch;
pub mod writer;

pub use record::{LogRecord, format_stamp, next_stamp};
pub use tail::{TailCursor, TailReader};
pub use watch::{POLL_INTERVAL, WaitOptions, follow_until, wait_for_child_start, wait_for_update};
pub use writer::{LogWriter, append_record, open_append};
