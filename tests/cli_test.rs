//! The `rotor` binary against daemons that are not running.
//!
//! # GIVEN / WHEN / THEN
//! Each test points the binary at a fresh deployment root and unused ports.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::indexing_slicing)]

use std::path::Path;
use std::process::{Command, Output};

use rotor_events::LogWriter;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn rotor(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rotor"))
        .args(args)
        .arg("--root")
        .arg(root)
        .env("ROTOR_MANAGER__PORT", free_port().to_string())
        .env("ROTOR_PROCESSOR__PORT", free_port().to_string())
        .env("ROTOR_STATUS__RETRIES", "0")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_status_reports_offline_daemons() {
    // Given: nothing is running
    let dir = tempfile::tempdir().unwrap();

    // When: status is requested
    let output = rotor(dir.path(), &["status"]);

    // Then: both daemons are reported as not running
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let text = stdout(&output);
    assert!(text.contains("manager: not running"), "{text}");
    assert!(text.contains("processor: not running"), "{text}");
}

#[test]
fn test_shutdown_with_nothing_running_succeeds() {
    let dir = tempfile::tempdir().unwrap();

    let output = rotor(dir.path(), &["shutdown"]);

    assert!(output.status.success());
    assert!(stdout(&output).contains("not running"));
}

#[test]
fn test_logs_prints_the_tail_of_the_shared_log() {
    // Given: a shared log with a few records from two writers
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("rotor.log");
    let manager = LogWriter::new(&log, "manager", 41);
    let processor = LogWriter::new(&log, "processor", 42);
    manager.append("control plane listening").unwrap();
    processor.append("deploy accepted").unwrap();
    manager.append("restarted").unwrap();

    // When: the last two records are requested
    let output = rotor(dir.path(), &["logs", "-n", "2"]);

    // Then: only those are printed, in file order
    assert!(output.status.success());
    let text = stdout(&output);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2, "{text}");
    assert!(lines[0].ends_with(" - processor - 42 - deploy accepted"));
    assert!(lines[1].ends_with(" - manager - 41 - restarted"));
}

#[test]
fn test_invalid_configuration_fails() {
    let dir = tempfile::tempdir().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_rotor"))
        .args(["status", "--root"])
        .arg(dir.path())
        .env("ROTOR_MANAGER__PORT", "not-a-port")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("manager.port"));
}
