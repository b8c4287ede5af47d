//! CLI Integration Tests
//!
//! These tests run the `pincal` binary end-to-end against temporary data
//! and log directories.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

const DOCUMENT_ID: &str = "2VfUX8qdQLzDNUEPp6eFR9";

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pincal").expect("Failed to find pincal binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

/// Run a short demo and return its stdout
fn run_demo(data_dir: &TempDir, extra: &[&str]) -> String {
    let output = cli_cmd(data_dir)
        .args(["demo", "--tabs", "2", "--duration", "1", "--poll-interval-ms", "100"])
        .args(extra)
        .output()
        .expect("Failed to run demo");
    assert!(
        output.status.success(),
        "demo failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("stdout is not UTF-8")
}

/// Extract the value after `prefix` from CLI output
fn extract(output: &str, prefix: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim_start().strip_prefix(prefix))
        .map(|value| value.trim().to_string())
}

// ============================================================================
// Invite Command Tests
// ============================================================================

#[test]
fn test_invite_encode() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["invite", "encode", DOCUMENT_ID, "laptop-1"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("#action=addPeer&documentId="))
        .stdout(predicate::str::contains("peerConnectionId=laptop-1"));
}

#[test]
fn test_invite_decode_roundtrip() {
    let data_dir = TempDir::new().unwrap();

    let output = cli_cmd(&data_dir)
        .args(["invite", "encode", DOCUMENT_ID, "phone"])
        .output()
        .unwrap();
    let link = String::from_utf8(output.stdout).unwrap();

    cli_cmd(&data_dir)
        .args(["invite", "decode", link.trim()])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Document: {}", DOCUMENT_ID)))
        .stdout(predicate::str::contains("Peer: phone"));
}

#[test]
fn test_invite_decode_rejects_unknown_action() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["invite", "decode", "#action=removePeer&documentId=x&peerConnectionId=y"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid invitation"));
}

#[test]
fn test_invite_encode_rejects_bad_document_id() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["invite", "encode", "not-base58!", "phone"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid document ID"));
}

// ============================================================================
// Documents Command Tests
// ============================================================================

#[test]
fn test_documents_list_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["documents", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No documents found."));
}

// ============================================================================
// Demo Command Tests
// ============================================================================

#[test]
fn test_demo_elects_one_owner() {
    let data_dir = TempDir::new().unwrap();
    let output = run_demo(&data_dir, &[]);

    assert!(output.contains("Tabs loaded: 2"), "{}", output);
    assert!(output.contains("Invitation: #action=addPeer"), "{}", output);
    assert!(output.contains("Final owner: tab-"), "{}", output);
}

#[test]
fn test_demo_persists_local_and_shared_documents() {
    let data_dir = TempDir::new().unwrap();
    let output = run_demo(&data_dir, &[]);
    let local = extract(&output, "Local document: ").unwrap();
    let shared = extract(&output, "Shared document: ").unwrap();

    cli_cmd(&data_dir)
        .args(["documents", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Documents (2):"))
        .stdout(predicate::str::contains(local.as_str()))
        .stdout(predicate::str::contains(shared.as_str()));
}

#[test]
fn test_demo_reopens_stored_calendar() {
    let data_dir = TempDir::new().unwrap();
    let first = run_demo(&data_dir, &[]);
    let calendar = extract(&first, "Calendar: ").unwrap();
    let local = extract(&first, "Local document: ").unwrap();
    let shared = extract(&first, "Shared document: ").unwrap();

    let second = run_demo(
        &data_dir,
        &["--calendar", &calendar, "--local-document", &local],
    );
    assert_eq!(extract(&second, "Shared document: ").unwrap(), shared);
}

#[test]
fn test_demo_in_memory_leaves_store_empty() {
    let data_dir = TempDir::new().unwrap();
    run_demo(&data_dir, &["--in-memory"]);

    cli_cmd(&data_dir)
        .args(["documents", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No documents found."));
}

#[test]
fn test_demo_rejects_unknown_local_document() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["demo", "--tabs", "1", "--duration", "0"])
        .args(["--local-document", DOCUMENT_ID])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load tab-0"));
}

// ============================================================================
// Logs Command Tests
// ============================================================================

#[test]
fn test_logs_show_filters_by_calendar() {
    let data_dir = TempDir::new().unwrap();
    let log_dir = TempDir::new().unwrap();
    let log_arg = log_dir.path().to_str().unwrap();

    let output = run_demo(&data_dir, &["-v", "--log-dir", log_arg]);
    let calendar = extract(&output, "Calendar: ").unwrap();

    cli_cmd(&data_dir)
        .args(["logs", "show", "--log-dir", log_arg, "--calendar", &calendar])
        .assert()
        .success()
        .stdout(predicate::str::contains("Creating shared repo session"))
        .stdout(predicate::str::contains("Elected WebRTC owner"));

    cli_cmd(&data_dir)
        .args(["logs", "show", "--log-dir", log_arg, "--calendar", "01ARZ3NDEKTSV4RRFFQ69G5FAV"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No log entries found."));
}
