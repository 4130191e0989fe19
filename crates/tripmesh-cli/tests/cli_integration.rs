//! CLI integration tests
//!
//! Offline command surface only; `serve` needs a radio and is not exercised
//! here.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn tripmesh(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tripmesh").unwrap();
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

#[test]
fn help_shows_about() {
    Command::cargo_bin("tripmesh")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("offline-first peer mesh sync"));
}

#[test]
fn info_on_fresh_store_shows_no_pending() {
    let dir = TempDir::new().unwrap();
    tripmesh(&dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pending:  0 mutation(s)"));
}

#[test]
fn expense_add_queues_a_mutation() {
    let dir = TempDir::new().unwrap();

    tripmesh(&dir)
        .args([
            "expense", "add", "g1", "Ferry tickets", "120", "m1", "--split", "m1:60", "--split",
            "m2:60",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 change(s) pending"));

    tripmesh(&dir)
        .args(["queue", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pending:   1"));

    tripmesh(&dir)
        .args(["expense", "list", "g1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Ferry tickets"))
        .stdout(predicate::str::contains("local/server"));
}

#[test]
fn queue_list_reports_empty_queue() {
    let dir = TempDir::new().unwrap();
    tripmesh(&dir)
        .args(["queue", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Queue is empty."));
}

#[test]
fn bad_split_is_rejected() {
    let dir = TempDir::new().unwrap();
    tripmesh(&dir)
        .args(["expense", "add", "g1", "Taxi", "45", "m1", "--split", "nonsense"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("MEMBER:AMOUNT"));
}
