//! End-to-end tests for the `tangle` binary surface.

use assert_cmd::Command;
use predicates::prelude::*;

fn tangle() -> Command {
    Command::cargo_bin("tangle").expect("binary builds")
}

#[test]
fn help_shows_usage() {
    tangle()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("RESOLVER:NAME[@VERSION]"))
        .stdout(predicate::str::contains("--depth-limit"));
}

#[test]
fn list_without_target_enumerates_resolvers() {
    tangle()
        .arg("--list")
        .assert()
        .success()
        .stdout(predicate::str::contains("ubuntu"))
        .stdout(predicate::str::contains("cargo"))
        .stdout(predicate::str::contains("pip"));
}

#[test]
fn list_with_spec_marks_incompatible_resolvers() {
    tangle()
        .args(["--list", "pip:cvedb"])
        .assert()
        .success()
        .stdout(predicate::str::contains("incompatible with this package specifier"));
}

#[test]
fn unknown_resolver_is_a_user_error() {
    tangle()
        .args(["frobnicator:thing", "--database", ":memory:"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown resolver"));
}

#[test]
fn missing_target_is_a_user_error() {
    tangle().assert().failure().stderr(predicate::str::contains("TARGET"));
}

#[test]
fn unreadable_target_is_a_user_error() {
    let dir = tempfile::tempdir().unwrap();
    // an empty directory: no resolver can handle it
    tangle()
        .args([
            dir.path().to_str().unwrap(),
            "--database",
            ":memory:",
            "--quiet",
        ])
        .assert()
        .failure();
}

#[test]
fn refuses_to_overwrite_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.json");
    std::fs::write(&output, "{}").unwrap();
    tangle()
        .args([
            "pip:cvedb",
            "--database",
            ":memory:",
            "--output-file",
            output.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
}
