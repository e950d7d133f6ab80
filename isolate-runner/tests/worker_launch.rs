// Copyright (c) The isolate-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Launcher behavior against real child processes.

#![cfg(unix)]

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use indoc::indoc;
use isolate_runner::{
    crash::WorkerExit,
    errors::WorkerStartError,
    host::{SourceLocation, TestId, TestItem},
    launcher::WorkerCommand,
    plan::{GroupKey, TestGroup},
    records::read_records,
};
use std::{fs, os::unix::fs::PermissionsExt, time::Duration};

fn fixture_script(dir: &Utf8Path, name: &str, contents: &str) -> Utf8PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("script is writable");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("script is executable");
    path
}

fn group(ids: &[&str], timeout: Duration) -> TestGroup {
    TestGroup {
        key: GroupKey::new("fixtures"),
        items: ids
            .iter()
            .map(|id| TestItem::new(*id, SourceLocation::default()))
            .collect(),
        timeout,
    }
}

#[tokio::test]
async fn worker_records_phases_and_stdout_is_captured() {
    let dir = Utf8TempDir::new().expect("temp dir is creatable");
    let script = fixture_script(
        dir.path(),
        "report.sh",
        indoc! {r#"
            #!/bin/sh
            rp="$ISOLATE_RUNNER_REPORT_PATH"
            printf '{"nodeid":"fixture.rs::alpha","when":"setup","outcome":"passed"}\n' >> "$rp"
            printf '{"nodeid":"fixture.rs::alpha","when":"call","outcome":"passed"}\n' >> "$rp"
            printf '{"nodeid":"fixture.rs::alpha","when":"teardown","outcome":"passed"}\n' >> "$rp"
            echo worker-stdout
            echo worker-stderr >&2
            exit 0
        "#},
    );
    let report_path = dir.path().join("records.jsonl");

    let command = WorkerCommand::new(script, &[], dir.path().to_path_buf());
    let group = group(&["fixture.rs::alpha"], Duration::from_secs(30));
    let outcome = command
        .run(&group, &report_path)
        .await
        .expect("worker spawns");

    assert_eq!(outcome.exit, WorkerExit::Code(0));
    assert!(!outcome.timed_out);
    assert_eq!(
        String::from_utf8_lossy(&outcome.stdout).trim(),
        "worker-stdout"
    );
    assert_eq!(
        String::from_utf8_lossy(&outcome.stderr).trim(),
        "worker-stderr"
    );

    let results = read_records(&report_path);
    let phases = results
        .phases(&TestId::new("fixture.rs::alpha"))
        .expect("recorded test is present");
    assert_eq!(phases.len(), 3);
    assert!(
        !report_path.as_std_path().exists(),
        "side-channel file is deleted after reading"
    );
}

#[tokio::test]
async fn aborted_worker_is_classified_as_a_signal() {
    let dir = Utf8TempDir::new().expect("temp dir is creatable");
    let script = fixture_script(
        dir.path(),
        "abort.sh",
        indoc! {r#"
            #!/bin/sh
            kill -9 $$
        "#},
    );
    let report_path = dir.path().join("records.jsonl");

    let command = WorkerCommand::new(script, &[], dir.path().to_path_buf());
    let group = group(&["fixture.rs::alpha"], Duration::from_secs(30));
    let outcome = command
        .run(&group, &report_path)
        .await
        .expect("worker spawns");

    assert_eq!(outcome.exit, WorkerExit::Signal(9));
    assert!(outcome.exit.is_abort());
    assert!(!outcome.timed_out);
}

#[tokio::test]
async fn nonzero_exit_code_is_reported() {
    let dir = Utf8TempDir::new().expect("temp dir is creatable");
    let script = fixture_script(
        dir.path(),
        "fail.sh",
        indoc! {r#"
            #!/bin/sh
            exit 3
        "#},
    );
    let report_path = dir.path().join("records.jsonl");

    let command = WorkerCommand::new(script, &[], dir.path().to_path_buf());
    let group = group(&["fixture.rs::alpha"], Duration::from_secs(30));
    let outcome = command
        .run(&group, &report_path)
        .await
        .expect("worker spawns");

    assert_eq!(outcome.exit, WorkerExit::Code(3));
    assert!(!outcome.exit.is_abort());
}

#[tokio::test]
async fn timed_out_worker_is_killed() {
    let dir = Utf8TempDir::new().expect("temp dir is creatable");
    let script = fixture_script(
        dir.path(),
        "hang.sh",
        indoc! {r#"
            #!/bin/sh
            echo partial-output
            sleep 30
        "#},
    );
    let report_path = dir.path().join("records.jsonl");

    let command = WorkerCommand::new(script, &[], dir.path().to_path_buf());
    let group = group(&["fixture.rs::alpha"], Duration::from_secs(1));
    let outcome = command
        .run(&group, &report_path)
        .await
        .expect("worker spawns");

    assert!(outcome.timed_out);
    // Output captured before the kill is still available for forwarding.
    assert_eq!(
        String::from_utf8_lossy(&outcome.stdout).trim(),
        "partial-output"
    );
    assert!(
        outcome.elapsed < Duration::from_secs(10),
        "the worker was killed at the timeout, not at script completion \
         (elapsed: {:?})",
        outcome.elapsed,
    );
}

#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let dir = Utf8TempDir::new().expect("temp dir is creatable");
    let report_path = dir.path().join("records.jsonl");

    let command = WorkerCommand::new(dir.path().join("does-not-exist"), &[], dir.path().to_path_buf());
    let group = group(&["fixture.rs::alpha"], Duration::from_secs(30));
    let error = command
        .run(&group, &report_path)
        .await
        .expect_err("spawn fails");

    assert!(matches!(error, WorkerStartError::Spawn { .. }));
}
