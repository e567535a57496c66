#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Duration};

use appwarden::{error::ErrorKind, supervisor::AppState};
use common::{status_of, surface, wait_for_lines, wait_for_state};
use tempfile::tempdir;

#[test]
fn streams_are_routed_to_their_files() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = surface(
        temp.path(),
        r#"apps:
  - name: chatty
    script: sh
    args: ["-c", "echo to-out; echo to-err >&2; sleep 30"]
    listen_timeout: 0
    out_file: logs/out.log
    error_file: logs/err.log
"#,
    );

    surface.start(Some("chatty"), None).expect("start should succeed");

    let out = wait_for_lines(&temp.path().join("logs/out.log"), 1);
    let err = wait_for_lines(&temp.path().join("logs/err.log"), 1);
    assert_eq!(out, ["to-out"]);
    assert_eq!(err, ["to-err"]);

    surface.shutdown().expect("shutdown should succeed");
}

#[test]
fn lines_get_a_time_prefix_when_enabled() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = surface(
        temp.path(),
        r#"apps:
  - name: stamped
    script: sh
    args: ["-c", "echo hello; sleep 30"]
    listen_timeout: 0
    time: true
    log_date_format: "YYYY-MM-DD"
    out_file: out.log
    error_file: err.log
"#,
    );

    surface.start(Some("stamped"), None).expect("start should succeed");
    let lines = wait_for_lines(&temp.path().join("out.log"), 1);
    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    assert_eq!(lines[0], format!("{today}: hello"));

    surface.shutdown().expect("shutdown should succeed");
}

#[test]
fn merged_instances_share_one_combined_file() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = surface(
        temp.path(),
        r#"apps:
  - name: pair
    script: sh
    args: ["-c", "echo out-$APP_INSTANCE; echo err-$APP_INSTANCE >&2; sleep 30"]
    instances: 2
    listen_timeout: 0
    merge_logs: true
    log_file: all.log
    out_file: out.log
    error_file: err.log
"#,
    );

    surface.start(Some("pair"), None).expect("start should succeed");

    let mut combined = wait_for_lines(&temp.path().join("all.log"), 4);
    combined.sort();
    assert_eq!(combined, ["err-0", "err-1", "out-0", "out-1"]);

    let mut out = wait_for_lines(&temp.path().join("out.log"), 2);
    out.sort();
    assert_eq!(out, ["out-0", "out-1"]);
    assert!(!temp.path().join("out-0.log").exists());

    surface.shutdown().expect("shutdown should succeed");
}

#[test]
fn unmerged_instances_get_indexed_files() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = surface(
        temp.path(),
        r#"apps:
  - name: pair
    script: sh
    args: ["-c", "echo from-$APP_INSTANCE; sleep 30"]
    instances: 2
    listen_timeout: 0
    out_file: out.log
    error_file: err.log
"#,
    );

    surface.start(Some("pair"), None).expect("start should succeed");
    assert_eq!(wait_for_lines(&temp.path().join("out-0.log"), 1), ["from-0"]);
    assert_eq!(wait_for_lines(&temp.path().join("out-1.log"), 1), ["from-1"]);

    surface.shutdown().expect("shutdown should succeed");
}

#[test]
fn unwritable_log_path_does_not_stop_the_app() {
    let temp = tempdir().expect("failed to create tempdir");
    fs::write(temp.path().join("blocked"), "not a directory").expect("write blocker");
    let surface = surface(
        temp.path(),
        r#"apps:
  - name: resilient
    script: sleep
    args: "30"
    listen_timeout: 0
    out_file: blocked/out.log
    error_file: err.log
"#,
    );

    surface.start(Some("resilient"), None).expect("start should succeed");
    let status = wait_for_state(&surface, "resilient", AppState::Running, Duration::from_secs(5));
    assert_eq!(
        status.last_error.map(|report| report.kind),
        Some(ErrorKind::IOError)
    );
    assert!(status_of(&surface, "resilient").pid.is_some());

    surface.shutdown().expect("shutdown should succeed");
}

#[test]
fn restarts_append_to_existing_logs() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = surface(
        temp.path(),
        r#"apps:
  - name: appender
    script: sh
    args: ["-c", "echo run; sleep 30"]
    listen_timeout: 0
    out_file: out.log
    error_file: err.log
"#,
    );

    surface.start(Some("appender"), None).expect("start should succeed");
    wait_for_lines(&temp.path().join("out.log"), 1);
    surface.restart(Some("appender")).expect("restart should succeed");
    assert_eq!(wait_for_lines(&temp.path().join("out.log"), 2), ["run", "run"]);

    surface.shutdown().expect("shutdown should succeed");
}
