#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use assert_cmd::Command;
use common::write_config;
use predicates::prelude::*;
use tempfile::tempdir;

fn awd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("awd"));
    cmd.env("HOME", home).env_remove("RUST_LOG");
    cmd
}

fn fresh_home(dir: &Path) -> PathBuf {
    let home = dir.join("home");
    fs::create_dir_all(&home).expect("failed to create home dir");
    home
}

#[test]
fn status_without_supervisor_says_so() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = fresh_home(temp.path());

    awd(&home)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("not running"));
}

#[test]
fn stop_without_supervisor_is_a_no_op() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = fresh_home(temp.path());

    awd(&home).args(["stop", "web"]).assert().success();
    awd(&home).arg("shutdown").assert().success();
}

#[test]
fn restart_without_supervisor_reports_a_control_error() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = fresh_home(temp.path());

    awd(&home)
        .args(["restart", "web"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("error[ControlError]"));
}

#[test]
fn reload_requires_a_name() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = fresh_home(temp.path());

    awd(&home).arg("reload").assert().failure();
    awd(&home).arg("explode").assert().failure();
}

#[test]
fn logs_prints_the_tail_of_an_app_log() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = fresh_home(temp.path());
    let config = write_config(
        temp.path(),
        "apps:\n  - name: web\n    script: ./web\n    out_file: out.log\n    error_file: err.log\n",
    );
    fs::write(temp.path().join("out.log"), "alpha\nbeta\ngamma\n").expect("write out log");
    fs::write(temp.path().join("err.log"), "boom\n").expect("write err log");

    awd(&home)
        .args(["logs", "web", "-n", "2", "-c"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("beta\ngamma\n"))
        .stdout(predicate::str::contains("alpha").not());

    awd(&home)
        .args(["logs", "web", "-k", "stderr", "-c"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("boom"));
}

#[test]
fn logs_for_an_unknown_app_is_not_found() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = fresh_home(temp.path());
    let config = write_config(
        temp.path(),
        "apps:\n  - name: web\n    script: ./web\n",
    );

    awd(&home)
        .args(["logs", "api", "-c"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("error[NotFound]"));
}

#[test]
fn start_with_a_missing_config_is_a_config_error() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = fresh_home(temp.path());

    awd(&home)
        .args(["start", "-c"])
        .arg(temp.path().join("missing.yaml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("error[ConfigError]"));
}

#[cfg(target_os = "linux")]
#[test]
fn daemonized_supervisor_round_trip() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = fresh_home(temp.path());
    let config = write_config(
        temp.path(),
        r#"apps:
  - name: web
    script: sleep
    args: "30"
    listen_timeout: 0
    out_file: out.log
    error_file: err.log
"#,
    );
    let socket = home.join(".local/share/appwarden/control.sock");

    awd(&home)
        .args(["start", "--daemonize", "-c"])
        .arg(&config)
        .assert()
        .success();
    common::wait_for_path(&socket);

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let output = awd(&home)
            .args(["status", "--json"])
            .output()
            .expect("status runs");
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("\"state\": \"running\"") {
            assert!(stdout.contains("\"name\": \"web\""));
            break;
        }
        assert!(Instant::now() < deadline, "web never reported running: {stdout}");
        thread::sleep(Duration::from_millis(100));
    }

    awd(&home)
        .args(["status", "--no-color"])
        .assert()
        .success()
        .stdout(predicate::str::contains("web").and(predicate::str::contains("running")));

    awd(&home)
        .args(["stop", "web"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stopped 'web'"));

    awd(&home)
        .args(["restart", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error[NotFound]"));

    awd(&home).arg("shutdown").assert().success();

    let deadline = Instant::now() + Duration::from_secs(10);
    while socket.exists() {
        assert!(Instant::now() < deadline, "supervisor never cleaned up its socket");
        thread::sleep(Duration::from_millis(100));
    }
}
