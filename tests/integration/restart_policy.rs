#[path = "common/mod.rs"]
mod common;

use std::{fs, sync::Arc, thread, time::Duration};

use appwarden::{
    error::ErrorKind,
    metrics::{MemorySampler, ScriptedSampler},
    supervisor::{AppState, SamplerFactory, SupervisorOptions},
};
use common::{status_of, surface, surface_with, wait_for_state, wait_for_status};
use tempfile::tempdir;

const TIMEOUT: Duration = Duration::from_secs(10);

fn scripted_memory(readings: Vec<u64>) -> SupervisorOptions {
    let sampler: SamplerFactory =
        Arc::new(move || Box::new(ScriptedSampler::new(readings.clone())) as Box<dyn MemorySampler>);
    SupervisorOptions {
        memory_sample_interval: Duration::from_millis(50),
        sampler,
    }
}

#[test]
fn crash_loop_stops_after_max_restarts() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = surface(
        temp.path(),
        r#"apps:
  - name: crasher
    script: sh
    args: ["-c", "exit 3"]
    listen_timeout: 0
    min_uptime: 5s
    max_restarts: 2
    out_file: out.log
    error_file: err.log
"#,
    );

    surface.start(Some("crasher"), None).expect("start should succeed");
    let status = wait_for_status(&surface, "crasher", TIMEOUT, |s| {
        s.state == AppState::Stopped && s.last_error.is_some()
    });

    assert_eq!(status.restarts, 2);
    assert_eq!(status.unstable_restarts, 3);
    assert_eq!(status.last_exit.and_then(|exit| exit.code), Some(3));
    assert_eq!(
        status.last_error.map(|report| report.kind),
        Some(ErrorKind::CrashLoopError)
    );
    assert!(status.pid.is_none());

    // Terminal until someone starts it again.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(status_of(&surface, "crasher").restarts, 2);
}

#[test]
fn a_stable_run_resets_the_unstable_counter() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = surface(
        temp.path(),
        r#"apps:
  - name: flaky
    script: sh
    args:
      - -c
      - |
        n=$(cat count 2>/dev/null || echo 0)
        n=$((n + 1))
        echo $n > count
        case $n in
          3) sleep 1; exit 1 ;;
          6) exec sleep 30 ;;
          *) exit 1 ;;
        esac
    listen_timeout: 0
    min_uptime: 500ms
    max_restarts: 2
    out_file: out.log
    error_file: err.log
"#,
    );

    surface.start(Some("flaky"), None).expect("start should succeed");
    let status = wait_for_status(&surface, "flaky", TIMEOUT, |s| {
        s.restarts == 5 && s.state == AppState::Running
    });

    assert_eq!(status.unstable_restarts, 2);
    assert!(status.last_error.is_none());
    assert_eq!(
        fs::read_to_string(temp.path().join("count")).unwrap().trim(),
        "6"
    );

    surface.shutdown().expect("shutdown should succeed");
}

#[test]
fn stop_during_backoff_cancels_the_pending_restart() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = surface(
        temp.path(),
        r#"apps:
  - name: slowpoke
    script: sh
    args: ["-c", "exit 1"]
    listen_timeout: 0
    restart_delay: 1500
    out_file: out.log
    error_file: err.log
"#,
    );

    surface.start(Some("slowpoke"), None).expect("start should succeed");
    wait_for_state(&surface, "slowpoke", AppState::RestartBackoff, TIMEOUT);

    surface.stop(Some("slowpoke")).expect("stop should succeed");
    assert_eq!(status_of(&surface, "slowpoke").state, AppState::Stopped);

    thread::sleep(Duration::from_secs(2));
    let status = status_of(&surface, "slowpoke");
    assert_eq!(status.state, AppState::Stopped);
    assert_eq!(status.restarts, 0);
    assert!(status.pid.is_none());
}

#[test]
fn backoff_delays_the_respawn() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = surface(
        temp.path(),
        r#"apps:
  - name: delayed
    script: sh
    args: ["-c", "[ -f marker ] && exec sleep 30; touch marker; exit 1"]
    listen_timeout: 0
    restart_delay: 300ms
    out_file: out.log
    error_file: err.log
"#,
    );

    surface.start(Some("delayed"), None).expect("start should succeed");
    wait_for_state(&surface, "delayed", AppState::RestartBackoff, TIMEOUT);
    let status = wait_for_state(&surface, "delayed", AppState::Running, TIMEOUT);
    assert_eq!(status.restarts, 1);

    surface.shutdown().expect("shutdown should succeed");
}

#[test]
fn autorestart_disabled_leaves_the_app_stopped() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = surface(
        temp.path(),
        r#"apps:
  - name: oneshot
    script: sh
    args: ["-c", "exit 0"]
    listen_timeout: 0
    autorestart: false
    out_file: out.log
    error_file: err.log
"#,
    );

    surface.start(Some("oneshot"), None).expect("start should succeed");
    let status = wait_for_status(&surface, "oneshot", TIMEOUT, |s| {
        s.state == AppState::Stopped && s.last_exit.is_some()
    });
    assert_eq!(status.restarts, 0);
    assert_eq!(status.last_exit.and_then(|exit| exit.code), Some(0));
    assert!(status.last_error.is_none());
}

#[test]
fn memory_restarts_never_count_as_crashes() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = surface_with(
        temp.path(),
        r#"apps:
  - name: hog
    script: sleep
    args: "30"
    listen_timeout: 0
    max_memory_restart: 1M
    min_uptime: 5s
    max_restarts: 0
    out_file: out.log
    error_file: err.log
"#,
        scripted_memory(vec![u64::MAX]),
    );

    surface.start(Some("hog"), None).expect("start should succeed");
    let status = wait_for_status(&surface, "hog", TIMEOUT, |s| s.restarts >= 5);

    assert_eq!(status.unstable_restarts, 0);
    assert!(
        status
            .last_error
            .as_ref()
            .is_none_or(|report| report.kind != ErrorKind::CrashLoopError),
        "memory restarts tripped the crash loop guard: {status:?}"
    );

    surface.shutdown().expect("shutdown should succeed");
}

#[test]
fn memory_below_the_limit_is_only_reported() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = surface_with(
        temp.path(),
        r#"apps:
  - name: lean
    script: sleep
    args: "30"
    listen_timeout: 0
    max_memory_restart: 1G
    out_file: out.log
    error_file: err.log
"#,
        scripted_memory(vec![4096]),
    );

    surface.start(Some("lean"), None).expect("start should succeed");
    let status = wait_for_status(&surface, "lean", TIMEOUT, |s| s.memory_bytes.is_some());
    assert_eq!(status.memory_bytes, Some(4096));

    thread::sleep(Duration::from_millis(300));
    let status = status_of(&surface, "lean");
    assert_eq!(status.state, AppState::Running);
    assert_eq!(status.restarts, 0);

    surface.shutdown().expect("shutdown should succeed");
}

#[test]
fn explicit_start_clears_a_crash_loop() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = surface(
        temp.path(),
        r#"apps:
  - name: crasher
    script: sh
    args: ["-c", "exit 1"]
    listen_timeout: 0
    min_uptime: 5s
    max_restarts: 0
    out_file: out.log
    error_file: err.log
"#,
    );

    surface.start(Some("crasher"), None).expect("start should succeed");
    let first = wait_for_status(&surface, "crasher", TIMEOUT, |s| {
        s.state == AppState::Stopped && s.unstable_restarts == 1
    });
    let first_exit = first.last_exit.map(|exit| exit.at);

    surface.start(Some("crasher"), None).expect("second start should succeed");
    let status = wait_for_status(&surface, "crasher", TIMEOUT, |s| {
        s.state == AppState::Stopped && s.last_exit.map(|exit| exit.at) != first_exit
    });
    assert_eq!(status.unstable_restarts, 1);
    assert_eq!(status.restarts, 0);
}

#[test]
fn cron_restarts_run_on_schedule_without_counting_as_crashes() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = surface(
        temp.path(),
        r#"apps:
  - name: nightly
    script: sleep
    args: "30"
    listen_timeout: 0
    cron_restart: "*/1 * * * * *"
    min_uptime: 5s
    max_restarts: 0
    out_file: out.log
    error_file: err.log
"#,
    );

    // Ticks before the first start find nothing to restart.
    thread::sleep(Duration::from_millis(1200));
    assert_eq!(status_of(&surface, "nightly").restarts, 0);

    surface.start(Some("nightly"), None).expect("start should succeed");
    let status = wait_for_status(&surface, "nightly", TIMEOUT, |s| {
        s.restarts >= 2 && s.state == AppState::Running
    });
    assert_eq!(status.unstable_restarts, 0);
    assert!(status.last_error.is_none(), "unexpected error: {status:?}");

    surface.stop(Some("nightly")).expect("stop should succeed");
    let stopped = status_of(&surface, "nightly");
    assert_eq!(stopped.state, AppState::Stopped);

    thread::sleep(Duration::from_millis(2500));
    let later = status_of(&surface, "nightly");
    assert_eq!(later.state, AppState::Stopped);
    assert_eq!(later.restarts, stopped.restarts);
    assert!(later.pid.is_none());
}
