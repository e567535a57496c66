#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use appwarden::{
    control::ControlSurface,
    daemon::{Daemon, DaemonError},
    error::ErrorKind,
    ipc::{self, ControlCommand, ControlError, ControlResponse},
    supervisor::{AppState, SupervisorOptions},
};
use common::{
    HomeEnvGuard, status_of, surface, wait_for_lines, wait_for_path, wait_for_state, write_config,
};
use tempfile::tempdir;

const TIMEOUT: Duration = Duration::from_secs(10);

fn greeter(greeting: &str, instances: usize) -> String {
    format!(
        r#"apps:
  - name: api
    script: sh
    args: ["-c", "echo $GREETING > greeting-$APP_INSTANCE.txt; exec sleep 30"]
    instances: {instances}
    listen_timeout: 0
    env:
      GREETING: {greeting}
    env_production:
      GREETING: production-{greeting}
    out_file: out.log
    error_file: err.log
"#
    )
}

fn wait_for_content(path: &Path, expected: &str) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let content = fs::read_to_string(path).unwrap_or_default();
        if content.trim() == expected {
            return;
        }
        if Instant::now() >= deadline {
            panic!("Timed out waiting for {path:?} to read {expected:?}; got {content:?}");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn load(path: &Path) -> ControlSurface {
    ControlSurface::load(Some(path), None, SupervisorOptions::default())
        .expect("config should load")
}

#[test]
fn reload_picks_up_config_changes_and_scales() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(temp.path(), &greeter("hello", 1));
    let surface = load(&config);

    surface.start(None, None).expect("start should succeed");
    wait_for_content(&temp.path().join("greeting-0.txt"), "hello");

    write_config(temp.path(), &greeter("bye", 2));
    surface.reload("api", None).expect("reload should succeed");

    let statuses = surface.status(Some("api")).expect("status should succeed");
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| s.state == AppState::Running));
    assert_eq!(statuses[0].restarts, 1);
    assert_eq!(statuses[1].restarts, 0);
    wait_for_content(&temp.path().join("greeting-0.txt"), "bye");
    wait_for_content(&temp.path().join("greeting-1.txt"), "bye");

    let retired = statuses[1].pid.expect("second instance runs");
    write_config(temp.path(), &greeter("bye", 1));
    surface.reload("api", None).expect("reload should succeed");

    let statuses = surface.status(Some("api")).expect("status should succeed");
    assert_eq!(statuses.len(), 1);
    #[cfg(target_os = "linux")]
    common::wait_for_process_exit(retired);
    assert!(matches!(
        surface.status(Some("api:1")),
        Err(err) if err.kind() == ErrorKind::NotFound
    ));

    surface.shutdown().expect("shutdown should succeed");
}

#[test]
fn reloading_one_instance_leaves_its_siblings_alone() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(temp.path(), &greeter("hello", 2));
    let surface = load(&config);

    surface.start(Some("api"), None).expect("start should succeed");
    wait_for_content(&temp.path().join("greeting-1.txt"), "hello");
    let sibling = status_of(&surface, "api:1").pid;

    surface
        .reload("api:0", Some("production"))
        .expect("reload should succeed");
    wait_for_content(&temp.path().join("greeting-0.txt"), "production-hello");

    let untouched = status_of(&surface, "api:1");
    assert_eq!(untouched.pid, sibling);
    assert_eq!(untouched.restarts, 0);
    assert_eq!(status_of(&surface, "api:0").restarts, 1);

    surface.shutdown().expect("shutdown should succeed");
}

#[test]
fn reload_rejects_a_broken_config_and_keeps_running() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(temp.path(), &greeter("hello", 1));
    let surface = load(&config);

    surface.start(None, None).expect("start should succeed");
    let before = status_of(&surface, "api").pid;

    write_config(
        temp.path(),
        "apps:\n  - name: api\n    instances: 1\n    out_file: out.log\n",
    );
    let err = surface.reload("api", None).expect_err("missing script is rejected");
    assert_eq!(err.kind(), ErrorKind::ConfigError);

    let status = status_of(&surface, "api");
    assert_eq!(status.state, AppState::Running);
    assert_eq!(status.pid, before);

    let err = surface.reload("ghost", None).expect_err("unknown app");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    surface.shutdown().expect("shutdown should succeed");
}

#[test]
fn rejected_apps_do_not_block_the_rest() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(
        temp.path(),
        r#"apps:
  - name: broken
    script: ./broken
    instances: many
  - name: fine
    script: sleep
    args: "30"
    listen_timeout: 0
    out_file: out.log
    error_file: err.log
"#,
    );
    let surface = load(&config);

    let err = surface.start(Some("broken"), None).expect_err("broken is rejected");
    assert_eq!(err.kind(), ErrorKind::ConfigError);
    surface.start(Some("fine"), None).expect("fine starts");

    let statuses = surface.status(None).expect("status should succeed");
    let broken = statuses.iter().find(|s| s.app == "broken").expect("listed");
    assert_eq!(broken.state, AppState::Errored);
    assert_eq!(
        broken.last_error.as_ref().map(|report| report.kind),
        Some(ErrorKind::ConfigError)
    );
    let fine = statuses.iter().find(|s| s.app == "fine").expect("listed");
    assert_eq!(fine.state, AppState::Running);

    surface.shutdown().expect("shutdown should succeed");
}

#[test]
fn daemon_serves_commands_over_the_socket() {
    let temp = tempdir().expect("failed to create tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).expect("create home");
    let _home = HomeEnvGuard::set(&home);

    let config = write_config(
        temp.path(),
        r#"apps:
  - name: sleeper
    script: sleep
    args: "30"
    listen_timeout: 0
    out_file: out.log
    error_file: err.log
"#,
    );

    let daemon = Daemon::new(Some(&config), None, SupervisorOptions::default())
        .expect("daemon should start");
    assert!(matches!(
        Daemon::new(Some(&config), None, SupervisorOptions::default()),
        Err(DaemonError::Control(ControlError::AlreadyRunning))
    ));
    assert_eq!(
        ipc::read_supervisor_pid().expect("pid file readable"),
        Some(std::process::id() as i32)
    );

    let server = thread::spawn(move || daemon.run(None));
    wait_for_path(&ipc::socket_path().expect("socket path"));

    match ipc::send_command(&ControlCommand::Status { name: None }).expect("status") {
        ControlResponse::Status(statuses) => {
            assert_eq!(statuses.len(), 1);
            assert_eq!(statuses[0].name, "sleeper");
            assert_eq!(statuses[0].state, AppState::Running);
        }
        other => panic!("unexpected response {other:?}"),
    }

    let stopped = ipc::send_command(&ControlCommand::Stop {
        name: Some("sleeper".into()),
    })
    .expect("stop");
    assert_eq!(stopped, ControlResponse::Message("Stopped 'sleeper'".into()));

    match ipc::send_command(&ControlCommand::Restart {
        name: Some("ghost".into()),
    }) {
        Err(ControlError::Server(report)) => assert_eq!(report.kind, ErrorKind::NotFound),
        other => panic!("unexpected response {other:?}"),
    }

    let done = ipc::send_command(&ControlCommand::Shutdown).expect("shutdown");
    assert_eq!(done, ControlResponse::Ok);
    server
        .join()
        .expect("server thread panicked")
        .expect("daemon exits cleanly");

    assert!(!ipc::socket_path().expect("socket path").exists());
    assert_eq!(ipc::read_supervisor_pid().expect("pid file readable"), None);
}

#[test]
fn surface_status_reflects_stop() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(temp.path(), &greeter("hello", 1));
    let surface = load(&config);

    surface.start(None, None).expect("start should succeed");
    wait_for_state(&surface, "api", AppState::Running, TIMEOUT);
    surface.stop(None).expect("stop should succeed");
    assert_eq!(status_of(&surface, "api").state, AppState::Stopped);
}

#[test]
fn slow_stop_does_not_block_status_of_other_apps() {
    let temp = tempdir().expect("failed to create tempdir");
    let surface = Arc::new(surface(
        temp.path(),
        r#"apps:
  - name: stubborn
    script: sh
    args: ["-c", "trap '' TERM; echo ready; while true; do sleep 0.1; done"]
    listen_timeout: 0
    kill_timeout: 3000
    out_file: stubborn.log
    error_file: stubborn-err.log
  - name: other
    script: sleep
    args: "30"
    listen_timeout: 0
    out_file: out.log
    error_file: err.log
"#,
    ));

    surface.start(None, None).expect("start should succeed");
    wait_for_lines(&temp.path().join("stubborn.log"), 1);

    let reloading = {
        let surface = Arc::clone(&surface);
        thread::spawn(move || surface.reload("stubborn", None))
    };
    thread::sleep(Duration::from_millis(300));

    let began = Instant::now();
    let other = status_of(&surface, "other");
    let everything = surface.status(None).expect("status should succeed");
    let waited = began.elapsed();
    assert!(waited < Duration::from_millis(500), "status waited {waited:?}");
    assert_eq!(other.state, AppState::Running);
    assert_eq!(everything.len(), 2);
    assert_eq!(status_of(&surface, "stubborn").state, AppState::Stopping);

    let began = Instant::now();
    surface.restart(Some("other")).expect("restart should succeed");
    assert!(began.elapsed() < Duration::from_secs(2));

    reloading
        .join()
        .expect("reload thread panicked")
        .expect("reload should succeed");
    assert_eq!(status_of(&surface, "stubborn").restarts, 1);

    surface.shutdown().expect("shutdown should succeed");
}

#[test]
fn reload_brings_up_an_app_rejected_at_load() {
    let temp = tempdir().expect("failed to create tempdir");
    let with_limit = |limit: &str| {
        format!(
            r#"apps:
  - name: late
    script: sleep
    args: "30"
    listen_timeout: 0
    max_memory_restart: {limit}
    out_file: out.log
    error_file: err.log
"#
        )
    };
    let config = write_config(temp.path(), &with_limit("lots"));
    let surface = load(&config);

    let err = surface.start(Some("late"), None).expect_err("late is rejected");
    assert_eq!(err.kind(), ErrorKind::ConfigError);

    write_config(temp.path(), &with_limit("tons"));
    let err = surface.reload("late", None).expect_err("still invalid");
    assert_eq!(err.kind(), ErrorKind::ConfigError);
    let status = status_of(&surface, "late");
    assert_eq!(status.state, AppState::Errored);
    assert!(
        status
            .last_error
            .is_some_and(|report| report.message.contains("tons")),
        "stored error should reflect the latest read"
    );

    write_config(temp.path(), &with_limit("200M"));
    surface.reload("late", None).expect("fixed config reloads");

    let status = status_of(&surface, "late");
    assert_eq!(status.state, AppState::Running);
    assert!(status.pid.is_some());
    assert!(status.last_error.is_none());
    assert_eq!(surface.status(None).expect("status should succeed").len(), 1);

    surface.stop(Some("late")).expect("stop should succeed");
    surface.start(Some("late"), None).expect("start now succeeds");

    surface.shutdown().expect("shutdown should succeed");
}
