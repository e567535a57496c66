use std::{
    error::Error,
    fs::{self, OpenOptions},
    os::unix::io::IntoRawFd,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Mutex,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use appwarden::{
    cli::{Cli, Commands, LogKind, LogLevelArg, parse_args},
    config::{load_config, resolve_config_path},
    constants::SUPERVISOR_LOG_FILE_NAME,
    daemon::{Daemon, DaemonError},
    error::{ConfigError, ErrorKind, ProcessManagerError},
    ipc::{self, ControlCommand, ControlError, ControlResponse},
    logs::{instance_log_paths, show_log},
    runtime,
    status::{render_json, render_table},
    supervisor::SupervisorOptions,
};

fn main() -> ExitCode {
    let args = parse_args();
    runtime::init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error[{}]: {err}", error_kind(err.as_ref()));
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> Result<(), Box<dyn Error>> {
    let Cli { log_level, command } = args;

    match command {
        Commands::Start {
            name,
            config,
            env,
            daemonize,
        } => {
            if ipc::supervisor_running() {
                init_logging(log_level);
                if config.is_some() {
                    warn!("Supervisor already running; ignoring --config");
                }
                return send_control_command(ControlCommand::Start { name, env });
            }

            let config_path = absolute_config_path(config.as_deref())?;
            if daemonize {
                daemonize_awd()?;
                runtime::init();
                init_daemon_logging(log_level)?;
            } else {
                init_logging(log_level);
                register_signal_handler()?;
            }

            info!("Starting appwarden supervisor with config {:?}", config_path);
            let daemon = Daemon::new(Some(&config_path), env, SupervisorOptions::default())?;
            if let Err(err) = daemon.run(name.as_deref()) {
                error!("Supervisor exited with error: {err}");
                return Err(err.into());
            }
        }
        Commands::Stop { name } => {
            init_logging(log_level);
            if ipc::supervisor_running() {
                send_control_command(ControlCommand::Stop { name })?;
            } else {
                warn!("No running appwarden supervisor found; nothing to stop");
            }
        }
        Commands::Restart { name } => {
            init_logging(log_level);
            send_control_command(ControlCommand::Restart { name: Some(name) })?;
        }
        Commands::Reload { name, env } => {
            init_logging(log_level);
            send_control_command(ControlCommand::Reload { name, env })?;
        }
        Commands::Status {
            name,
            json,
            no_color,
        } => {
            init_logging(log_level);
            if !ipc::supervisor_running() {
                println!("appwarden supervisor is not running.");
                return Ok(());
            }
            match ipc::send_command(&ControlCommand::Status { name })? {
                ControlResponse::Status(statuses) if json => {
                    println!("{}", render_json(&statuses)?);
                }
                ControlResponse::Status(statuses) => {
                    print!("{}", render_table(&statuses, !no_color));
                }
                other => print_response(other),
            }
        }
        Commands::Logs {
            name,
            config,
            lines,
            kind,
        } => {
            init_logging(log_level);
            show_logs(name.as_deref(), config.as_deref(), lines, kind)?;
        }
        Commands::Shutdown => {
            init_logging(log_level);
            if ipc::supervisor_running() {
                send_control_command(ControlCommand::Shutdown)?;
            } else {
                warn!("No running appwarden supervisor found");
            }
        }
    }

    Ok(())
}

fn env_filter(level: Option<LogLevelArg>) -> EnvFilter {
    if let Some(level) = level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn init_logging(level: Option<LogLevelArg>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .try_init();
}

/// A detached supervisor has no terminal; it logs to a file under the log dir.
fn init_daemon_logging(level: Option<LogLevelArg>) -> Result<(), Box<dyn Error>> {
    let log_dir = runtime::log_dir();
    fs::create_dir_all(&log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(SUPERVISOR_LOG_FILE_NAME))?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(())
}

/// The daemon changes directory to `/`, so the config path must be absolute first.
fn absolute_config_path(config: Option<&Path>) -> Result<PathBuf, Box<dyn Error>> {
    let candidate = resolve_config_path(config);
    if candidate.is_absolute() {
        return Ok(candidate);
    }

    let resolved = std::env::current_dir()?.join(&candidate);
    Ok(resolved.canonicalize().unwrap_or(resolved))
}

fn print_response(response: ControlResponse) {
    match response {
        ControlResponse::Message(message) => println!("{message}"),
        ControlResponse::Status(statuses) => print!("{}", render_table(&statuses, false)),
        ControlResponse::Ok | ControlResponse::Error(_) => {}
    }
}

fn send_control_command(command: ControlCommand) -> Result<(), Box<dyn Error>> {
    match ipc::send_command(&command) {
        Ok(response) => {
            print_response(response);
            Ok(())
        }
        Err(ControlError::NotAvailable) => {
            let _ = ipc::cleanup_runtime();
            Err(ControlError::NotAvailable.into())
        }
        Err(err) => Err(err.into()),
    }
}

fn show_logs(
    name: Option<&str>,
    config: Option<&Path>,
    lines: usize,
    kind: LogKind,
) -> Result<(), Box<dyn Error>> {
    if kind == LogKind::Supervisor {
        show_log(&runtime::log_dir().join(SUPERVISOR_LOG_FILE_NAME), lines)?;
        return Ok(());
    }

    let config = load_config(config)?;
    let (app, index) = match name.and_then(|n| n.rsplit_once(':')) {
        Some((app, index)) if config.app(app).is_some() => (Some(app), index.parse().ok()),
        _ => (name, None),
    };

    let specs: Vec<_> = match app {
        Some(app) => vec![
            config
                .app(app)
                .ok_or_else(|| ProcessManagerError::UnknownTarget(app.to_string()))?,
        ],
        None => config.apps.iter().collect(),
    };

    for spec in specs {
        let indexes: Vec<usize> = match index {
            Some(index) if index < spec.instances => vec![index],
            Some(_) => {
                return Err(ProcessManagerError::UnknownTarget(name.unwrap_or_default().into())
                    .into());
            }
            None => (0..spec.instances).collect(),
        };
        for index in indexes {
            let (out, error, _) = instance_log_paths(spec, index);
            let path = if kind == LogKind::Stdout { out } else { error };
            show_log(&path, lines)?;
        }
    }
    Ok(())
}

/// Maps any error surfaced to the CLI onto its reported kind.
fn error_kind(err: &(dyn Error + 'static)) -> ErrorKind {
    if let Some(err) = err.downcast_ref::<ProcessManagerError>() {
        return err.kind();
    }
    if let Some(err) = err.downcast_ref::<DaemonError>() {
        return err.kind();
    }
    if let Some(ControlError::Server(report)) = err.downcast_ref::<ControlError>() {
        return report.kind;
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return ErrorKind::ConfigError;
    }
    if err.downcast_ref::<std::io::Error>().is_some() {
        return ErrorKind::IOError;
    }
    ErrorKind::ControlError
}

fn daemonize_awd() -> std::io::Result<()> {
    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    unsafe {
        libc::setsid();
    }

    if unsafe { libc::fork() } > 0 {
        std::process::exit(0);
    }

    std::env::set_current_dir("/")?;
    let devnull = fs::File::open("/dev/null")?;
    let fd = devnull.into_raw_fd();
    unsafe {
        let _ = libc::dup2(fd, libc::STDIN_FILENO);
        let _ = libc::dup2(fd, libc::STDOUT_FILENO);
        let _ = libc::dup2(fd, libc::STDERR_FILENO);
        libc::close(fd);
    }

    Ok(())
}

/// Ctrl-C in the foreground asks our own control socket for a graceful shutdown.
fn register_signal_handler() -> Result<(), Box<dyn Error>> {
    ctrlc::set_handler(move || {
        println!("appwarden is shutting down...");
        if let Err(err) = ipc::send_command(&ControlCommand::Shutdown) {
            eprintln!("Graceful shutdown failed ({err}); exiting");
            let _ = ipc::cleanup_runtime();
            std::process::exit(130);
        }
    })?;

    Ok(())
}
