//! Unix-socket control channel between `awd` invocations and the resident supervisor.
use fs2::FileExt;
use nix::{errno::Errno, sys::signal, unistd::Pid};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::PathBuf,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    constants::{SOCKET_FILE_NAME, SUPERVISOR_PID_FILE_NAME},
    error::{ErrorReport, ProcessManagerError},
    runtime,
    supervisor::InstanceStatus,
};

/// Directory holding the pid file and socket, created on demand.
fn runtime_dir() -> Result<PathBuf, ControlError> {
    let path = runtime::state_dir();
    fs::create_dir_all(&path)?;
    Ok(path)
}

/// Control socket of the resident supervisor.
pub fn socket_path() -> Result<PathBuf, ControlError> {
    Ok(runtime_dir()?.join(SOCKET_FILE_NAME))
}

/// Lock file that also records the supervisor PID.
pub fn supervisor_pid_path() -> Result<PathBuf, ControlError> {
    Ok(runtime_dir()?.join(SUPERVISOR_PID_FILE_NAME))
}

/// Request from an `awd` invocation. `name` is an app, `<app>:<index>`, or everything when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    Start {
        name: Option<String>,
        env: Option<String>,
    },
    Stop {
        name: Option<String>,
    },
    Restart {
        name: Option<String>,
    },
    Reload {
        name: String,
        env: Option<String>,
    },
    Status {
        name: Option<String>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlResponse {
    Ok,
    Message(String),
    Status(Vec<InstanceStatus>),
    Error(ErrorReport),
}

impl From<Result<(), ProcessManagerError>> for ControlResponse {
    fn from(result: Result<(), ProcessManagerError>) -> Self {
        match result {
            Ok(()) => ControlResponse::Ok,
            Err(err) => ControlResponse::Error(err.report()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{}", .0.message)]
    Server(ErrorReport),
    #[error("control socket not available")]
    NotAvailable,
    #[error("another supervisor already holds the lock")]
    AlreadyRunning,
}

/// One JSON document per line, in both directions.
fn send_frame<T: Serialize>(stream: &mut UnixStream, message: &T) -> Result<(), ControlError> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    stream.write_all(&frame)?;
    stream.flush()?;
    Ok(())
}

/// `None` when the peer closed without sending anything.
fn receive_frame<T: DeserializeOwned>(stream: &mut UnixStream) -> Result<Option<T>, ControlError> {
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    match line.trim() {
        "" => Ok(None),
        frame => Ok(Some(serde_json::from_str(frame)?)),
    }
}

/// Round-trips `command` through the supervisor. Error responses become `ControlError::Server`.
pub fn send_command(command: &ControlCommand) -> Result<ControlResponse, ControlError> {
    let path = socket_path()?;
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = UnixStream::connect(path).map_err(|err| match err.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => ControlError::NotAvailable,
        _ => ControlError::Io(err),
    })?;
    send_frame(&mut stream, command)?;

    match receive_frame(&mut stream)? {
        None => Err(ControlError::NotAvailable),
        Some(ControlResponse::Error(report)) => Err(ControlError::Server(report)),
        Some(response) => Ok(response),
    }
}

pub fn read_command(stream: &mut UnixStream) -> Result<ControlCommand, ControlError> {
    receive_frame(stream)?.ok_or_else(|| {
        ControlError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "client sent no command",
        ))
    })
}

pub fn write_response(
    stream: &mut UnixStream,
    response: &ControlResponse,
) -> Result<(), ControlError> {
    send_frame(stream, response)
}

/// Takes the exclusive supervisor lock and records our PID in the lock file.
///
/// The returned file must stay open for as long as the supervisor runs.
pub fn acquire_supervisor_lock() -> Result<File, ControlError> {
    let path = supervisor_pid_path()?;
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    file.try_lock_exclusive()
        .map_err(|_| ControlError::AlreadyRunning)?;

    file.set_len(0)?;
    write!(file, "{}", std::process::id())?;
    file.flush()?;
    debug!("Holding supervisor lock at {}", path.display());
    Ok(file)
}

pub fn read_supervisor_pid() -> Result<Option<i32>, ControlError> {
    let path = supervisor_pid_path()?;
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(None);
    }
    contents
        .trim()
        .parse::<i32>()
        .map(Some)
        .map_err(|e| ControlError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// Whether a supervisor process is alive. Stale runtime files are cleaned up.
pub fn supervisor_running() -> bool {
    match read_supervisor_pid() {
        Ok(Some(pid)) => match signal::kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => {
                let _ = cleanup_runtime();
                false
            }
            Err(err) => {
                warn!("Failed to query supervisor pid {pid}: {err}");
                false
            }
        },
        Ok(None) | Err(_) => false,
    }
}

/// Removes the socket and pid file; missing files are fine.
pub fn cleanup_runtime() -> Result<(), ControlError> {
    if let Ok(path) = socket_path()
        && path.exists()
    {
        let _ = fs::remove_file(path);
    }

    if let Ok(pid_path) = supervisor_pid_path()
        && pid_path.exists()
    {
        let _ = fs::remove_file(pid_path);
    }

    Ok(())
}
