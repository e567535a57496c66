//! Resident supervisor: owns the [`ControlSurface`] and serves control commands
//! over the unix socket.
use std::{
    fs::{self, File},
    io,
    os::unix::net::{UnixListener, UnixStream},
    path::Path,
    sync::Arc,
    thread,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    control::ControlSurface,
    error::{ErrorKind, ErrorReport, ProcessManagerError},
    ipc::{self, ControlCommand, ControlError, ControlResponse},
    supervisor::SupervisorOptions,
};

/// Errors emitted by the resident supervisor runtime.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Process(#[from] ProcessManagerError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DaemonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaemonError::Process(err) => err.kind(),
            DaemonError::Control(ControlError::Server(report)) => report.kind,
            DaemonError::Control(_) => ErrorKind::ControlError,
            DaemonError::Io(_) => ErrorKind::IOError,
        }
    }
}

/// Long-lived supervisor process.
pub struct Daemon {
    surface: Arc<ControlSurface>,
    _lock: File,
}

impl Daemon {
    /// Takes the supervisor lock and loads the config. Nothing is started yet.
    pub fn new(
        config_path: Option<&Path>,
        profile: Option<String>,
        options: SupervisorOptions,
    ) -> Result<Self, DaemonError> {
        let lock = ipc::acquire_supervisor_lock()?;
        let surface = ControlSurface::load(config_path, profile, options)?;
        if let Some(path) = surface.config_path() {
            info!("Loaded config from {}", path.display());
        }
        Ok(Self {
            surface: Arc::new(surface),
            _lock: lock,
        })
    }

    pub fn surface(&self) -> &ControlSurface {
        &self.surface
    }

    /// Starts `target` (everything when `None`) and serves commands until shutdown.
    pub fn run(self, target: Option<&str>) -> Result<(), DaemonError> {
        let socket_path = ipc::socket_path()?;
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;

        if let Err(err) = self.surface.start(target, None) {
            warn!("Not every app started: {err}");
        }
        info!("appwarden supervisor listening on {:?}", socket_path);

        loop {
            match listener.accept() {
                Ok((mut stream, _addr)) => match ipc::read_command(&mut stream) {
                    Ok(ControlCommand::Shutdown) => {
                        info!("Shutdown requested");
                        let response = ControlResponse::from(self.surface.shutdown());
                        let _ = ipc::write_response(&mut stream, &response);
                        break;
                    }
                    Ok(command) => self.dispatch(stream, command),
                    Err(err) => {
                        warn!("Invalid supervisor command: {err}");
                        let report = ErrorReport::new(ErrorKind::ControlError, err.to_string());
                        let _ = ipc::write_response(&mut stream, &ControlResponse::Error(report));
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("Supervisor listener error: {err}");
                    break;
                }
            }
        }

        self.surface.shutdown()?;
        ipc::cleanup_runtime()?;
        Ok(())
    }

    /// Answers on a separate thread so a slow stop never delays other clients.
    fn dispatch(&self, mut stream: UnixStream, command: ControlCommand) {
        let surface = Arc::clone(&self.surface);
        thread::spawn(move || {
            debug!("Supervisor received command: {command:?}");
            let response = handle_command(&surface, command);
            if let Err(err) = ipc::write_response(&mut stream, &response) {
                warn!("Failed to answer control client: {err}");
            }
        });
    }
}

fn describe(name: &Option<String>) -> String {
    match name {
        Some(name) => format!("'{name}'"),
        None => "all apps".to_string(),
    }
}

/// Applies one command to the surface.
pub fn handle_command(surface: &ControlSurface, command: ControlCommand) -> ControlResponse {
    let outcome = match &command {
        ControlCommand::Start { name, env } => surface
            .start(name.as_deref(), env.as_deref())
            .map(|()| format!("Started {}", describe(name))),
        ControlCommand::Stop { name } => surface
            .stop(name.as_deref())
            .map(|()| format!("Stopped {}", describe(name))),
        ControlCommand::Restart { name } => surface
            .restart(name.as_deref())
            .map(|()| format!("Restarted {}", describe(name))),
        ControlCommand::Reload { name, env } => surface
            .reload(name, env.as_deref())
            .map(|()| format!("Reloaded '{name}'")),
        ControlCommand::Status { name } => {
            return match surface.status(name.as_deref()) {
                Ok(statuses) => ControlResponse::Status(statuses),
                Err(err) => ControlResponse::Error(err.report()),
            };
        }
        ControlCommand::Shutdown => surface
            .shutdown()
            .map(|()| "Supervisor shutting down".to_string()),
    };

    match outcome {
        Ok(message) => ControlResponse::Message(message),
        Err(err) => {
            error!("Command {command:?} failed: {err}");
            ControlResponse::Error(err.report())
        }
    }
}
