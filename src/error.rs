//! Error handling for appwarden.
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Coarse classification of failures, surfaced on `status` and by the CLI.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
pub enum ErrorKind {
    ConfigError,
    SpawnError,
    IOError,
    CrashLoopError,
    TimeoutError,
    ControlError,
    NotFound,
}

/// Last error recorded against an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors raised while reading or validating an ecosystem document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document could not be read from disk.
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// The document is not valid YAML/JSON or has the wrong shape.
    #[error("Invalid config format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A required field is absent or empty.
    #[error("App '{app}' is missing required field '{field}'")]
    MissingField {
        /// Name of the app (or its index when the name itself is missing).
        app: String,
        /// The missing field.
        field: &'static str,
    },

    /// A field carries a value that cannot be interpreted.
    #[error("App '{app}' has invalid {field}: {message}")]
    InvalidValue {
        /// Name of the offending app.
        app: String,
        /// The offending field.
        field: &'static str,
        /// Why the value was rejected.
        message: String,
    },

    /// Two apps share a name.
    #[error("App name '{0}' is declared more than once")]
    DuplicateName(String),
}

/// Defines all possible errors that can occur in the process manager.
#[derive(Debug, Error)]
pub enum ProcessManagerError {
    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error spawning an instance.
    #[error("Failed to start '{instance}': {source}")]
    SpawnError {
        /// The instance that failed to start.
        instance: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A log path could not be opened.
    #[error("Log file '{path}' for '{instance}' is unwritable: {source}")]
    LogIoError {
        /// The instance owning the sink.
        instance: String,
        /// The path that failed.
        path: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Restart budget exhausted.
    #[error("'{instance}' crashed {restarts} times within min_uptime; giving up")]
    CrashLoop {
        /// The instance that crash-looped.
        instance: String,
        /// Number of unstable restarts observed.
        restarts: u32,
    },

    /// Graceful termination did not finish in time.
    #[error("'{instance}' did not exit within {timeout_ms}ms; sent SIGKILL")]
    KillTimeout {
        /// The instance that ignored SIGTERM.
        instance: String,
        /// The configured kill timeout.
        timeout_ms: u64,
    },

    /// Error signalling an instance.
    #[error("Failed to stop '{instance}': {source}")]
    StopError {
        /// The instance that could not be signalled.
        instance: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// No app or instance matches the requested name.
    #[error("No app or instance named '{0}'")]
    UnknownTarget(String),

    /// The instance worker has gone away.
    #[error("Supervisor for '{0}' is no longer running")]
    SupervisorGone(String),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),

    /// A pending start was cancelled by a later stop.
    #[error("Start of '{0}' was superseded by a stop")]
    Superseded(String),

    /// An error already reported elsewhere (a peer waiter or the supervisor process).
    #[error("{}", .0.message)]
    Reported(ErrorReport),

    /// Filesystem watcher setup failed.
    #[error("Failed to watch files for '{instance}': {source}")]
    WatchError {
        /// The instance whose watcher failed.
        instance: String,
        /// The underlying notify error.
        #[source]
        source: notify::Error,
    },
}

impl ProcessManagerError {
    /// Maps the error onto the kind reported by `status` and the CLI.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::ConfigError,
            Self::SpawnError { .. } => ErrorKind::SpawnError,
            Self::LogIoError { .. } | Self::WatchError { .. } => ErrorKind::IOError,
            Self::CrashLoop { .. } => ErrorKind::CrashLoopError,
            Self::KillTimeout { .. } => ErrorKind::TimeoutError,
            Self::StopError { .. }
            | Self::SupervisorGone(_)
            | Self::MutexPoisonError(_)
            | Self::Superseded(_) => ErrorKind::ControlError,
            Self::UnknownTarget(_) => ErrorKind::NotFound,
            Self::Reported(report) => report.kind,
        }
    }

    /// Snapshot suitable for status output.
    pub fn report(&self) -> ErrorReport {
        ErrorReport::new(self.kind(), self.to_string())
    }
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `ProcessManagerError`.
impl<T> From<std::sync::PoisonError<T>> for ProcessManagerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ProcessManagerError::MutexPoisonError(err.to_string())
    }
}
