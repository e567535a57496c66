//! Command-line interface for appwarden.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use strum_macros::Display;
use tracing::level_filters::LevelFilter;

/// Log verbosity given by name (`warn`, `debug`, ...) or by number, 0 (off) to 5 (trace).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

const LEVELS: [(LevelFilter, &str, &[&str]); 6] = [
    (LevelFilter::OFF, "off", &["off", "none"]),
    (LevelFilter::ERROR, "error", &["error", "err"]),
    (LevelFilter::WARN, "warn", &["warn", "warning"]),
    (LevelFilter::INFO, "info", &["info"]),
    (LevelFilter::DEBUG, "debug", &["debug"]),
    (LevelFilter::TRACE, "trace", &["trace"]),
];

impl LogLevelArg {
    /// Directive usable as an `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        LEVELS
            .iter()
            .find(|(level, _, _)| *level == self.0)
            .map_or("info", |(_, name, _)| *name)
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        if value.is_empty() {
            return Err("log level cannot be empty".into());
        }

        let found = match value.parse::<usize>() {
            Ok(number) => LEVELS.get(number),
            Err(_) => LEVELS.iter().find(|(_, _, names)| names.contains(&value.as_str())),
        };
        found
            .map(|(level, _, _)| LogLevelArg(*level))
            .ok_or_else(|| format!("invalid log level '{value}' (expected off..trace or 0-5)"))
    }
}

/// Which stream of an instance's logs to display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LogKind {
    #[default]
    Stdout,
    Stderr,
    /// The supervisor's own log.
    Supervisor,
}

impl FromStr for LogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdout" | "out" => Ok(LogKind::Stdout),
            "stderr" | "err" | "error" => Ok(LogKind::Stderr),
            "supervisor" => Ok(LogKind::Supervisor),
            other => Err(format!("unknown log kind '{other}' (stdout, stderr or supervisor)")),
        }
    }
}

/// Command-line interface for appwarden.
#[derive(Parser)]
#[command(name = "awd", version, author)]
#[command(about = "Supervises the apps of an ecosystem file", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for awd.
#[derive(Subcommand)]
pub enum Commands {
    /// Start an app (or every app), booting the supervisor if needed.
    Start {
        /// App name or `<app>:<index>`; all apps when omitted.
        name: Option<String>,

        /// Path to the ecosystem file (defaults to `ecosystem.yaml` in the current directory).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Environment profile to apply (`env_<profile>`).
        #[arg(long, value_name = "PROFILE")]
        env: Option<String>,

        /// Run the supervisor in the background.
        #[arg(long)]
        daemonize: bool,
    },

    /// Stop an app (or every app).
    Stop {
        /// App name or `<app>:<index>`; all apps when omitted.
        name: Option<String>,
    },

    /// Restart an app.
    Restart {
        /// App name or `<app>:<index>`.
        name: String,
    },

    /// Re-read the config and restart an app with it.
    Reload {
        /// App name or `<app>:<index>`.
        name: String,

        /// Environment profile to switch to.
        #[arg(long, value_name = "PROFILE")]
        env: Option<String>,
    },

    /// Show the state of supervised apps.
    Status {
        /// App name or `<app>:<index>`; all apps when omitted.
        name: Option<String>,

        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,

        /// Disable ANSI colors in output.
        #[arg(long = "no-color")]
        no_color: bool,
    },

    /// Show recent log lines of an app.
    Logs {
        /// App name or `<app>:<index>`; ignored for supervisor logs.
        name: Option<String>,

        /// Path to the ecosystem file (defaults to `ecosystem.yaml` in the current directory).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of lines to show.
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Kind of logs to show: stdout, stderr, or supervisor.
        #[arg(short = 'k', long, default_value_t = LogKind::default())]
        kind: LogKind,
    },

    /// Stop every app and exit the supervisor.
    Shutdown,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
