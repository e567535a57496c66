//! appwarden supervises the apps declared in an ecosystem file: it spawns each
//! instance, restarts it according to its restart policy, routes its output to
//! log files and answers operator commands over a local control socket.

/// CLI interface.
pub mod cli;

/// Ecosystem file loading and validation.
pub mod config;

/// Constants shared across the crate.
pub mod constants;

/// Command routing over all supervised instances.
pub mod control;

/// Interval and cron tickers.
pub mod cron;

/// Resident supervisor serving the control socket.
pub mod daemon;

/// Error handling.
pub mod error;

/// IPC helpers for communicating with the resident supervisor.
pub mod ipc;

/// Log routing for instance output.
pub mod logs;

/// Resident memory sampling.
pub mod metrics;

/// Runtime directories.
pub mod runtime;

/// Process launching and signalling.
pub mod spawn;

/// Status rendering.
pub mod status;

/// Per-instance lifecycle state machine.
pub mod supervisor;

/// Shared helpers for tests.
pub mod test_utils;

/// Filesystem watch trigger.
pub mod watch;
