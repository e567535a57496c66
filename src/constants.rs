//! Constants and default values shared across the supervisor.
//!
//! Defaults for optional app fields live here so the config loader and the
//! tests agree on a single source of truth.

use std::time::Duration;

// ============================================================================
// File System Constants
// ============================================================================

/// Config files looked up in the current directory when none is given.
pub const DEFAULT_CONFIG_FILES: [&str; 3] =
    ["ecosystem.yaml", "ecosystem.yml", "ecosystem.json"];

/// Directory (relative to `$HOME`) holding runtime artifacts.
pub const STATE_DIR_SUFFIX: &str = ".local/share/appwarden";

/// Name of the control socket inside the state directory.
pub const SOCKET_FILE_NAME: &str = "control.sock";

/// Name of the supervisor PID file inside the state directory.
pub const SUPERVISOR_PID_FILE_NAME: &str = "awd.pid";

/// Name of the supervisor's own log inside the log directory.
pub const SUPERVISOR_LOG_FILE_NAME: &str = "supervisor.log";

// ============================================================================
// App Defaults
// ============================================================================

/// Runs shorter than this count towards the crash-loop counter.
pub const DEFAULT_MIN_UPTIME: Duration = Duration::from_millis(1000);

/// Time an instance must stay alive before it is reported as running.
pub const DEFAULT_LISTEN_TIMEOUT: Duration = Duration::from_millis(3000);

/// Grace period between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_millis(1600);

/// Delay before an automatic restart.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::ZERO;

/// Window used to coalesce bursts of filesystem events.
pub const DEFAULT_WATCH_DELAY: Duration = Duration::from_millis(1000);

/// Poll interval used when `watch_options.usePolling` is set.
pub const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Timestamp format used when `time` is enabled without `log_date_format`.
pub const DEFAULT_LOG_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

// ============================================================================
// Process Management Timing
// ============================================================================

/// How often resident memory is sampled for instances with a memory limit.
pub const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Extra time allowed after SIGKILL before a stop is reported as wedged.
pub const POST_KILL_GRACE: Duration = Duration::from_secs(2);

/// Buffer size for log output streams (stdout/stderr).
pub const LOG_BUFFER_SIZE: usize = 8192;

// ============================================================================
// Environment
// ============================================================================

/// Env var carrying the instance index into the child.
pub const INSTANCE_ENV_VAR: &str = "APP_INSTANCE";

/// Same index under the name node applications conventionally read.
pub const NODE_INSTANCE_ENV_VAR: &str = "NODE_APP_INSTANCE";

/// Prefix identifying env profile overlays in an app entry.
pub const ENV_PROFILE_PREFIX: &str = "env_";
