//! Configuration management for appwarden.
//!
//! An ecosystem document holds a list of `apps` and an optional `deploy` map.
//! Each app is validated on its own so a single bad entry never prevents the
//! rest of the document from loading.
use cron::Schedule;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, warn};

use crate::{
    constants::{
        DEFAULT_CONFIG_FILES, DEFAULT_KILL_TIMEOUT, DEFAULT_LISTEN_TIMEOUT,
        DEFAULT_MIN_UPTIME, DEFAULT_RESTART_DELAY, DEFAULT_WATCH_DELAY,
        ENV_PROFILE_PREFIX,
    },
    error::{ConfigError, ErrorReport},
    runtime,
};

/// How instances of an app are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Display)]
pub enum ExecMode {
    #[default]
    #[strum(to_string = "fork", serialize = "fork_mode")]
    Fork,
    #[strum(to_string = "cluster", serialize = "cluster_mode")]
    Cluster,
}

/// Restart and resource limits for an app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Resident memory above which the instance is restarted.
    pub max_memory_bytes: Option<u64>,
    /// Runs shorter than this count as unstable.
    pub min_uptime: Duration,
    /// Unstable restarts tolerated before giving up. `None` means unlimited.
    pub max_restarts: Option<u32>,
    /// Pause before an automatic restart.
    pub restart_delay: Duration,
}

/// Where and how an app's output is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Combined stdout+stderr file (`log_file`).
    pub combined: Option<PathBuf>,
    /// Stdout file (`out_file`).
    pub out: PathBuf,
    /// Stderr file (`error_file`).
    pub error: PathBuf,
    /// Moment-style date format for line prefixes.
    pub date_format: Option<String>,
    /// Interleave both streams into the combined file and share files across instances.
    pub merge: bool,
    /// Prefix each line with a timestamp.
    pub timestamp: bool,
}

/// Filesystem watch options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSettings {
    pub enabled: bool,
    /// Roots to watch; the app's `cwd` when `watch: true`.
    pub paths: Vec<PathBuf>,
    /// Globs (relative to `cwd`) whose changes are ignored.
    pub ignore: Vec<String>,
    pub use_polling: bool,
    pub follow_symlinks: bool,
    /// Debounce window for bursts of events.
    pub delay: Duration,
}

/// A validated `cron_restart` schedule.
#[derive(Debug, Clone)]
pub struct CronRestart {
    /// Expression as written in the config.
    pub expression: String,
    pub schedule: Schedule,
}

/// Immutable descriptor for one app, built once at load time.
#[derive(Debug, Clone)]
pub struct AppSpec {
    pub name: String,
    pub cwd: PathBuf,
    pub script: String,
    pub args: Vec<String>,
    pub instances: usize,
    pub exec_mode: ExecMode,
    /// Base environment (`env`).
    pub env: BTreeMap<String, String>,
    /// Named overlays (`env_<profile>`), keyed by profile name.
    pub env_profiles: BTreeMap<String, BTreeMap<String, String>>,
    pub interpreter: Option<String>,
    pub interpreter_args: Vec<String>,
    pub source_map_support: bool,
    pub autorestart: bool,
    pub limits: ResourceLimits,
    pub listen_timeout: Duration,
    pub kill_timeout: Duration,
    pub logs: LogSettings,
    pub watch: WatchSettings,
    pub cron_restart: Option<CronRestart>,
}

impl AppSpec {
    /// Display name of the instance at `index`.
    pub fn instance_name(&self, index: usize) -> String {
        if self.instances > 1 {
            format!("{}:{}", self.name, index)
        } else {
            self.name.clone()
        }
    }

    /// Base env with the named profile overlaid. Unknown profiles fall back to the base.
    pub fn env_for(&self, profile: Option<&str>) -> BTreeMap<String, String> {
        let mut merged = self.env.clone();
        if let Some(profile) = profile {
            match self.env_profiles.get(profile) {
                Some(overlay) => {
                    merged.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                None => warn!(
                    "App '{}' has no env_{} profile; using base env",
                    self.name, profile
                ),
            }
        }
        merged
    }
}

/// Remote provisioning recipe for one environment. Parsed, never executed.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DeployTarget {
    pub user: Option<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub host: Vec<String>,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub repo: Option<String>,
    pub path: Option<String>,
    #[serde(rename = "pre-deploy-local")]
    pub pre_deploy_local: Option<String>,
    #[serde(rename = "post-deploy")]
    pub post_deploy: Option<String>,
    #[serde(rename = "pre-setup")]
    pub pre_setup: Option<String>,
}

/// An app entry that failed validation.
#[derive(Debug, Clone)]
pub struct RejectedApp {
    pub name: String,
    pub error: ErrorReport,
}

/// Result of loading an ecosystem document.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// File the config was read from, if any.
    pub path: Option<PathBuf>,
    pub apps: Vec<AppSpec>,
    pub rejected: Vec<RejectedApp>,
    pub deploy: BTreeMap<String, DeployTarget>,
}

impl Config {
    pub fn app(&self, name: &str) -> Option<&AppSpec> {
        self.apps.iter().find(|app| app.name == name)
    }
}

#[derive(Debug, Deserialize)]
struct EcosystemFile {
    #[serde(default)]
    apps: Vec<serde_yaml::Value>,
    #[serde(default)]
    deploy: BTreeMap<String, DeployTarget>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnvValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Flag(bool),
}

impl EnvValue {
    fn into_string(self) -> String {
        match self {
            EnvValue::Text(value) => value,
            EnvValue::Integer(value) => value.to_string(),
            EnvValue::Float(value) => value.to_string(),
            EnvValue::Flag(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WatchValue {
    Flag(bool),
    Paths(Vec<String>),
    Path(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWatchOptions {
    follow_symlinks: Option<bool>,
    use_polling: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawApp {
    name: Option<String>,
    cwd: Option<String>,
    script: Option<String>,
    args: Option<StringOrList>,
    instances: Option<NumberOrText>,
    exec_mode: Option<String>,
    env: Option<HashMap<String, EnvValue>>,
    log_file: Option<String>,
    out_file: Option<String>,
    error_file: Option<String>,
    log_date_format: Option<String>,
    autorestart: Option<bool>,
    watch: Option<WatchValue>,
    max_memory_restart: Option<NumberOrText>,
    min_uptime: Option<NumberOrText>,
    max_restarts: Option<u32>,
    restart_delay: Option<NumberOrText>,
    listen_timeout: Option<NumberOrText>,
    kill_timeout: Option<NumberOrText>,
    merge_logs: Option<bool>,
    time: Option<bool>,
    source_map_support: Option<bool>,
    interpreter: Option<String>,
    interpreter_args: Option<StringOrList>,
    cron_restart: Option<String>,
    ignore_watch: Option<StringOrList>,
    watch_options: Option<RawWatchOptions>,
    watch_delay: Option<NumberOrText>,
    #[serde(flatten)]
    extra: HashMap<String, serde_yaml::Value>,
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<StringOrList>::deserialize(deserializer)? {
        Some(StringOrList::One(value)) => vec![value],
        Some(StringOrList::Many(values)) => values,
        None => Vec::new(),
    })
}

/// Parses a size literal such as `1G`, `512M`, `200KB` or `1048576` into bytes.
pub fn parse_size(raw: &str) -> Result<u64, String> {
    let value = raw.trim();
    if value.is_empty() {
        return Err("size cannot be empty".into());
    }

    let upper = value.to_ascii_uppercase();
    let unit_stripped = upper.strip_suffix('B').unwrap_or(&upper);
    let (amount, multiplier) = if let Some(stripped) = unit_stripped.strip_suffix('K') {
        (stripped, 1024)
    } else if let Some(stripped) = unit_stripped.strip_suffix('M') {
        (stripped, 1024 * 1024)
    } else if let Some(stripped) = unit_stripped.strip_suffix('G') {
        (stripped, 1024 * 1024 * 1024)
    } else {
        (unit_stripped, 1)
    };

    let amount: u64 = amount
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{raw}'"))?;
    Ok(amount.saturating_mul(multiplier))
}

/// Parses a duration literal. Bare numbers are milliseconds; `ms`, `s`, `m` and `h`
/// suffixes are accepted.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let value = raw.trim();
    if value.is_empty() {
        return Err("duration cannot be empty".into());
    }

    let (amount, millis_per_unit) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped, 1)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped, 1_000)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped, 60_000)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped, 3_600_000)
    } else {
        (value, 1)
    };

    let amount: u64 = amount
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration '{raw}'"))?;
    Ok(Duration::from_millis(amount.saturating_mul(millis_per_unit)))
}

/// Parses a cron expression. Five-field expressions get a leading seconds field.
pub fn parse_cron(raw: &str) -> Result<Schedule, String> {
    let trimmed = raw.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| format!("invalid cron expression '{raw}': {e}"))
}

fn invalid(app: &str, field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        app: app.to_string(),
        field,
        message: message.into(),
    }
}

fn duration_field(
    app: &str,
    field: &'static str,
    value: Option<NumberOrText>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(NumberOrText::Number(ms)) if ms >= 0 => Ok(Duration::from_millis(ms as u64)),
        Some(NumberOrText::Number(ms)) => Err(invalid(app, field, format!("{ms} is negative"))),
        Some(NumberOrText::Text(raw)) => parse_duration(&raw).map_err(|e| invalid(app, field, e)),
    }
}

fn split_args(app: &str, field: &'static str, value: Option<StringOrList>) -> Result<Vec<String>, ConfigError> {
    match value {
        None => Ok(Vec::new()),
        Some(StringOrList::Many(values)) => Ok(values),
        Some(StringOrList::One(raw)) => {
            shell_words::split(&raw).map_err(|e| invalid(app, field, e.to_string()))
        }
    }
}

fn resolve_instances(app: &str, value: Option<NumberOrText>) -> Result<usize, ConfigError> {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as i64;
    let requested = match value {
        None => return Ok(1),
        Some(NumberOrText::Number(n)) => n,
        Some(NumberOrText::Text(raw)) => match raw.trim() {
            "max" => 0,
            other => other
                .parse::<i64>()
                .map_err(|_| invalid(app, "instances", format!("'{raw}' is not a count")))?,
        },
    };

    // 0 means one per CPU; negative counts leave that many CPUs free.
    let resolved = if requested > 0 {
        requested
    } else {
        (cpus + requested).max(1)
    };
    Ok(resolved as usize)
}

fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn app_label(index: usize, value: &serde_yaml::Value) -> String {
    value
        .get("name")
        .and_then(|name| name.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("apps[{index}]"))
}

fn build_app(index: usize, raw: RawApp, base_dir: &Path) -> Result<AppSpec, ConfigError> {
    let name = match raw.name.map(|n| n.trim().to_string()) {
        Some(name) if !name.is_empty() => name,
        _ => {
            return Err(ConfigError::MissingField {
                app: format!("apps[{index}]"),
                field: "name",
            });
        }
    };
    let script = match raw.script.map(|s| s.trim().to_string()) {
        Some(script) if !script.is_empty() => script,
        _ => {
            return Err(ConfigError::MissingField {
                app: name,
                field: "script",
            });
        }
    };

    let cwd = raw
        .cwd
        .as_deref()
        .map(|dir| resolve_path(base_dir, dir))
        .unwrap_or_else(|| base_dir.to_path_buf());

    let exec_mode = match raw.exec_mode.as_deref() {
        None => ExecMode::Fork,
        Some(mode) => ExecMode::from_str(mode.trim())
            .map_err(|_| invalid(&name, "exec_mode", format!("unknown mode '{mode}'")))?,
    };
    if exec_mode == ExecMode::Cluster {
        warn!("App '{name}' requests cluster mode; instances run as independent forks");
    }

    let env = raw
        .env
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.into_string()))
        .collect();

    let mut env_profiles = BTreeMap::new();
    for (key, value) in raw.extra {
        let Some(profile) = key.strip_prefix(ENV_PROFILE_PREFIX) else {
            debug!("Ignoring unrecognised field '{key}' on app '{name}'");
            continue;
        };
        if !value.is_mapping() {
            debug!("Ignoring '{key}' on app '{name}': not an env profile mapping");
            continue;
        }
        let overlay: HashMap<String, EnvValue> = serde_yaml::from_value(value)
            .map_err(|e| invalid(&name, "env profile", format!("{key}: {e}")))?;
        env_profiles.insert(
            profile.to_string(),
            overlay
                .into_iter()
                .map(|(k, v)| (k, v.into_string()))
                .collect(),
        );
    }

    let max_memory_bytes = match raw.max_memory_restart {
        None => None,
        Some(NumberOrText::Number(bytes)) if bytes > 0 => Some(bytes as u64),
        Some(NumberOrText::Number(bytes)) => {
            return Err(invalid(&name, "max_memory_restart", format!("{bytes} is not positive")));
        }
        Some(NumberOrText::Text(raw)) => {
            Some(parse_size(&raw).map_err(|e| invalid(&name, "max_memory_restart", e))?)
        }
    };

    let limits = ResourceLimits {
        max_memory_bytes,
        min_uptime: duration_field(&name, "min_uptime", raw.min_uptime, DEFAULT_MIN_UPTIME)?,
        max_restarts: raw.max_restarts,
        restart_delay: duration_field(
            &name,
            "restart_delay",
            raw.restart_delay,
            DEFAULT_RESTART_DELAY,
        )?,
    };

    let log_dir = runtime::log_dir();
    let logs = LogSettings {
        combined: raw.log_file.as_deref().map(|p| resolve_path(&cwd, p)),
        out: raw
            .out_file
            .as_deref()
            .map(|p| resolve_path(&cwd, p))
            .unwrap_or_else(|| log_dir.join(format!("{name}-out.log"))),
        error: raw
            .error_file
            .as_deref()
            .map(|p| resolve_path(&cwd, p))
            .unwrap_or_else(|| log_dir.join(format!("{name}-error.log"))),
        date_format: raw.log_date_format,
        merge: raw.merge_logs.unwrap_or(false),
        timestamp: raw.time.unwrap_or(false),
    };

    let watch_options = raw.watch_options.unwrap_or_default();
    let (enabled, paths) = match raw.watch {
        None | Some(WatchValue::Flag(false)) => (false, vec![cwd.clone()]),
        Some(WatchValue::Flag(true)) => (true, vec![cwd.clone()]),
        Some(WatchValue::Path(path)) => (true, vec![resolve_path(&cwd, &path)]),
        Some(WatchValue::Paths(paths)) if paths.is_empty() => (true, vec![cwd.clone()]),
        Some(WatchValue::Paths(paths)) => {
            (true, paths.iter().map(|p| resolve_path(&cwd, p)).collect())
        }
    };
    let watch = WatchSettings {
        enabled,
        paths,
        ignore: match raw.ignore_watch {
            None => Vec::new(),
            Some(StringOrList::One(glob)) => vec![glob],
            Some(StringOrList::Many(globs)) => globs,
        },
        use_polling: watch_options.use_polling.unwrap_or(false),
        follow_symlinks: watch_options.follow_symlinks.unwrap_or(false),
        delay: duration_field(&name, "watch_delay", raw.watch_delay, DEFAULT_WATCH_DELAY)?,
    };

    let cron_restart = match raw.cron_restart {
        Some(expression) if !expression.trim().is_empty() => {
            let schedule = parse_cron(&expression).map_err(|e| invalid(&name, "cron_restart", e))?;
            Some(CronRestart {
                expression,
                schedule,
            })
        }
        _ => None,
    };

    let interpreter = raw
        .interpreter
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty() && i != "none");

    Ok(AppSpec {
        args: split_args(&name, "args", raw.args)?,
        instances: resolve_instances(&name, raw.instances)?,
        interpreter_args: split_args(&name, "interpreter_args", raw.interpreter_args)?,
        listen_timeout: duration_field(
            &name,
            "listen_timeout",
            raw.listen_timeout,
            DEFAULT_LISTEN_TIMEOUT,
        )?,
        kill_timeout: duration_field(&name, "kill_timeout", raw.kill_timeout, DEFAULT_KILL_TIMEOUT)?,
        name,
        cwd,
        script,
        exec_mode,
        env,
        env_profiles,
        interpreter,
        source_map_support: raw.source_map_support.unwrap_or(false),
        autorestart: raw.autorestart.unwrap_or(true),
        limits,
        logs,
        watch,
        cron_restart,
    })
}

/// Parses an ecosystem document. Relative paths resolve against `base_dir`.
pub fn parse_config(content: &str, base_dir: &Path) -> Result<Config, ConfigError> {
    let file: EcosystemFile = serde_yaml::from_str(content)?;
    let mut config = Config {
        deploy: file.deploy,
        ..Config::default()
    };
    let mut seen = HashSet::new();

    for (index, value) in file.apps.into_iter().enumerate() {
        let label = app_label(index, &value);
        let built = serde_yaml::from_value::<RawApp>(value)
            .map_err(|e| invalid(&label, "entry", e.to_string()))
            .and_then(|raw| build_app(index, raw, base_dir))
            .and_then(|app| {
                if seen.insert(app.name.clone()) {
                    Ok(app)
                } else {
                    Err(ConfigError::DuplicateName(app.name))
                }
            });

        match built {
            Ok(app) => config.apps.push(app),
            Err(err) => {
                warn!("Rejecting app '{label}': {err}");
                config.rejected.push(RejectedApp {
                    name: label,
                    error: crate::error::ProcessManagerError::from(err).report(),
                });
            }
        }
    }

    Ok(config)
}

/// Resolves the config path, falling back to the default file names in the current dir.
pub fn resolve_config_path(config_path: Option<&Path>) -> PathBuf {
    if let Some(path) = config_path {
        return path.to_path_buf();
    }
    DEFAULT_CONFIG_FILES
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILES[0]))
}

/// Loads and validates the configuration file.
pub fn load_config(config_path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = resolve_config_path(config_path);
    let content = fs::read_to_string(&config_path).map_err(|e| {
        ConfigError::Read(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let base_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let base_dir = base_dir.canonicalize().unwrap_or(base_dir);

    let mut config = parse_config(&content, &base_dir)?;
    config.path = Some(config_path);
    Ok(config)
}
