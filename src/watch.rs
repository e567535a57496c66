//! Filesystem watch trigger: turns bursts of relevant file changes into a single
//! reload request.
use notify::{
    Config as NotifyConfig, Event, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher,
};
use regex::Regex;
use std::{
    collections::HashSet,
    fs,
    path::{Component, Path, PathBuf},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    config::WatchSettings, constants::WATCH_POLL_INTERVAL, error::ProcessManagerError,
};

/// Translates a glob into an anchored regex. `**` crosses directories, `*` and `?` do not.
pub fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    class.push(inner);
                }
                if closed {
                    let negated = class.strip_prefix('!').map(|rest| format!("^{rest}"));
                    out.push('[');
                    out.push_str(&negated.unwrap_or(class).replace('\\', "\\\\"));
                    out.push(']');
                } else {
                    out.push_str(&regex::escape(&format!("[{class}")));
                }
            }
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    out
}

#[derive(Debug)]
struct IgnorePattern {
    regex: Regex,
    /// Patterns containing `/` match whole relative paths; bare names match any component.
    anchored: bool,
}

/// Decides which changed paths are irrelevant.
#[derive(Debug)]
pub struct IgnoreMatcher {
    roots: Vec<PathBuf>,
    patterns: Vec<IgnorePattern>,
    exact: HashSet<PathBuf>,
}

impl IgnoreMatcher {
    /// `root` is the directory globs are relative to; `exact` are paths always ignored.
    pub fn new(root: &Path, globs: &[String], exact: Vec<PathBuf>) -> Result<Self, regex::Error> {
        let mut roots = vec![root.to_path_buf()];
        if let Ok(canonical) = root.canonicalize()
            && canonical != root
        {
            roots.push(canonical);
        }

        let patterns = globs
            .iter()
            .map(|glob| glob.trim().trim_start_matches("./").trim_end_matches('/'))
            .filter(|glob| !glob.is_empty())
            .map(|glob| {
                Ok(IgnorePattern {
                    regex: Regex::new(&glob_to_regex(glob))?,
                    anchored: glob.contains('/'),
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Self {
            roots,
            patterns,
            exact: exact.into_iter().collect(),
        })
    }

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        self.roots
            .iter()
            .find_map(|root| path.strip_prefix(root).ok())
            .unwrap_or(path)
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        if self.exact.contains(path) {
            return true;
        }

        let relative = self.relative(path);
        let components: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().to_string()),
                _ => None,
            })
            .collect();
        let absolute = path.is_absolute() && relative == path;

        self.patterns.iter().any(|pattern| {
            if !pattern.anchored {
                return components.iter().any(|part| pattern.regex.is_match(part));
            }
            // Any ancestor matching ignores everything below it.
            let mut prefix = if absolute { String::from("/") } else { String::new() };
            components.iter().any(|part| {
                if !prefix.is_empty() && !prefix.ends_with('/') {
                    prefix.push('/');
                }
                prefix.push_str(part);
                pattern.regex.is_match(&prefix)
            })
        })
    }
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

fn is_relevant(event: &Event, matcher: &IgnoreMatcher, follow_symlinks: bool) -> bool {
    if event.kind.is_access() || event.kind.is_other() {
        return false;
    }
    event
        .paths
        .iter()
        .any(|path| !matcher.is_ignored(path) && (follow_symlinks || !is_symlink(path)))
}

/// Owns the OS watcher; dropping it stops watching and ends the debounce thread.
pub struct WatchTrigger {
    _watcher: Box<dyn Watcher + Send>,
}

impl WatchTrigger {
    /// Starts watching `settings.paths`. `on_change` is called once per debounced burst and
    /// returns `false` when its receiver is gone.
    pub fn spawn<F>(
        instance: &str,
        settings: &WatchSettings,
        cwd: &Path,
        always_ignored: Vec<PathBuf>,
        on_change: F,
    ) -> Result<Self, ProcessManagerError>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let watch_error = |source: notify::Error| ProcessManagerError::WatchError {
            instance: instance.to_string(),
            source,
        };
        let matcher = IgnoreMatcher::new(cwd, &settings.ignore, always_ignored)
            .map_err(|e| watch_error(notify::Error::generic(&e.to_string())))?;

        let (raw_tx, raw_rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher: Box<dyn Watcher + Send> = if settings.use_polling {
            Box::new(
                PollWatcher::new(
                    raw_tx,
                    NotifyConfig::default().with_poll_interval(WATCH_POLL_INTERVAL),
                )
                .map_err(watch_error)?,
            )
        } else {
            Box::new(RecommendedWatcher::new(raw_tx, NotifyConfig::default()).map_err(watch_error)?)
        };

        for path in &settings.paths {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(watch_error)?;
        }

        let label = instance.to_string();
        let delay = settings.delay;
        let follow_symlinks = settings.follow_symlinks;
        thread::spawn(move || debounce(label, raw_rx, matcher, follow_symlinks, delay, on_change));

        info!(
            "Watching {:?} for '{instance}' ({})",
            settings.paths,
            if settings.use_polling { "polling" } else { "native" }
        );
        Ok(Self { _watcher: watcher })
    }
}

fn debounce<F>(
    label: String,
    raw_rx: Receiver<notify::Result<Event>>,
    matcher: IgnoreMatcher,
    follow_symlinks: bool,
    delay: std::time::Duration,
    mut on_change: F,
) where
    F: FnMut() -> bool,
{
    let relevant = |message: notify::Result<Event>| match message {
        Ok(event) => {
            let keep = is_relevant(&event, &matcher, follow_symlinks);
            if keep {
                debug!("'{label}' watch event: {:?} {:?}", event.kind, event.paths);
            }
            keep
        }
        Err(err) => {
            warn!("Watch error for '{label}': {err}");
            false
        }
    };

    while let Ok(message) = raw_rx.recv() {
        if !relevant(message) {
            continue;
        }

        // Swallow the rest of the burst.
        let deadline = Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match raw_rx.recv_timeout(remaining) {
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        info!("File change detected for '{label}'; requesting reload");
        if !on_change() {
            break;
        }
    }
    debug!("Watch debounce for '{label}' stopped");
}
