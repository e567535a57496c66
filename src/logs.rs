//! Log routing: per-instance sinks fed by stdout/stderr pump threads.
use chrono::{
    Local,
    format::{Item, StrftimeItems},
};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};
use strum_macros::AsRefStr;
use tracing::{debug, warn};

use crate::{
    config::AppSpec,
    constants::{DEFAULT_LOG_DATE_FORMAT, LOG_BUFFER_SIZE},
    error::ProcessManagerError,
    runtime,
};

/// Which child stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

type SharedFile = Arc<Mutex<File>>;

#[derive(Debug, Clone)]
enum Target {
    File { path: PathBuf, file: SharedFile },
    /// The file could not be opened; lines go to the supervisor's stderr.
    Stderr,
}

/// Open log handles for one instance.
#[derive(Debug)]
pub struct LogSink {
    instance: String,
    out: Target,
    error: Target,
    combined: Option<Target>,
    date_format: Option<String>,
}

/// Translates a moment-style date format (`YYYY-MM-DD HH:mm:ss Z`) into a chrono
/// format string. Strings that already contain `%` are taken as chrono formats.
pub fn translate_date_format(format: &str) -> String {
    if format.contains('%') {
        return format.to_string();
    }

    const TOKENS: [(&str, &str); 21] = [
        ("YYYY", "%Y"),
        ("YY", "%y"),
        ("MMMM", "%B"),
        ("MMM", "%b"),
        ("MM", "%m"),
        ("M", "%-m"),
        ("DD", "%d"),
        ("D", "%-d"),
        ("dddd", "%A"),
        ("ddd", "%a"),
        ("HH", "%H"),
        ("H", "%-H"),
        ("hh", "%I"),
        ("h", "%-I"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("SSS", "%3f"),
        ("ZZ", "%z"),
        ("Z", "%:z"),
        ("A", "%p"),
        ("a", "%P"),
    ];

    let mut translated = String::with_capacity(format.len() * 2);
    let mut rest = format;
    'outer: while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('[')
            && let Some(end) = stripped.find(']')
        {
            translated.push_str(&stripped[..end]);
            rest = &stripped[end + 1..];
            continue;
        }
        for (token, replacement) in TOKENS {
            if let Some(stripped) = rest.strip_prefix(token) {
                translated.push_str(replacement);
                rest = stripped;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(ch) = chars.next() {
            translated.push(ch);
        }
        rest = chars.as_str();
    }
    translated
}

fn is_valid_chrono_format(format: &str) -> bool {
    !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}

/// Inserts `-<index>` before the extension: `out.log` -> `out-2.log`.
fn instance_path(path: &Path, index: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}-{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{index}"),
    };
    path.with_file_name(name)
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Resolved log paths for one instance: (out, error, combined).
pub fn instance_log_paths(
    spec: &AppSpec,
    index: usize,
) -> (PathBuf, PathBuf, Option<PathBuf>) {
    let combined = match (&spec.logs.combined, spec.logs.merge) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => Some(runtime::log_dir().join(format!("{}.log", spec.name))),
        (None, false) => None,
    };
    let per_instance = |path: &Path| {
        if spec.instances > 1 && !spec.logs.merge {
            instance_path(path, index)
        } else {
            path.to_path_buf()
        }
    };
    (
        per_instance(&spec.logs.out),
        per_instance(&spec.logs.error),
        combined.as_deref().map(per_instance),
    )
}

/// Opens (creating as needed) the log files for instance `index` of `spec`.
///
/// Unwritable paths do not fail the call: the affected stream falls back to the
/// supervisor's stderr and the error is returned alongside the sink for reporting.
pub fn open_sinks(spec: &AppSpec, index: usize) -> (LogSink, Vec<ProcessManagerError>) {
    let instance = spec.instance_name(index);
    let (out_path, error_path, combined_path) = instance_log_paths(spec, index);
    let mut failures = Vec::new();

    let mut open = |path: PathBuf| match open_append(&path) {
        Ok(file) => Target::File {
            path,
            file: Arc::new(Mutex::new(file)),
        },
        Err(source) => {
            warn!(
                "Log file {} for '{instance}' is unwritable ({source}); using stderr",
                path.display()
            );
            failures.push(ProcessManagerError::LogIoError {
                instance: instance.clone(),
                path: path.display().to_string(),
                source,
            });
            Target::Stderr
        }
    };

    let out = open(out_path);
    let error = open(error_path);
    let combined = combined_path.map(&mut open);

    let date_format = if spec.logs.timestamp {
        let format = spec
            .logs
            .date_format
            .as_deref()
            .map(translate_date_format)
            .unwrap_or_else(|| DEFAULT_LOG_DATE_FORMAT.to_string());
        if is_valid_chrono_format(&format) {
            Some(format)
        } else {
            warn!(
                "Unsupported log_date_format for '{instance}'; using {DEFAULT_LOG_DATE_FORMAT}"
            );
            Some(DEFAULT_LOG_DATE_FORMAT.to_string())
        }
    } else {
        None
    };

    (
        LogSink {
            instance,
            out,
            error,
            combined,
            date_format,
        },
        failures,
    )
}

impl LogSink {
    /// Path the given stream is written to, if it has a file.
    pub fn path(&self, kind: StreamKind) -> Option<&Path> {
        match self.target(kind) {
            Target::File { path, .. } => Some(path),
            Target::Stderr => None,
        }
    }

    /// Every file path owned by this sink.
    pub fn paths(&self) -> Vec<PathBuf> {
        [Some(&self.out), Some(&self.error), self.combined.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|target| match target {
                Target::File { path, .. } => Some(path.clone()),
                Target::Stderr => None,
            })
            .collect()
    }

    fn target(&self, kind: StreamKind) -> &Target {
        match kind {
            StreamKind::Stdout => &self.out,
            StreamKind::Stderr => &self.error,
        }
    }

    fn prefix(&self) -> Option<String> {
        self.date_format
            .as_ref()
            .map(|format| format!("{}: ", Local::now().format(format)))
    }

    /// Writes one line (with its trailing newline) to the stream's file and the combined file.
    pub fn write_line(&self, kind: StreamKind, line: &[u8]) {
        let prefix = self.prefix();
        let mut record = Vec::with_capacity(line.len() + 40);
        if let Some(prefix) = &prefix {
            record.extend_from_slice(prefix.as_bytes());
        }
        record.extend_from_slice(line);
        if !record.ends_with(b"\n") {
            record.push(b'\n');
        }

        self.write_to(self.target(kind), kind, &record);
        if let Some(combined) = &self.combined {
            self.write_to(combined, kind, &record);
        }
    }

    fn write_to(&self, target: &Target, kind: StreamKind, record: &[u8]) {
        match target {
            Target::File { path, file } => {
                let result = file
                    .lock()
                    .map_err(|_| io::Error::other("log file mutex poisoned"))
                    .and_then(|mut handle| handle.write_all(record));
                if let Err(err) = result {
                    warn!("Failed to write {} log for '{}': {err}", path.display(), self.instance);
                }
            }
            Target::Stderr => {
                let mut stderr = io::stderr().lock();
                let _ = write!(stderr, "[{}:{}] ", self.instance, kind.as_ref());
                let _ = stderr.write_all(record);
            }
        }
    }
}

/// Appends bytes up to and including the next newline, stopping early after `limit` bytes.
fn read_record<B: BufRead>(reader: &mut B, record: &mut Vec<u8>, limit: usize) -> io::Result<usize> {
    let mut read = 0;
    while read < limit {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if available.is_empty() {
            break;
        }

        let window = &available[..available.len().min(limit - read)];
        let (taken, complete) = match window.iter().position(|&byte| byte == b'\n') {
            Some(end) => (end + 1, true),
            None => (window.len(), false),
        };
        record.extend_from_slice(&window[..taken]);
        reader.consume(taken);
        read += taken;
        if complete {
            break;
        }
    }
    Ok(read)
}

/// Spawns a thread copying `stream` line by line into `sink` until EOF.
/// Lines longer than the pump buffer are written in buffer-sized pieces.
pub fn spawn_log_writer<R>(sink: Arc<LogSink>, stream: R, kind: StreamKind) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::with_capacity(LOG_BUFFER_SIZE, stream);
        let mut line = Vec::with_capacity(LOG_BUFFER_SIZE);
        loop {
            line.clear();
            match read_record(&mut reader, &mut line, LOG_BUFFER_SIZE) {
                Ok(0) => break,
                Ok(_) => sink.write_line(kind, &line),
                Err(err) => {
                    debug!("{} pump for '{}' ended: {err}", kind.as_ref(), sink.instance);
                    break;
                }
            }
        }
    })
}

/// Reads and displays the last `n` lines of a log file.
pub fn show_log(path: &Path, lines: usize) -> io::Result<()> {
    if !path.exists() {
        eprintln!("Error: Log file {} not found.", path.display());
        return Ok(());
    }

    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let all_lines: Vec<String> = reader.lines().map_while(Result::ok).collect();

    let start = all_lines.len().saturating_sub(lines);
    println!("==> {} <==", path.display());
    for line in &all_lines[start..] {
        println!("{line}");
    }

    Ok(())
}
