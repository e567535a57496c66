//! Rendering instance status for the terminal.
use std::fmt::Write as _;

use crate::supervisor::{AppState, InstanceStatus};

const GREEN_BOLD: &str = "\x1b[1;32m";
const RED_BOLD: &str = "\x1b[1;31m";
const MAGENTA_BOLD: &str = "\x1b[1;35m";
const YELLOW_BOLD: &str = "\x1b[1;33m";
const RESET: &str = "\x1b[0m";

fn state_color(state: AppState) -> &'static str {
    match state {
        AppState::Running => GREEN_BOLD,
        AppState::Errored => RED_BOLD,
        AppState::Starting | AppState::Stopping => YELLOW_BOLD,
        AppState::RestartBackoff => MAGENTA_BOLD,
        AppState::Stopped => "",
    }
}

/// Compact uptime such as `45s`, `12m`, `3h`, `2d`.
pub fn format_uptime(uptime_ms: u64) -> String {
    let secs = uptime_ms / 1000;
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3_599 => format!("{}m", secs / 60),
        3_600..=86_399 => format!("{}h", secs / 3_600),
        _ => format!("{}d", secs / 86_400),
    }
}

/// Human-readable byte count (`512B`, `1.5K`, `200.0M`).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["K", "M", "G", "T"];
    if bytes < 1024 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.1}{unit}")
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Renders `statuses` as an aligned table, with error details underneath.
pub fn render_table(statuses: &[InstanceStatus], color: bool) -> String {
    if statuses.is_empty() {
        return "No managed apps.\n".to_string();
    }

    let headers = ["NAME", "STATE", "PID", "UPTIME", "RESTARTS", "MEMORY", "LAST EXIT"];
    let rows: Vec<[String; 7]> = statuses
        .iter()
        .map(|status| {
            [
                status.name.clone(),
                status.state.to_string(),
                or_dash(status.pid),
                or_dash(status.uptime_ms.map(format_uptime)),
                status.restarts.to_string(),
                or_dash(status.memory_bytes.map(format_bytes)),
                or_dash(status.last_exit.map(|exit| exit.to_string())),
            ]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut push_row = |cells: &[String], state: Option<AppState>| {
        let mut line = String::new();
        for (index, (cell, width)) in cells.iter().zip(widths).enumerate() {
            let padded = format!("{cell:<width$}");
            match state {
                Some(state) if index == 1 && color && !state_color(state).is_empty() => {
                    let _ = write!(line, "{}{padded}{RESET}  ", state_color(state));
                }
                _ => {
                    let _ = write!(line, "{padded}  ");
                }
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    };

    push_row(&headers.map(str::to_string), None);
    for (row, status) in rows.iter().zip(statuses) {
        push_row(row, Some(status.state));
    }

    for status in statuses {
        if let Some(err) = &status.last_error {
            let _ = writeln!(out, "{}: error[{}]: {}", status.name, err.kind, err.message);
        }
    }
    out
}

/// Pretty JSON for `status --json`.
pub fn render_json(statuses: &[InstanceStatus]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(statuses)
}
