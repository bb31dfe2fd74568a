use std::collections::BTreeMap;
use std::sync::LazyLock;

use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::events::{Event, EventReceiver, Stream};

// ---------------------------------------------------------------------------
// LogLevel — detected from log line text
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

static LOG_LEVEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\b(trace|debug|info|warn(?:ing)?|error)\b"#).unwrap());

/// Detect log level from a line of text.
pub fn detect_log_level(text: &str) -> Option<LogLevel> {
    LOG_LEVEL_RE.find(text).and_then(|m| {
        let s = m.as_str().to_lowercase();
        match s.as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    })
}

// ---------------------------------------------------------------------------
// EventPrinter — colored terminal output for supervisor events
// ---------------------------------------------------------------------------

/// Color palette for project names (using owo-colors).
const PROJECT_COLORS: &[fn(&str) -> String] = &[
    |s| format!("{}", s.cyan()),
    |s| format!("{}", s.yellow()),
    |s| format!("{}", s.green()),
    |s| format!("{}", s.magenta()),
    |s| format!("{}", s.blue()),
    |s| format!("{}", s.red()),
];

fn format_level(level: &LogLevel, use_color: bool) -> String {
    if !use_color {
        return format!("{:>5} ", level.as_str());
    }
    match level {
        LogLevel::Trace => format!("{} ", level.as_str().dimmed()),
        LogLevel::Debug => format!("{} ", level.as_str().blue()),
        LogLevel::Info => format!("{} ", level.as_str().green()),
        LogLevel::Warn => format!("{} ", level.as_str().yellow()),
        LogLevel::Error => format!("{} ", level.as_str().red()),
    }
}

/// Subscribes to the supervisor's event channel and renders log lines and
/// status changes to the terminal, one color per project.
pub struct EventPrinter {
    rx: EventReceiver,
    /// project id -> display name
    names: BTreeMap<String, String>,
    max_name_len: usize,
    use_color: bool,
}

impl EventPrinter {
    pub fn new(rx: EventReceiver, names: BTreeMap<String, String>) -> Self {
        let max_name_len = names.values().map(|n| n.len()).max().unwrap_or(0);
        Self {
            rx,
            names,
            max_name_len,
            use_color: std::io::stdout().is_terminal(),
        }
    }

    fn display_name(&self, project_id: &str) -> String {
        self.names
            .get(project_id)
            .cloned()
            .unwrap_or_else(|| project_id.to_string())
    }

    pub async fn run(mut self) {
        let mut color_map: BTreeMap<String, usize> = BTreeMap::new();
        let mut next_color = 0usize;

        loop {
            let event = match self.rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event printer lagged");
                    continue;
                }
            };

            match event {
                Event::LogLine {
                    project_id,
                    stream,
                    line,
                    ..
                } => {
                    let name = self.display_name(&project_id);
                    let color_idx = *color_map.entry(name.clone()).or_insert_with(|| {
                        let idx = next_color;
                        next_color = (next_color + 1) % PROJECT_COLORS.len();
                        idx
                    });

                    // Build the output line in a String buffer, then print
                    // atomically so interleaved projects stay line-coherent.
                    let mut buf = String::new();

                    if self.use_color {
                        let padding = self.max_name_len.saturating_sub(name.len());
                        for _ in 0..padding {
                            buf.push(' ');
                        }
                        buf.push_str(&PROJECT_COLORS[color_idx](&name));
                        buf.push_str(&format!(" {} ", "|".dimmed()));
                    } else {
                        buf.push_str(&format!(
                            "{:>width$} | ",
                            name,
                            width = self.max_name_len,
                        ));
                    }

                    if let Some(ref level) = detect_log_level(&line) {
                        buf.push_str(&format_level(level, self.use_color));
                    }

                    if self.use_color && stream == Stream::Stderr {
                        buf.push_str(&format!("{}", line.red()));
                    } else {
                        buf.push_str(&line);
                    }

                    println!("{}", buf);
                }
                Event::StatusChanged { project_id, status } => {
                    let name = self.display_name(&project_id);
                    if self.use_color {
                        println!(
                            "{}",
                            format!("{:>width$} | status -> {}", name, status, width = self.max_name_len)
                                .dimmed()
                        );
                    } else {
                        println!(
                            "{:>width$} | status -> {}",
                            name,
                            status,
                            width = self.max_name_len,
                        );
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
