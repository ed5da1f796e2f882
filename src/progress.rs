//! Conversion progress reporting.
//!
//! Reports observable progress during `optimake convert` so users see which
//! entry type is being resolved, parsed and joined, and how much is left.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a conversion run.
#[derive(Clone, Debug, PartialEq)]
pub enum ConvertProgressEvent {
    /// Source paths of an entry type are being opened and matched. Total unknown.
    Resolving { entry_type: String },
    /// Parsing locators: n processed out of total.
    Parsing {
        entry_type: String,
        n: u64,
        total: u64,
    },
    /// Properties are being joined from `tables` property tables.
    Joining { entry_type: String, tables: u64 },
    /// Output lines are being written.
    Writing { lines: u64 },
}

/// Reports conversion progress. Implementations write to stderr (human or JSON).
pub trait ConvertProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the conversion pipeline.
    fn report(&self, event: ConvertProgressEvent);
}

/// Human-friendly progress on stderr: "convert structures  parsing  120 / 1,500 items".
pub struct StderrProgress;

impl ConvertProgressReporter for StderrProgress {
    fn report(&self, event: ConvertProgressEvent) {
        let line = match &event {
            ConvertProgressEvent::Resolving { entry_type } => {
                format!("convert {}  resolving...\n", entry_type)
            }
            ConvertProgressEvent::Parsing {
                entry_type,
                n,
                total,
            } => format!(
                "convert {}  parsing  {} / {} items\n",
                entry_type,
                format_number(*n),
                format_number(*total)
            ),
            ConvertProgressEvent::Joining { entry_type, tables } => {
                format!("convert {}  joining  {} property tables\n", entry_type, tables)
            }
            ConvertProgressEvent::Writing { lines } => {
                format!("convert  writing  {} lines\n", format_number(*lines))
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ConvertProgressReporter for JsonProgress {
    fn report(&self, event: ConvertProgressEvent) {
        let obj = match &event {
            ConvertProgressEvent::Resolving { entry_type } => serde_json::json!({
                "event": "progress",
                "entry_type": entry_type,
                "phase": "resolving"
            }),
            ConvertProgressEvent::Parsing {
                entry_type,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "entry_type": entry_type,
                "phase": "parsing",
                "n": n,
                "total": total
            }),
            ConvertProgressEvent::Joining { entry_type, tables } => serde_json::json!({
                "event": "progress",
                "entry_type": entry_type,
                "phase": "joining",
                "tables": tables
            }),
            ConvertProgressEvent::Writing { lines } => serde_json::json!({
                "event": "progress",
                "phase": "writing",
                "lines": lines
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ConvertProgressReporter for NoProgress {
    fn report(&self, _event: ConvertProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Parse a `--progress` value. `auto` defers to [`default_for_tty`](Self::default_for_tty).
    pub fn from_flag(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::default_for_tty()),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            "off" | "none" => Some(ProgressMode::Off),
            _ => None,
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn ConvertProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_flags() {
        assert_eq!(ProgressMode::from_flag("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::from_flag("off"), Some(ProgressMode::Off));
        assert_eq!(ProgressMode::from_flag("human"), Some(ProgressMode::Human));
        assert!(ProgressMode::from_flag("auto").is_some());
        assert_eq!(ProgressMode::from_flag("loud"), None);
    }
}
