//! Error taxonomy for the conversion pipeline.
//!
//! Two families of errors exist:
//!
//! | Family | Type | Effect |
//! |--------|------|--------|
//! | Fatal | [`MakerError`] | Aborts the run, no output file is written |
//! | Per-item | [`ItemError`] | Offending item is dropped, run continues |
//!
//! Fatal errors travel inside `anyhow::Error` through the orchestration
//! layer and can be recovered with `downcast_ref::<MakerError>()`.
//! Per-item errors are accumulated in a [`RunReport`].

use std::path::PathBuf;

use thiserror::Error;

/// Number of example issues printed per kind in the run summary.
const SUMMARY_EXAMPLES: usize = 5;

#[derive(Debug, Error)]
pub enum MakerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unsupported config version {found:?}: expected a version of the form X.Y.Z")]
    UnsupportedConfigVersion { found: Option<String> },

    #[error("source not found: {path} ({reason})")]
    SourceNotFound { path: String, reason: String },

    #[error("no files match pattern '{pattern}' in {file}")]
    NoMatch { file: String, pattern: String },

    #[error("identifier collision: '{first}' and '{second}' both map to id '{id}'")]
    IdentifierCollision {
        id: String,
        first: String,
        second: String,
    },

    #[error("none of the {attempted} {entry_type} items could be parsed")]
    NoEntriesParsed { entry_type: String, attempted: usize },

    #[error("required property '{name}' of {entry_type} was not found in any property source")]
    MissingColumn { entry_type: String, name: String },

    #[error("not overwriting existing file at {}", .0.display())]
    OutputExists(PathBuf),
}

/// A recoverable problem with one item (file, row, value or traversal).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ItemError {
    #[error("could not parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("property row '{key}' in {source_path} matches no entry")]
    UnresolvedPropertyRow { source_path: String, key: String },

    #[error("entry '{id}': value {value:?} of '{property}' is not a valid {expected}")]
    TypeCoercion {
        id: String,
        property: String,
        value: String,
        expected: String,
    },

    #[error("entry '{id}': query for '{property}' failed: {reason}")]
    Traversal {
        id: String,
        property: String,
        reason: String,
    },
}

impl ItemError {
    pub fn kind(&self) -> &'static str {
        match self {
            ItemError::Parse { .. } => "parse",
            ItemError::UnresolvedPropertyRow { .. } => "unresolved property row",
            ItemError::TypeCoercion { .. } => "type coercion",
            ItemError::Traversal { .. } => "graph traversal",
        }
    }
}

/// Run-level accumulator of per-item errors.
#[derive(Debug, Default, Clone)]
pub struct RunReport {
    issues: Vec<ItemError>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an issue and emit it as a warning.
    pub fn record(&mut self, issue: ItemError) {
        tracing::warn!(kind = issue.kind(), "{}", issue);
        self.issues.push(issue);
    }

    pub fn issues(&self) -> &[ItemError] {
        &self.issues
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.issues.iter().filter(|i| i.kind() == kind).count()
    }

    /// Human-readable summary: counts per kind and the first few examples.
    pub fn summary(&self) -> Vec<String> {
        let mut kinds: Vec<&'static str> = Vec::new();
        for issue in &self.issues {
            if !kinds.contains(&issue.kind()) {
                kinds.push(issue.kind());
            }
        }

        let mut lines = Vec::new();
        for kind in kinds {
            let matching: Vec<&ItemError> =
                self.issues.iter().filter(|i| i.kind() == kind).collect();
            lines.push(format!("{} {} issue(s)", matching.len(), kind));
            for issue in matching.iter().take(SUMMARY_EXAMPLES) {
                lines.push(format!("  - {}", issue));
            }
            if matching.len() > SUMMARY_EXAMPLES {
                lines.push(format!("  ... and {} more", matching.len() - SUMMARY_EXAMPLES));
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_issue(n: usize) -> ItemError {
        ItemError::Parse {
            path: format!("data.zip/{}.cif", n),
            reason: "bad cell".to_string(),
        }
    }

    #[test]
    fn summary_groups_by_kind_and_truncates() {
        let mut report = RunReport::new();
        for n in 0..7 {
            report.record(parse_issue(n));
        }
        report.record(ItemError::UnresolvedPropertyRow {
            source_path: "props.csv".to_string(),
            key: "x".to_string(),
        });

        let lines = report.summary();
        assert_eq!(lines[0], "7 parse issue(s)");
        assert!(lines.contains(&"  ... and 2 more".to_string()));
        assert!(lines.contains(&"1 unresolved property row issue(s)".to_string()));
        assert_eq!(report.count("parse"), 7);
    }

    #[test]
    fn empty_report_has_no_summary() {
        let report = RunReport::new();
        assert!(report.is_empty());
        assert!(report.summary().is_empty());
    }
}
