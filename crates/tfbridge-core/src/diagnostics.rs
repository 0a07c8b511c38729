//! Machine-readable tool log parsing
//!
//! With `-json` the provisioning tool writes one JSON object per line. Two
//! kinds of records matter here: the `change_summary` record a plan emits,
//! and error-level records carrying a diagnostic.

use serde::{Deserialize, Serialize};

const CHANGE_SUMMARY: &str = "change_summary";
const LEVEL_ERROR: &str = "error";

/// One line of the structured log
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "@level", default)]
    pub level: String,

    #[serde(rename = "@message", default)]
    pub message: String,

    #[serde(rename = "type", default)]
    pub record_type: String,

    #[serde(default)]
    pub diagnostic: Option<Diagnostic>,

    #[serde(default)]
    pub changes: Option<ChangeSummary>,
}

/// Diagnostic attached to a log record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(default)]
    pub severity: String,

    #[serde(default)]
    pub summary: String,

    #[serde(default)]
    pub detail: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.summary)
        } else {
            write!(f, "{}: {}", self.summary, self.detail)
        }
    }
}

/// Resource counts from a plan's `change_summary` record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    #[serde(default)]
    pub add: u64,

    #[serde(default)]
    pub change: u64,

    #[serde(default)]
    pub import: u64,

    #[serde(default)]
    pub remove: u64,
}

impl std::fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to import, {} to remove",
            self.add, self.change, self.import, self.remove
        )
    }
}

/// Iterates over the lines of `out` that parse as log records
pub fn records(out: &str) -> impl Iterator<Item = LogRecord> + '_ {
    out.lines()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .filter_map(|l| serde_json::from_str::<LogRecord>(l).ok())
}

/// Finds the first `change_summary` record
pub fn find_change_summary(out: &str) -> Option<ChangeSummary> {
    records(out)
        .find(|r| r.record_type == CHANGE_SUMMARY)
        .map(|r| r.changes.unwrap_or_default())
}

/// Collects the diagnostics of every error-level record
pub fn error_diagnostics(out: &str) -> Vec<Diagnostic> {
    records(out)
        .filter(|r| r.level == LEVEL_ERROR)
        .map(|r| {
            r.diagnostic.unwrap_or(Diagnostic {
                severity: LEVEL_ERROR.to_string(),
                summary: r.message,
                detail: String::new(),
            })
        })
        .collect()
}

/// Builds a one-line description of a failed tool invocation.
///
/// Falls back to the trimmed raw output when no error diagnostics exist.
pub fn failure_summary(out: &str) -> String {
    let diags = error_diagnostics(out);
    if diags.is_empty() {
        return out.trim().to_string();
    }
    diags
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_change_summary() {
        let out = concat!(
            r#"{"@level":"info","@message":"Terraform 1.5.7","type":"version"}"#,
            "\n",
            r#"{"@level":"info","@message":"Plan: 1 to add, 0 to change, 0 to destroy.","changes":{"add":1,"change":0,"import":0,"remove":0,"operation":"plan"},"type":"change_summary"}"#,
            "\n"
        );
        let summary = find_change_summary(out).unwrap();
        assert_eq!(summary.add, 1);
        assert_eq!(summary.change, 0);
        assert_eq!(
            summary.to_string(),
            "1 to add, 0 to change, 0 to import, 0 to remove"
        );
    }

    #[test]
    fn test_missing_change_summary() {
        let out = "Initializing...\n{\"@level\":\"info\",\"type\":\"version\"}\n";
        assert!(find_change_summary(out).is_none());
    }

    #[test]
    fn test_error_diagnostics() {
        let out = concat!(
            "plain text line\n",
            r#"{"@level":"error","@message":"Error: creating bucket","diagnostic":{"severity":"error","summary":"creating bucket","detail":"AccessDenied"},"type":"diagnostic"}"#,
            "\n",
            r#"{"@level":"error","@message":"Error: quota exceeded","type":"diagnostic"}"#,
            "\n",
            r#"{"@level":"warn","@message":"deprecated","diagnostic":{"severity":"warning","summary":"deprecated","detail":""},"type":"diagnostic"}"#,
        );
        let diags = error_diagnostics(out);
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].to_string(), "creating bucket: AccessDenied");
        assert_eq!(diags[1].summary, "Error: quota exceeded");

        assert_eq!(
            failure_summary(out),
            "creating bucket: AccessDenied; Error: quota exceeded"
        );
    }

    #[test]
    fn test_failure_summary_falls_back_to_raw() {
        assert_eq!(failure_summary("  exit status 1\n"), "exit status 1");
    }
}
