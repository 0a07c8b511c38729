//! Execution error types

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("{kind} operation that started at {} is still running", fmt_time(.started_at))]
    OperationInProgress {
        kind: String,
        started_at: Option<DateTime<Utc>>,
    },

    #[error("apply failed: {summary}")]
    ApplyFailed { summary: String, output: String },

    #[error("destroy failed: {summary}")]
    DestroyFailed { summary: String, output: String },

    #[error("refresh failed: {summary}")]
    RefreshFailed { summary: String, output: String },

    #[error("plan failed: {summary}")]
    PlanFailed { summary: String, output: String },

    #[error("import failed: {summary}")]
    ImportFailed { summary: String, output: String },

    #[error("cannot find the change summary line in plan log: {0}")]
    ChangeSummaryMissing(String),

    #[error("native provider did not announce its address within {0:?}")]
    ReattachTimeout(Duration),

    #[error("native provider exited before it could be used: {0}")]
    ProviderExited(String),

    #[error("native provider has not been started")]
    ProviderNotStarted,

    #[error(
        "native provider reuse budget has been exceeded: handle: {handle}, invocation count: {invocation_count}, ttl: {ttl}"
    )]
    ReuseBudgetExceeded {
        handle: String,
        invocation_count: u64,
        ttl: u64,
    },

    #[error("workspace setup failed: {0}")]
    Workspace(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("State error: {0}")]
    Core(#[from] tfbridge_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn fmt_time(t: &Option<DateTime<Utc>>) -> String {
    t.map_or_else(|| "an unknown time".to_string(), |t| t.to_rfc3339())
}

impl ExecError {
    pub fn is_operation_in_progress(&self) -> bool {
        matches!(self, ExecError::OperationInProgress { .. })
    }

    pub fn is_apply_failed(&self) -> bool {
        matches!(self, ExecError::ApplyFailed { .. })
    }

    pub fn is_destroy_failed(&self) -> bool {
        matches!(self, ExecError::DestroyFailed { .. })
    }

    pub fn is_refresh_failed(&self) -> bool {
        matches!(self, ExecError::RefreshFailed { .. })
    }

    pub fn is_plan_failed(&self) -> bool {
        matches!(self, ExecError::PlanFailed { .. })
    }

    pub fn is_reuse_budget_exceeded(&self) -> bool {
        matches!(self, ExecError::ReuseBudgetExceeded { .. })
    }

    /// Raw (filtered) tool output carried by invocation failures
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecError::ApplyFailed { output, .. }
            | ExecError::DestroyFailed { output, .. }
            | ExecError::RefreshFailed { output, .. }
            | ExecError::PlanFailed { output, .. }
            | ExecError::ImportFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
