//! Operation tracking
//!
//! An [`Operation`] records whether a provisioning action is in flight for a
//! resource. It is the single gate that keeps two actions from running at the
//! same time, and it keeps the outcome of a finished action around until a
//! caller consumes it with [`Operation::flush`] or [`Operation::clear`].

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Outcome error attached to a finished operation
pub type OperationError = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Default)]
struct OperationState {
    kind: String,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    last_error: Option<OperationError>,
}

impl OperationState {
    fn is_running(&self) -> bool {
        self.start_time.is_some() && self.end_time.is_none()
    }
}

/// Point-in-time copy of an operation's bookkeeping fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationSnapshot {
    pub kind: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl OperationSnapshot {
    pub fn is_running(&self) -> bool {
        self.start_time.is_some() && self.end_time.is_none()
    }
}

/// Guarded state machine for a single asynchronous provisioning action
#[derive(Default)]
pub struct Operation {
    state: RwLock<OperationState>,
}

impl Operation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of an operation of the given kind.
    ///
    /// Returns `false` and leaves every field untouched when an operation is
    /// already running.
    pub fn mark_start(&self, kind: impl Into<String>) -> bool {
        let mut state = self.state.write();
        if state.is_running() {
            return false;
        }
        state.kind = kind.into();
        state.start_time = Some(Utc::now());
        state.end_time = None;
        true
    }

    /// Marks the end of the current operation. Kind and error are kept.
    pub fn mark_end(&self) {
        self.state.write().end_time = Some(Utc::now());
    }

    /// Resets the operation, dropping the last error unless asked to keep it.
    pub fn clear(&self, preserve_error: bool) {
        let mut state = self.state.write();
        state.kind.clear();
        state.start_time = None;
        state.end_time = None;
        if !preserve_error {
            state.last_error = None;
        }
    }

    /// Equivalent to `clear(false)`
    pub fn flush(&self) {
        self.clear(false);
    }

    pub fn is_running(&self) -> bool {
        self.state.read().is_running()
    }

    pub fn is_ended(&self) -> bool {
        self.state.read().end_time.is_some()
    }

    pub fn kind(&self) -> String {
        self.state.read().kind.clone()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.state.read().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.state.read().end_time
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        let state = self.state.read();
        OperationSnapshot {
            kind: state.kind.clone(),
            start_time: state.start_time,
            end_time: state.end_time,
        }
    }

    /// Attaches the outcome of the just-finished operation
    pub fn set_error(&self, err: Option<OperationError>) {
        self.state.write().last_error = err;
    }

    pub fn error(&self) -> Option<OperationError> {
        self.state.read().last_error.clone()
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Operation")
            .field("kind", &state.kind)
            .field("start_time", &state.start_time)
            .field("end_time", &state.end_time)
            .field("last_error", &state.last_error.as_ref().map(|e| e.to_string()))
            .finish()
    }
}
