//! Core error types

use thiserror::Error;

/// Errors raised while reading or interpreting persisted state
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("State file not found: {0}")]
    StateNotFound(String),

    #[error("Unsupported state version {found}, expected {expected}")]
    UnsupportedStateVersion { found: u64, expected: u64 },

    #[error("State must contain at most one resource, found {0}")]
    TooManyResources(usize),

    #[error("Resource {resource} must contain exactly one instance, found {found}")]
    InstanceCount { resource: String, found: usize },

    #[error("Invalid private metadata: {0}")]
    InvalidPrivate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
