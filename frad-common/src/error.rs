//! Common error types for FRAD

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for FRAD operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the FRAD crates
#[derive(Error, Debug)]
pub enum Error {
    /// No sensor back-end produced a complete channel reading
    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    /// A required channel or feature mapping could not be resolved
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A stage produced a missing or empty required artifact
    #[error("Stage '{stage}' contract violation: {detail}")]
    StageContractViolation { stage: String, detail: String },

    /// A configuration document exists but has the wrong shape
    #[error("Malformed document {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Autotuner could not propose meaningful thresholds
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Tabular file read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Build a `Malformed` error for `path`
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Build a `StageContractViolation` error
    pub fn contract(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::StageContractViolation {
            stage: stage.into(),
            detail: detail.into(),
        }
    }
}
