//! Error types for frad-scan

use thiserror::Error;

/// Scan pipeline errors
#[derive(Debug, Error)]
pub enum ScanError {
    /// Stage did not finish within its budget and had no fallback
    #[error("Stage '{stage}' timed out after {timeout_ms} ms")]
    StageTimeout { stage: String, timeout_ms: u64 },

    /// Fatal stage failed
    #[error("Stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: Box<ScanError>,
    },

    /// External collaborator (camera, classifier, sensor command) failed
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// Blocking task panicked or was cancelled
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// frad-common error
    #[error(transparent)]
    Common(#[from] frad_common::Error),
}

impl ScanError {
    /// True when the error is an artifact contract violation, which is always fatal
    pub fn is_contract_violation(&self) -> bool {
        match self {
            ScanError::Common(frad_common::Error::StageContractViolation { .. }) => true,
            ScanError::StageFailed { source, .. } => source.is_contract_violation(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
