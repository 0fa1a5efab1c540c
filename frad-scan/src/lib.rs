//! FRAD scanner
//!
//! Runs one ripeness scan per invocation: photo, fruit identification,
//! spectral acquisition, normalization, calibration, index derivation and
//! rule scoring, each step wrapped by the [`stage::StageRunner`].

pub mod autotune_hook;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod result;
pub mod stage;

pub use config::ScanConfig;
pub use error::{Result, ScanError};
pub use pipeline::{Pipeline, PipelineState, ScanOptions};
pub use result::PipelineResult;
