//! # FRAD Common Library
//!
//! Shared code for the FRAD ripeness scanner including:
//! - Channel math (normalization, smoothing, ripeness indices)
//! - Calibration documents and fruit profiles
//! - Rule-based decision engine and accuracy evaluation
//! - Offline threshold autotuning
//! - Index-row files and stability analysis

pub mod atomic_write;
pub mod autotune;
pub mod calibration;
pub mod channels;
pub mod decision;
pub mod error;
pub mod evaluation;
pub mod index_log;
pub mod profiles;
pub mod stability;

pub use channels::{BandMap, Channel, ChannelReading, FeatureRow, IndexRow};
pub use decision::{DecisionConfig, DecisionResult, Operator, Rule, Threshold};
pub use error::{Error, Result};
