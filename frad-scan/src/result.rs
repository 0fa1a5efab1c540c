//! Terminal record of one scan

use crate::autotune_hook::AutotuneApplied;
use crate::error::Result;
use crate::stage::StageRecord;
use chrono::{DateTime, Local};
use frad_common::atomic_write::write_atomic;
use frad_common::decision::Provenance;
use frad_common::IndexRow;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub timestamp: DateTime<Local>,
    pub duration_ms: u64,
    pub image: ImageSummary,
    pub fruit: FruitSummary,
    pub profile: ProfileSummary,
    pub files: ArtifactPaths,
    pub indices: IndexRow,
    pub decision: DecisionSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autotune: Option<AutotuneApplied>,
    /// Stage timeline up to the write; the persist stage itself is not
    /// included since the record is written from inside it
    pub stages: Vec<StageRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSummary {
    pub path: PathBuf,
    pub available: bool,
    pub recaptured: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FruitSummary {
    pub fruit: String,
    pub confidence: f64,
    pub model: String,
    /// Set by `FORCE_FRUIT`; classification was skipped
    pub forced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileSummary {
    pub requested: String,
    pub matched: Option<String>,
    pub integration_time_ms: u32,
    pub gain: u32,
    pub samples: u32,
    pub calibration: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactPaths {
    pub raw: PathBuf,
    pub normalized: PathBuf,
    pub calibrated: PathBuf,
    pub index_log: PathBuf,
    pub result: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionSummary {
    pub label: String,
    pub confidence: f64,
    pub votes: Vec<String>,
    pub provenance: Provenance,
    pub rules: Vec<String>,
    pub overrides_attached: bool,
    /// The scoring attempt with overrides failed and a bare retry decided
    pub retried_without_overrides: bool,
}

impl PipelineResult {
    /// Write once to `files.result`
    pub fn write(&self) -> Result<&Path> {
        let path = self.files.result.as_path();
        let text = serde_json::to_string_pretty(self).map_err(frad_common::Error::from)?;
        write_atomic(path, text.as_bytes())?;
        info!(path = %path.display(), label = %self.decision.label, "Result written");
        Ok(path)
    }
}
