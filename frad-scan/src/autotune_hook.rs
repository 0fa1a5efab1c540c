//! Live threshold adjustment from the `AUTOTUNE` environment variable
//!
//! `AUTOTUNE="<fruit>:<feature>:<op>:<margin>"` sets the threshold of one
//! feature from the index value measured in the current run, then saves
//! the calibration (with backup) before scoring. `<fruit>` may be `*`.

use crate::error::Result;
use frad_common::calibration::{save_calibration, CalibrationProfile};
use frad_common::decision::ThresholdOverrides;
use frad_common::profiles::same_fruit;
use frad_common::{Error, FeatureRow, Operator, Threshold};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// Parsed `AUTOTUNE` request
#[derive(Debug, Clone, PartialEq)]
pub struct AutotuneRequest {
    pub fruit: String,
    pub feature: String,
    pub operator: Operator,
    pub margin: f64,
}

/// What the hook changed, for the result document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutotuneApplied {
    pub feature: String,
    pub operator: Operator,
    pub measured: f64,
    pub threshold: Threshold,
    pub calibration: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
}

impl FromStr for AutotuneRequest {
    type Err = Error;

    fn from_str(s: &str) -> frad_common::Result<Self> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        let [fruit, feature, op, margin] = parts.as_slice() else {
            return Err(Error::InvalidInput(format!(
                "AUTOTUNE must be <fruit>:<feature>:<op>:<margin>, got '{}'",
                s
            )));
        };
        if fruit.is_empty() || feature.is_empty() {
            return Err(Error::InvalidInput(format!(
                "AUTOTUNE fruit and feature must be non-empty, got '{}'",
                s
            )));
        }
        let margin: f64 = margin
            .parse()
            .map_err(|_| Error::InvalidInput(format!("AUTOTUNE margin '{}' is not a number", margin)))?;
        if !margin.is_finite() || margin < 0.0 {
            return Err(Error::InvalidInput(format!(
                "AUTOTUNE margin must be a non-negative number, got {}",
                margin
            )));
        }

        Ok(Self {
            fruit: fruit.to_string(),
            feature: feature.to_string(),
            operator: op.parse()?,
            margin,
        })
    }
}

impl AutotuneRequest {
    /// `*` or the same fruit, alias groups included
    pub fn applies_to(&self, fruit: &str) -> bool {
        self.fruit == "*" || same_fruit(&self.fruit, fruit)
    }

    /// Threshold placed `margin` on the accepting side of `value`
    pub fn threshold_for(&self, value: f64) -> Threshold {
        match self.operator {
            Operator::Ge | Operator::Gt => Threshold::Scalar(value - self.margin),
            Operator::Le | Operator::Lt => Threshold::Scalar(value + self.margin),
            Operator::Between => Threshold::Range([value - self.margin, value + self.margin]),
        }
    }

    /// Update and save `profile` from the measured `row`
    ///
    /// Returns `None` when the request names a fruit other than `fruit` or
    /// the feature was not measured; `profile` is left unchanged then.
    pub fn apply(
        &self,
        fruit: &str,
        row: &FeatureRow,
        profile: &mut CalibrationProfile,
        calibration_path: &Path,
    ) -> Result<Option<AutotuneApplied>> {
        if !self.applies_to(fruit) {
            info!(requested = %self.fruit, fruit, "Autotune request is for another fruit");
            return Ok(None);
        }
        let Some(measured) = row.get(&self.feature) else {
            warn!(feature = %self.feature, "Autotune feature not measured, nothing tuned");
            return Ok(None);
        };

        let threshold = self.threshold_for(measured);
        let mut overrides = ThresholdOverrides::new();
        overrides.insert(self.feature.clone(), self.operator, threshold);

        let mut updated = profile.clone();
        let decision = updated.decision.take().unwrap_or_default();
        updated.decision = Some(decision.with_overrides(&overrides)?);
        let backup = save_calibration(calibration_path, &updated)?;
        *profile = updated;

        info!(
            feature = %self.feature,
            operator = %self.operator,
            measured,
            threshold = %threshold,
            path = %calibration_path.display(),
            "Autotune threshold applied"
        );

        Ok(Some(AutotuneApplied {
            feature: self.feature.clone(),
            operator: self.operator,
            measured,
            threshold,
            calibration: calibration_path.to_path_buf(),
            backup,
        }))
    }
}
