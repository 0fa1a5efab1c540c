//! Accuracy evaluation over labeled populations
//!
//! "Fresh" rows should classify as [`POSITIVE_LABEL`]; "bad" rows as
//! anything else. Scoring goes through [`decision::evaluate`], the routine
//! used for live scans.

use crate::atomic_write::write_atomic;
use crate::channels::FeatureRow;
use crate::decision::{self, DecisionConfig, POSITIVE_LABEL};
use crate::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Distance key for rows whose path has no `d<N>mm` component
pub const UNKNOWN_DISTANCE: &str = "unknown";

/// Feature row plus the file it came from
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledRow {
    pub features: FeatureRow,
    pub source: PathBuf,
}

impl LabeledRow {
    pub fn new(features: FeatureRow, source: impl Into<PathBuf>) -> Self {
        Self {
            features,
            source: source.into(),
        }
    }
}

/// Binary confusion counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Confusion {
    pub tp: usize,
    pub tn: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
}

impl Confusion {
    pub fn total(&self) -> usize {
        self.tp + self.tn + self.fp + self.fn_
    }

    pub fn correct(&self) -> usize {
        self.tp + self.tn
    }

    /// Fraction classified correctly; 0 for an empty matrix
    pub fn accuracy(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            n => self.correct() as f64 / n as f64,
        }
    }

    fn record(&mut self, should_be_positive: bool, predicted_positive: bool) {
        match (should_be_positive, predicted_positive) {
            (true, true) => self.tp += 1,
            (true, false) => self.fn_ += 1,
            (false, true) => self.fp += 1,
            (false, false) => self.tn += 1,
        }
    }
}

/// Scores for one decision config over a fresh and a bad population
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracyReport {
    #[serde(flatten)]
    pub overall: Confusion,
    pub n: usize,
    pub accuracy: f64,
    pub per_distance: BTreeMap<String, Confusion>,
    /// Files with at least one wrong row, sorted
    pub misclassified: Vec<PathBuf>,
}

/// First path component shaped like `d20mm`, or `unknown`
pub fn distance_key(path: &Path) -> String {
    path.components()
        .filter_map(|c| c.as_os_str().to_str())
        .find(|part| {
            part.len() > 3
                && part.starts_with('d')
                && part.ends_with("mm")
                && part[1..part.len() - 2].chars().all(|c| c.is_ascii_digit())
        })
        .unwrap_or(UNKNOWN_DISTANCE)
        .to_string()
}

/// Score `config` on both populations
pub fn score_populations(
    fresh: &[LabeledRow],
    bad: &[LabeledRow],
    config: &DecisionConfig,
) -> AccuracyReport {
    let mut overall = Confusion::default();
    let mut per_distance: BTreeMap<String, Confusion> = BTreeMap::new();
    let mut misclassified = BTreeSet::new();

    let labeled = fresh
        .iter()
        .map(|row| (row, true))
        .chain(bad.iter().map(|row| (row, false)));

    for (row, should_be_positive) in labeled {
        let result = decision::evaluate(&row.features, config);
        let predicted_positive = result.label == POSITIVE_LABEL;

        overall.record(should_be_positive, predicted_positive);
        per_distance
            .entry(distance_key(&row.source))
            .or_default()
            .record(should_be_positive, predicted_positive);

        if should_be_positive != predicted_positive {
            misclassified.insert(row.source.clone());
        }
    }

    AccuracyReport {
        overall,
        n: overall.total(),
        accuracy: overall.accuracy(),
        per_distance,
        misclassified: misclassified.into_iter().collect(),
    }
}

/// Write any report as pretty JSON
pub fn write_json_report<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(report)?;
    write_atomic(path, text.as_bytes())
}
