//! Repeatability and separation checks on index rows
//!
//! Repeatability: coefficient of variation (population stdev / mean) of each
//! index across repeated runs of one spot. Separation: absolute difference
//! of index means between two groups.

use crate::channels::{FeatureRow, INDEX_KEYS};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Maximum coefficient of variation for a stable index
pub fn cv_limit(index: &str) -> f64 {
    match index {
        "r_over_g" => 0.10,
        _ => 0.15,
    }
}

/// Minimum mean difference for two groups to count as separated
pub fn delta_minimum(index: &str) -> Option<f64> {
    match index {
        "r_over_g" => Some(1.2),
        "nir_over_red" => Some(0.10),
        "green_drop" => Some(0.08),
        "y_over_g" => Some(0.10),
        _ => None,
    }
}

fn values(rows: &[FeatureRow], index: &str) -> Vec<f64> {
    rows.iter().filter_map(|r| r.get(index)).collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Population coefficient of variation; `None` for fewer than two values or a zero mean
pub fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    if values.len() <= 1 {
        return None;
    }
    let m = mean(values)?;
    if m == 0.0 {
        return None;
    }
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt() / m)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepeatMetric {
    pub mean: Option<f64>,
    pub cv: Option<f64>,
    pub threshold: f64,
    pub pass: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepeatabilityReport {
    pub mode: &'static str,
    pub spot: String,
    pub n: usize,
    pub metrics: BTreeMap<String, RepeatMetric>,
    pub files: Vec<PathBuf>,
}

impl RepeatabilityReport {
    pub fn all_pass(&self) -> bool {
        self.metrics.values().all(|m| m.pass)
    }
}

/// CV of every index over repeated runs of `spot`
pub fn repeatability(spot: &str, rows: &[FeatureRow], files: Vec<PathBuf>) -> RepeatabilityReport {
    let metrics = INDEX_KEYS
        .iter()
        .map(|&key| {
            let series = values(rows, key);
            let cv = coefficient_of_variation(&series);
            let threshold = cv_limit(key);
            let metric = RepeatMetric {
                mean: mean(&series),
                cv,
                threshold,
                pass: cv.map_or(false, |c| c <= threshold),
            };
            (key.to_string(), metric)
        })
        .collect();

    RepeatabilityReport {
        mode: "repeatability",
        spot: spot.to_string(),
        n: rows.len(),
        metrics,
        files,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub n: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeparationMetric {
    pub delta: Option<f64>,
    pub threshold: Option<f64>,
    pub pass: bool,
    pub mean_a: Option<f64>,
    pub mean_b: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeparationReport {
    pub mode: &'static str,
    pub a: GroupSummary,
    pub b: GroupSummary,
    pub deltas: BTreeMap<String, SeparationMetric>,
}

/// Absolute mean difference of every index between groups A and B
pub fn separation(
    name_a: &str,
    a: &[FeatureRow],
    name_b: &str,
    b: &[FeatureRow],
) -> SeparationReport {
    let deltas = INDEX_KEYS
        .iter()
        .map(|&key| {
            let mean_a = mean(&values(a, key));
            let mean_b = mean(&values(b, key));
            let delta = mean_a.zip(mean_b).map(|(x, y)| (x - y).abs());
            let threshold = delta_minimum(key);
            let metric = SeparationMetric {
                delta,
                threshold,
                pass: matches!((delta, threshold), (Some(d), Some(t)) if d >= t),
                mean_a,
                mean_b,
            };
            (key.to_string(), metric)
        })
        .collect();

    SeparationReport {
        mode: "separation",
        a: GroupSummary {
            name: name_a.to_string(),
            n: a.len(),
        },
        b: GroupSummary {
            name: name_b.to_string(),
            n: b.len(),
        },
        deltas,
    }
}
