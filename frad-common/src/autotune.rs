//! Offline threshold search
//!
//! Candidate cut points for each feature come from quantiles of the fresh
//! and bad populations, concentrated where the two distributions meet.
//! [`search`] walks the Cartesian product of candidates in a fixed order and
//! keeps the combination with the best accuracy, then the fewest false
//! positives; the first combination reaching a score keeps it.

use crate::calibration::{load_calibration, save_calibration, CalibrationProfile};
use crate::decision::{DecisionConfig, Operator, Rule, Threshold, DEFAULT_FALLBACK, POSITIVE_LABEL};
use crate::evaluation::{score_populations, AccuracyReport, LabeledRow};
use crate::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Quantile levels sampled from each population
pub const QUANTILE_LEVELS: [f64; 11] = [
    0.05, 0.10, 0.20, 0.30, 0.40, 0.50, 0.60, 0.70, 0.80, 0.90, 0.95,
];

/// A feature to tune and the comparison its rule will use
///
/// `>=`/`>` features are expected to run higher on the fresh population,
/// `<=`/`<` features lower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunableFeature {
    pub name: String,
    pub operator: Operator,
}

impl TunableFeature {
    pub fn new(name: impl Into<String>, operator: Operator) -> Result<Self> {
        if operator == Operator::Between {
            return Err(Error::InvalidInput(
                "autotune supports scalar operators only".to_string(),
            ));
        }
        Ok(Self {
            name: name.into(),
            operator,
        })
    }

    fn fresh_runs_higher(&self) -> bool {
        matches!(self.operator, Operator::Ge | Operator::Gt)
    }
}

/// `y_over_g >=`, `r_over_g >=`, and with `use_nir` also `nir_over_red <=`
pub fn default_feature_space(use_nir: bool) -> Vec<TunableFeature> {
    let mut space = vec![
        TunableFeature {
            name: "y_over_g".to_string(),
            operator: Operator::Ge,
        },
        TunableFeature {
            name: "r_over_g".to_string(),
            operator: Operator::Ge,
        },
    ];
    if use_nir {
        space.push(TunableFeature {
            name: "nir_over_red".to_string(),
            operator: Operator::Le,
        });
    }
    space
}

/// Linear-interpolated quantiles of `values` at each level
///
/// Empty input yields NaN at every level.
pub fn quantiles(values: &[f64], levels: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return vec![f64::NAN; levels.len()];
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();

    levels
        .iter()
        .map(|&q| {
            let pos = (n - 1) as f64 * q;
            let lo = pos.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            let t = pos - lo as f64;
            sorted[lo] * (1.0 - t) + sorted[hi] * t
        })
        .collect()
}

fn feature_values(rows: &[LabeledRow], feature: &str) -> Vec<f64> {
    rows.iter().filter_map(|r| r.features.get(feature)).collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Candidate thresholds for one feature, sorted and deduplicated
///
/// For a `>=` feature: midpoints between the fresh low tail (q10/q20/q30)
/// and the bad high tail (q90/q80/q70), the midpoint of the means, and the
/// tail quantiles themselves. `<=` features mirror the tails.
///
/// `InsufficientData` when either population has no value for the feature
/// or the candidates collapse to a single point.
pub fn propose_candidates(
    fresh: &[LabeledRow],
    bad: &[LabeledRow],
    feature: &TunableFeature,
) -> Result<Vec<f64>> {
    let f = feature_values(fresh, &feature.name);
    let b = feature_values(bad, &feature.name);
    if f.is_empty() || b.is_empty() {
        return Err(Error::InsufficientData(format!(
            "no '{}' values in the {} population",
            feature.name,
            if f.is_empty() { "fresh" } else { "bad" }
        )));
    }

    let fq = quantiles(&f, &QUANTILE_LEVELS);
    let bq = quantiles(&b, &QUANTILE_LEVELS);

    // (low tail, high tail) index pairs into QUANTILE_LEVELS: q10/q90, q20/q80, q30/q70
    let pairs = [(1usize, 9usize), (2, 8), (3, 7)];
    let mut candidates: Vec<f64> = Vec::new();

    if feature.fresh_runs_higher() {
        candidates.extend(pairs.iter().map(|&(lo, hi)| (fq[lo] + bq[hi]) / 2.0));
        candidates.push((mean(&f) + mean(&b)) / 2.0);
        candidates.extend(&fq[1..4]);
        candidates.extend(&bq[7..10]);
    } else {
        candidates.extend(pairs.iter().map(|&(lo, hi)| (fq[hi] + bq[lo]) / 2.0));
        candidates.push((mean(&f) + mean(&b)) / 2.0);
        candidates.extend(&fq[7..10]);
        candidates.extend(&bq[1..4]);
    }

    candidates.retain(|v| v.is_finite());
    candidates.sort_by(f64::total_cmp);
    candidates.dedup();

    if candidates.len() < 2 {
        return Err(Error::InsufficientData(format!(
            "'{}' has no variability across the populations",
            feature.name
        )));
    }
    debug!(feature = %feature.name, candidates = ?candidates, "Candidate thresholds");
    Ok(candidates)
}

/// Best thresholds found by [`search`]
#[derive(Debug, Clone, Serialize)]
pub struct TuneOutcome {
    pub thresholds: Vec<(TunableFeature, f64)>,
    pub report: AccuracyReport,
    pub combinations: usize,
}

impl TuneOutcome {
    /// Decision config with one positive-vote rule per tuned feature
    pub fn to_decision_config(&self) -> DecisionConfig {
        thresholds_to_config(&self.thresholds)
    }
}

fn thresholds_to_config(thresholds: &[(TunableFeature, f64)]) -> DecisionConfig {
    DecisionConfig {
        rules: thresholds
            .iter()
            .map(|(feature, value)| {
                Rule::new(
                    feature.name.clone(),
                    feature.operator,
                    Threshold::Scalar(*value),
                    POSITIVE_LABEL,
                )
            })
            .collect(),
        fallback: DEFAULT_FALLBACK.to_string(),
    }
}

/// Exhaustive grid search over per-feature candidates
///
/// Combinations are visited in lexicographic order of the sorted candidate
/// lists, last feature fastest. Scores compare (correct rows, fewer false
/// positives); only a strictly better score replaces the current best.
pub fn search(
    fresh: &[LabeledRow],
    bad: &[LabeledRow],
    space: &[TunableFeature],
) -> Result<TuneOutcome> {
    if fresh.is_empty() || bad.is_empty() {
        return Err(Error::InsufficientData(format!(
            "need both populations (fresh: {}, bad: {})",
            fresh.len(),
            bad.len()
        )));
    }
    if space.is_empty() {
        return Err(Error::InvalidInput("empty feature space".to_string()));
    }

    let grids = space
        .iter()
        .map(|feature| propose_candidates(fresh, bad, feature))
        .collect::<Result<Vec<_>>>()?;

    let mut cursor = vec![0usize; grids.len()];
    let mut best: Option<((usize, std::cmp::Reverse<usize>), Vec<f64>, AccuracyReport)> = None;
    let mut combinations = 0usize;

    loop {
        let values: Vec<f64> = cursor.iter().zip(&grids).map(|(&i, g)| g[i]).collect();
        let thresholds: Vec<(TunableFeature, f64)> =
            space.iter().cloned().zip(values.iter().copied()).collect();
        let report = score_populations(fresh, bad, &thresholds_to_config(&thresholds));
        combinations += 1;

        let score = (report.overall.correct(), std::cmp::Reverse(report.overall.fp));
        if best.as_ref().map_or(true, |(s, _, _)| score > *s) {
            best = Some((score, values, report));
        }

        if !advance(&mut cursor, &grids) {
            break;
        }
    }

    let (_, values, report) = best.ok_or_else(|| {
        Error::InsufficientData("no threshold combination evaluated".to_string())
    })?;

    info!(
        combinations,
        accuracy = report.accuracy,
        fp = report.overall.fp,
        "Threshold search complete"
    );

    Ok(TuneOutcome {
        thresholds: space.iter().cloned().zip(values).collect(),
        report,
        combinations,
    })
}

/// Odometer step over candidate indices, last position fastest
///
/// Returns false once every combination has been visited.
fn advance(cursor: &mut [usize], grids: &[Vec<f64>]) -> bool {
    for pos in (0..cursor.len()).rev() {
        cursor[pos] += 1;
        if cursor[pos] < grids[pos].len() {
            return true;
        }
        cursor[pos] = 0;
    }
    false
}

/// Store `config` as the decision section of the calibration at `path`
///
/// A missing calibration file starts from an empty profile; a malformed one
/// is an error rather than being overwritten. Returns the backup path.
pub fn persist(config: &DecisionConfig, path: &Path) -> Result<Option<PathBuf>> {
    let mut profile = match load_calibration(path) {
        Ok(profile) => profile,
        Err(Error::NotFound(_)) => CalibrationProfile::default(),
        Err(e) => return Err(e),
    };
    profile.decision = Some(config.clone());
    let backup = save_calibration(path, &profile)?;
    info!(path = %path.display(), rules = config.rules.len(), "Tuned thresholds persisted");
    Ok(backup)
}
