//! Rule-based decision engine
//!
//! A [`DecisionConfig`] is an ordered list of threshold [`Rule`]s plus a
//! fallback label. [`evaluate`] tests every rule against a feature row and
//! picks the most-voted label; [`apply_override`] layers a profile's
//! threshold overrides on top of that vote.
//!
//! The same [`evaluate`] routine backs live scoring, the accuracy evaluator
//! and the autotuner, so all three agree on every row.

use crate::channels::FeatureRow;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Label forced by a passing profile override
pub const POSITIVE_LABEL: &str = "ripe";

/// Default label when no rule votes
pub const DEFAULT_FALLBACK: &str = "unripe";

/// Minimum confidence reported after a profile override fires
pub const OVERRIDE_CONFIDENCE_FLOOR: f64 = 0.9;

/// Comparison operator of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "between")]
    Between,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Between => "between",
        }
    }

    /// Compare `value` against `threshold`
    ///
    /// `between` sorts its bounds first and accepts a scalar as a
    /// degenerate `[t, t]` range. Returns `None` when a scalar operator is
    /// paired with a range threshold.
    pub fn compare(self, value: f64, threshold: &Threshold) -> Option<bool> {
        match (self, threshold) {
            (Operator::Between, t) => {
                let (lo, hi) = t.bounds();
                Some(lo <= value && value <= hi)
            }
            (_, Threshold::Range(_)) => None,
            (Operator::Lt, Threshold::Scalar(t)) => Some(value < *t),
            (Operator::Le, Threshold::Scalar(t)) => Some(value <= *t),
            (Operator::Gt, Threshold::Scalar(t)) => Some(value > *t),
            (Operator::Ge, Threshold::Scalar(t)) => Some(value >= *t),
        }
    }

    /// Whether this operator can be used with `threshold`
    pub fn accepts(self, threshold: &Threshold) -> bool {
        self == Operator::Between || matches!(threshold, Threshold::Scalar(_))
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            "between" => Ok(Operator::Between),
            other => Err(Error::InvalidInput(format!("unknown operator '{}'", other))),
        }
    }
}

/// Rule threshold: a scalar cut point or a `[lo, hi]` pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Scalar(f64),
    Range([f64; 2]),
}

impl Threshold {
    /// Sorted bounds; a scalar is its own range
    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            Threshold::Scalar(t) => (t, t),
            Threshold::Range([a, b]) if a <= b => (a, b),
            Threshold::Range([a, b]) => (b, a),
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Scalar(t) => write!(f, "{}", t),
            Threshold::Range([a, b]) => write!(f, "[{}, {}]", a, b),
        }
    }
}

fn default_vote() -> String {
    POSITIVE_LABEL.to_string()
}

fn default_fallback() -> String {
    DEFAULT_FALLBACK.to_string()
}

/// One threshold test mapping a feature to a candidate vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(alias = "index")]
    pub feature: String,
    #[serde(rename = "op")]
    pub operator: Operator,
    #[serde(rename = "value")]
    pub threshold: Threshold,
    #[serde(default = "default_vote")]
    pub vote: String,
}

impl Rule {
    pub fn new(
        feature: impl Into<String>,
        operator: Operator,
        threshold: Threshold,
        vote: impl Into<String>,
    ) -> Self {
        Self {
            feature: feature.into(),
            operator,
            threshold,
            vote: vote.into(),
        }
    }

    /// Check that operator and threshold shape agree and bounds are finite
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.feature.trim().is_empty() {
            return Err("rule has an empty feature name".to_string());
        }
        if !self.operator.accepts(&self.threshold) {
            return Err(format!(
                "rule on '{}': operator {} needs a scalar threshold, got {}",
                self.feature, self.operator, self.threshold
            ));
        }
        let (lo, hi) = self.threshold.bounds();
        if !lo.is_finite() || !hi.is_finite() {
            return Err(format!("rule on '{}' has a non-finite threshold", self.feature));
        }
        Ok(())
    }
}

/// Ordered rule list plus fallback label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionConfig {
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default = "default_fallback")]
    pub fallback: String,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            fallback: default_fallback(),
        }
    }
}

impl DecisionConfig {
    /// Validate every rule; the first problem is reported
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.rules.iter().try_for_each(Rule::validate)
    }

    /// Copy of this config with profile threshold overrides attached
    ///
    /// Rules on an overridden feature are replaced in place by the
    /// override conditions (keeping their vote label); overrides on
    /// features without a rule are appended as positive-vote rules.
    pub fn with_overrides(&self, overrides: &ThresholdOverrides) -> Result<DecisionConfig> {
        let mut rules = self.rules.clone();

        for (feature, conditions) in overrides.by_feature() {
            for c in &conditions {
                if !c.operator.accepts(&c.threshold) {
                    return Err(Error::InvalidInput(format!(
                        "override on '{}': operator {} cannot take {}",
                        feature, c.operator, c.threshold
                    )));
                }
            }

            let position = rules.iter().position(|r| r.feature == feature);
            let vote = position
                .map(|i| rules[i].vote.clone())
                .unwrap_or_else(default_vote);
            rules.retain(|r| r.feature != feature);

            let replacements = conditions
                .iter()
                .map(|c| Rule::new(feature, c.operator, c.threshold, vote.clone()));
            match position {
                Some(i) => {
                    let tail = rules.split_off(i.min(rules.len()));
                    rules.extend(replacements);
                    rules.extend(tail);
                }
                None => rules.extend(replacements),
            }
        }

        Ok(DecisionConfig {
            rules,
            fallback: self.fallback.clone(),
        })
    }
}

/// Result of testing one rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Pass,
    Fail,
    Skipped,
}

/// Log line for one rule of an evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub feature: String,
    pub operator: Operator,
    pub threshold: Threshold,
    pub value: Option<f64>,
    pub status: RuleStatus,
}

impl fmt::Display for RuleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.status {
            RuleStatus::Pass => "PASS",
            RuleStatus::Fail => "FAIL",
            RuleStatus::Skipped => "SKIP",
        };
        match self.value {
            Some(v) => write!(
                f,
                "{} {} {} {}  ({:.6})",
                tag, self.feature, self.operator, self.threshold, v
            ),
            None => write!(
                f,
                "{} {} {} {}  (missing)",
                tag, self.feature, self.operator, self.threshold
            ),
        }
    }
}

/// Where a decision label came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Most-voted rule label
    Rules,
    /// No rule voted; configured fallback
    Fallback,
    /// Profile threshold override forced the positive label
    ProfileOverride,
}

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResult {
    pub label: String,
    /// Vote labels in rule order
    pub votes: Vec<String>,
    pub per_rule_log: Vec<RuleOutcome>,
    /// Share of evaluated rules that voted for the label; `None` on fallback
    pub confidence: Option<f64>,
    pub provenance: Provenance,
}

impl DecisionResult {
    pub fn votes_cast(&self) -> usize {
        self.votes.len()
    }

    /// Confidence, or the caller's default when the engine left it unset
    pub fn confidence_or(&self, default: f64) -> f64 {
        self.confidence.unwrap_or(default)
    }
}

/// Evaluate `config` against `row`
///
/// Rules run in declared order. A rule whose feature is absent (or not a
/// finite number) is skipped with a warning. The label is the most-voted
/// value with ties going to the label that was voted first; with no votes
/// the fallback label is returned and confidence is left unset.
pub fn evaluate(row: &FeatureRow, config: &DecisionConfig) -> DecisionResult {
    let mut votes = Vec::new();
    let mut log = Vec::with_capacity(config.rules.len());
    let mut evaluated = 0usize;

    for rule in &config.rules {
        let value = row.get(&rule.feature);
        let status = match value {
            None => {
                warn!(feature = %rule.feature, "Rule skipped: feature not present");
                RuleStatus::Skipped
            }
            Some(v) => match rule.operator.compare(v, &rule.threshold) {
                Some(true) => {
                    evaluated += 1;
                    votes.push(rule.vote.clone());
                    RuleStatus::Pass
                }
                Some(false) => {
                    evaluated += 1;
                    RuleStatus::Fail
                }
                None => {
                    warn!(
                        feature = %rule.feature,
                        operator = %rule.operator,
                        "Rule skipped: threshold shape does not fit operator"
                    );
                    RuleStatus::Skipped
                }
            },
        };

        log.push(RuleOutcome {
            feature: rule.feature.clone(),
            operator: rule.operator,
            threshold: rule.threshold,
            value,
            status,
        });
    }

    let result = match tally_winner(&votes) {
        Some((label, count)) => DecisionResult {
            label: label.to_string(),
            confidence: Some(count as f64 / evaluated.max(1) as f64),
            votes,
            per_rule_log: log,
            provenance: Provenance::Rules,
        },
        None => DecisionResult {
            label: config.fallback.clone(),
            votes,
            per_rule_log: log,
            confidence: None,
            provenance: Provenance::Fallback,
        },
    };

    debug!(
        label = %result.label,
        votes = result.votes_cast(),
        rules = config.rules.len(),
        "Decision evaluated"
    );
    result
}

/// Most-voted label; earlier first votes win ties
fn tally_winner(votes: &[String]) -> Option<(&str, usize)> {
    let mut tally: Vec<(&str, usize)> = Vec::new();
    for vote in votes {
        match tally.iter_mut().find(|(label, _)| *label == vote.as_str()) {
            Some(entry) => entry.1 += 1,
            None => tally.push((vote.as_str(), 1)),
        }
    }
    tally.into_iter().fold(None, |best, (label, count)| match best {
        Some((_, best_count)) if best_count >= count => best,
        _ => Some((label, count)),
    })
}

/// One profile override condition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverrideCondition<'a> {
    pub feature: &'a str,
    pub operator: Operator,
    pub threshold: Threshold,
}

/// Profile threshold overrides: `feature -> {operator: value}`
///
/// Document form: `{"ri": {">=": 0.4}, "r_over_g": {"between": [1.1, 1.9]}}`.
/// Operators are checked on load; whether a threshold fits its operator is
/// only checked when the overrides are used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, BTreeMap<String, Threshold>>")]
#[serde(into = "BTreeMap<String, BTreeMap<String, Threshold>>")]
pub struct ThresholdOverrides {
    entries: BTreeMap<String, BTreeMap<Operator, Threshold>>,
}

impl ThresholdOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, feature: impl Into<String>, operator: Operator, threshold: Threshold) {
        self.entries
            .entry(feature.into())
            .or_default()
            .insert(operator, threshold);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|ops| ops.is_empty())
    }

    /// All conditions, features in name order
    pub fn conditions(&self) -> impl Iterator<Item = OverrideCondition<'_>> {
        self.entries.iter().flat_map(|(feature, ops)| {
            ops.iter().map(move |(op, t)| OverrideCondition {
                feature: feature.as_str(),
                operator: *op,
                threshold: *t,
            })
        })
    }

    fn by_feature(&self) -> Vec<(&str, Vec<OverrideCondition<'_>>)> {
        self.entries
            .keys()
            .map(|feature| {
                let conditions = self
                    .conditions()
                    .filter(|c| c.feature == feature.as_str())
                    .collect();
                (feature.as_str(), conditions)
            })
            .collect()
    }
}

impl TryFrom<BTreeMap<String, BTreeMap<String, Threshold>>> for ThresholdOverrides {
    type Error = Error;

    fn try_from(raw: BTreeMap<String, BTreeMap<String, Threshold>>) -> Result<Self> {
        let mut overrides = ThresholdOverrides::new();
        for (feature, ops) in raw {
            for (op, threshold) in ops {
                overrides.insert(feature.clone(), op.parse()?, threshold);
            }
        }
        Ok(overrides)
    }
}

impl From<ThresholdOverrides> for BTreeMap<String, BTreeMap<String, Threshold>> {
    fn from(overrides: ThresholdOverrides) -> Self {
        overrides
            .entries
            .into_iter()
            .map(|(feature, ops)| {
                let ops = ops
                    .into_iter()
                    .map(|(op, t)| (op.as_str().to_string(), t))
                    .collect();
                (feature, ops)
            })
            .collect()
    }
}

/// Force the positive label when every override condition passes
///
/// AND semantics: a missing feature, a failing condition, or an operator
/// that cannot take its threshold leaves `prior` untouched. An empty
/// override set never fires.
pub fn apply_override(
    row: &FeatureRow,
    overrides: &ThresholdOverrides,
    prior: &DecisionResult,
) -> DecisionResult {
    if overrides.is_empty() {
        return prior.clone();
    }

    for condition in overrides.conditions() {
        let Some(value) = row.get(condition.feature) else {
            debug!(feature = condition.feature, "Override not applied: feature absent");
            return prior.clone();
        };
        if condition.operator.compare(value, &condition.threshold) != Some(true) {
            debug!(
                feature = condition.feature,
                value,
                operator = %condition.operator,
                threshold = %condition.threshold,
                "Override not applied: condition failed"
            );
            return prior.clone();
        }
    }

    let confidence = prior
        .confidence
        .unwrap_or(0.0)
        .max(OVERRIDE_CONFIDENCE_FLOOR);

    DecisionResult {
        label: POSITIVE_LABEL.to_string(),
        votes: prior.votes.clone(),
        per_rule_log: prior.per_rule_log.clone(),
        confidence: Some(confidence),
        provenance: Provenance::ProfileOverride,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, f64)]) -> FeatureRow {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn ripe_rule_config() -> DecisionConfig {
        DecisionConfig {
            rules: vec![Rule::new("r_over_g", Operator::Ge, Threshold::Scalar(1.2), "ripe")],
            fallback: "unripe".to_string(),
        }
    }

    #[test]
    fn test_rule_passes_and_votes() {
        let result = evaluate(&row(&[("r_over_g", 1.5)]), &ripe_rule_config());
        assert_eq!(result.label, "ripe");
        assert_eq!(result.votes_cast(), 1);
        assert_eq!(result.provenance, Provenance::Rules);
        assert_eq!(result.confidence, Some(1.0));
    }

    #[test]
    fn test_no_votes_returns_fallback() {
        let result = evaluate(&row(&[("r_over_g", 0.9)]), &ripe_rule_config());
        assert_eq!(result.label, "unripe");
        assert_eq!(result.votes_cast(), 0);
        assert_eq!(result.confidence, None);
        assert_eq!(result.confidence_or(0.6), 0.6);
        assert_eq!(result.provenance, Provenance::Fallback);
    }

    #[test]
    fn test_empty_rules_return_fallback() {
        let config = DecisionConfig {
            rules: vec![],
            fallback: "unknown".to_string(),
        };
        let result = evaluate(&row(&[("r_over_g", 3.0)]), &config);
        assert_eq!(result.label, "unknown");
        assert_eq!(result.votes_cast(), 0);
        assert!(result.per_rule_log.is_empty());
    }

    #[test]
    fn test_missing_feature_is_skipped() {
        let mut config = ripe_rule_config();
        config
            .rules
            .insert(0, Rule::new("ri", Operator::Ge, Threshold::Scalar(0.4), "ripe"));
        let result = evaluate(&row(&[("r_over_g", 1.3)]), &config);
        assert_eq!(result.label, "ripe");
        assert_eq!(result.per_rule_log[0].status, RuleStatus::Skipped);
        assert_eq!(result.per_rule_log[1].status, RuleStatus::Pass);
    }

    #[test]
    fn test_between_accepts_unsorted_bounds() {
        let config = DecisionConfig {
            rules: vec![Rule::new(
                "green_drop",
                Operator::Between,
                Threshold::Range([0.9, 0.1]),
                "ripe",
            )],
            fallback: "unripe".to_string(),
        };
        assert_eq!(evaluate(&row(&[("green_drop", 0.5)]), &config).label, "ripe");
        assert_eq!(evaluate(&row(&[("green_drop", 0.95)]), &config).label, "unripe");
    }

    #[test]
    fn test_tie_goes_to_first_registered_vote() {
        let config = DecisionConfig {
            rules: vec![
                Rule::new("a", Operator::Gt, Threshold::Scalar(0.0), "overripe"),
                Rule::new("b", Operator::Gt, Threshold::Scalar(0.0), "ripe"),
                Rule::new("c", Operator::Gt, Threshold::Scalar(0.0), "ripe"),
                Rule::new("d", Operator::Gt, Threshold::Scalar(0.0), "overripe"),
            ],
            fallback: "unripe".to_string(),
        };
        let result = evaluate(&row(&[("a", 1.0), ("b", 1.0), ("c", 1.0), ("d", 1.0)]), &config);
        assert_eq!(result.label, "overripe");
        assert_eq!(result.confidence, Some(0.5));
    }

    #[test]
    fn test_majority_beats_first_vote() {
        let config = DecisionConfig {
            rules: vec![
                Rule::new("a", Operator::Gt, Threshold::Scalar(0.0), "overripe"),
                Rule::new("b", Operator::Gt, Threshold::Scalar(0.0), "ripe"),
                Rule::new("c", Operator::Gt, Threshold::Scalar(0.0), "ripe"),
            ],
            fallback: "unripe".to_string(),
        };
        let result = evaluate(&row(&[("a", 1.0), ("b", 1.0), ("c", 1.0)]), &config);
        assert_eq!(result.label, "ripe");
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let config = ripe_rule_config();
        let features = row(&[("r_over_g", 1.25), ("y_over_g", 0.3)]);
        assert_eq!(evaluate(&features, &config), evaluate(&features, &config));
    }

    #[test]
    fn test_rule_document_accepts_index_alias_and_default_vote() {
        let rule: Rule =
            serde_json::from_str(r#"{"index": "y_over_g", "op": ">=", "value": 1.7}"#).unwrap();
        assert_eq!(rule.feature, "y_over_g");
        assert_eq!(rule.vote, "ripe");
        assert_eq!(rule.threshold, Threshold::Scalar(1.7));
    }

    #[test]
    fn test_validate_rejects_range_with_scalar_operator() {
        let rule = Rule::new("x", Operator::Ge, Threshold::Range([1.0, 2.0]), "ripe");
        assert!(rule.validate().is_err());
        let rule = Rule::new("x", Operator::Between, Threshold::Scalar(1.0), "ripe");
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_override_ignored_when_feature_absent() {
        let overrides: ThresholdOverrides =
            serde_json::from_str(r#"{"ri": {">=": 0.4}}"#).unwrap();
        let prior = evaluate(&row(&[("r_over_g", 0.9)]), &ripe_rule_config());
        let after = apply_override(&row(&[("r_over_g", 0.9)]), &overrides, &prior);
        assert_eq!(after, prior);
    }

    #[test]
    fn test_override_forces_positive_label() {
        let overrides: ThresholdOverrides =
            serde_json::from_str(r#"{"ri": {">=": 0.4}, "r_over_g": {"<": 1.0}}"#).unwrap();
        let features = row(&[("r_over_g", 0.9), ("ri", 0.5)]);
        let prior = evaluate(&features, &ripe_rule_config());
        assert_eq!(prior.label, "unripe");

        let after = apply_override(&features, &overrides, &prior);
        assert_eq!(after.label, POSITIVE_LABEL);
        assert_eq!(after.confidence, Some(OVERRIDE_CONFIDENCE_FLOOR));
        assert_eq!(after.provenance, Provenance::ProfileOverride);
    }

    #[test]
    fn test_override_requires_every_condition() {
        let overrides: ThresholdOverrides =
            serde_json::from_str(r#"{"ri": {">=": 0.4}, "r_over_g": {">": 2.0}}"#).unwrap();
        let features = row(&[("r_over_g", 0.9), ("ri", 0.5)]);
        let prior = evaluate(&features, &ripe_rule_config());
        assert_eq!(apply_override(&features, &overrides, &prior), prior);
    }

    #[test]
    fn test_override_keeps_higher_confidence() {
        let overrides: ThresholdOverrides =
            serde_json::from_str(r#"{"r_over_g": {">=": 1.0}}"#).unwrap();
        let features = row(&[("r_over_g", 1.5)]);
        let prior = evaluate(&features, &ripe_rule_config());
        assert_eq!(prior.confidence, Some(1.0));
        assert_eq!(apply_override(&features, &overrides, &prior).confidence, Some(1.0));
    }

    #[test]
    fn test_empty_overrides_never_fire() {
        let features = row(&[("r_over_g", 0.1)]);
        let prior = evaluate(&features, &ripe_rule_config());
        assert_eq!(
            apply_override(&features, &ThresholdOverrides::new(), &prior),
            prior
        );
    }

    #[test]
    fn test_unknown_override_operator_rejected_on_load() {
        let parsed: std::result::Result<ThresholdOverrides, _> =
            serde_json::from_str(r#"{"ri": {"=~": 0.4}}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_with_overrides_replaces_matching_rule_in_place() {
        let config = DecisionConfig {
            rules: vec![
                Rule::new("y_over_g", Operator::Ge, Threshold::Scalar(1.7), "ripe"),
                Rule::new("r_over_g", Operator::Ge, Threshold::Scalar(1.2), "ripe"),
            ],
            fallback: "unripe".to_string(),
        };
        let mut overrides = ThresholdOverrides::new();
        overrides.insert("y_over_g", Operator::Ge, Threshold::Scalar(1.4));
        overrides.insert("ri", Operator::Ge, Threshold::Scalar(0.4));

        let merged = config.with_overrides(&overrides).unwrap();
        assert_eq!(merged.rules.len(), 3);
        assert_eq!(merged.rules[0].feature, "y_over_g");
        assert_eq!(merged.rules[0].threshold, Threshold::Scalar(1.4));
        assert_eq!(merged.rules[1].feature, "r_over_g");
        assert_eq!(merged.rules[2].feature, "ri");
    }

    #[test]
    fn test_with_overrides_rejects_mismatched_shape() {
        let mut overrides = ThresholdOverrides::new();
        overrides.insert("r_over_g", Operator::Ge, Threshold::Range([1.0, 2.0]));
        assert!(matches!(
            ripe_rule_config().with_overrides(&overrides),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rule_outcome_log_line() {
        let result = evaluate(&row(&[("r_over_g", 1.5)]), &ripe_rule_config());
        assert_eq!(
            result.per_rule_log[0].to_string(),
            "PASS r_over_g >= 1.2  (1.500000)"
        );
    }
}
