//! Stage runner
//!
//! Every pipeline step runs through [`StageRunner::run`] or
//! [`StageRunner::run_with_fallback`]: the operation gets a time budget,
//! an optional cheap local fallback, and a fatality flag. Each call adds a
//! [`StageRecord`] to the run's timeline, including calls that end the run.
//!
//! Policy:
//! - timeout or error with a fallback declared: the fallback runs inline,
//!   without a budget, and the outcome is marked `used_fallback`
//! - no fallback (or the fallback failed): a fatal stage returns
//!   [`ScanError::StageTimeout`] / [`ScanError::StageFailed`]; a non-fatal
//!   stage logs and returns a degraded outcome with no value
//! - artifact contract violations are fatal regardless of the stage's flag

use crate::error::{Result, ScanError};
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Whether a stage failure ends the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fatality {
    Fatal,
    NonFatal,
}

/// Name, budget and fatality of one stage invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub name: &'static str,
    pub timeout: Duration,
    pub fatality: Fatality,
}

impl StageSpec {
    pub fn fatal(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            fatality: Fatality::Fatal,
        }
    }

    pub fn non_fatal(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            fatality: Fatality::NonFatal,
        }
    }
}

/// Result of one stage invocation
#[derive(Debug)]
pub struct StageOutcome<T> {
    pub stage: &'static str,
    pub succeeded: bool,
    pub used_fallback: bool,
    /// Non-fatal failure swallowed; `value` is `None`
    pub degraded: bool,
    pub elapsed: Duration,
    pub error: Option<String>,
    pub value: Option<T>,
}

/// Timeline entry kept for the result document and failure logs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRecord {
    pub stage: String,
    pub succeeded: bool,
    pub used_fallback: bool,
    pub degraded: bool,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs stages and keeps the per-run timeline
#[derive(Debug, Default)]
pub struct StageRunner {
    timeline: Vec<StageRecord>,
}

enum Failure {
    TimedOut,
    Failed(ScanError),
}

impl StageRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeline(&self) -> &[StageRecord] {
        &self.timeline
    }

    /// Run `op` under the stage budget
    pub async fn run<T, Fut>(&mut self, spec: StageSpec, op: Fut) -> Result<StageOutcome<T>>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.execute(spec, op, None::<fn() -> Result<T>>).await
    }

    /// Run `op` under the stage budget, falling back to `fallback` on timeout or error
    pub async fn run_with_fallback<T, Fut, Fb>(
        &mut self,
        spec: StageSpec,
        op: Fut,
        fallback: Fb,
    ) -> Result<StageOutcome<T>>
    where
        Fut: Future<Output = Result<T>>,
        Fb: FnOnce() -> Result<T>,
    {
        self.execute(spec, op, Some(fallback)).await
    }

    /// Record a failure that happened outside a stage call (e.g. artifact validation)
    pub fn record_failure(&mut self, stage: &'static str, err: &ScanError) {
        self.timeline.push(StageRecord {
            stage: stage.to_string(),
            succeeded: false,
            used_fallback: false,
            degraded: false,
            elapsed_ms: 0,
            error: Some(err.to_string()),
        });
    }

    /// Log every timeline entry at error level
    pub fn log_timeline(&self) {
        for record in &self.timeline {
            error!(
                stage = %record.stage,
                succeeded = record.succeeded,
                used_fallback = record.used_fallback,
                degraded = record.degraded,
                elapsed_ms = record.elapsed_ms,
                error = record.error.as_deref().unwrap_or(""),
                "Stage timeline"
            );
        }
    }

    async fn execute<T, Fut, Fb>(
        &mut self,
        spec: StageSpec,
        op: Fut,
        fallback: Option<Fb>,
    ) -> Result<StageOutcome<T>>
    where
        Fut: Future<Output = Result<T>>,
        Fb: FnOnce() -> Result<T>,
    {
        let start = Instant::now();
        debug!(stage = spec.name, timeout_ms = spec.timeout.as_millis() as u64, "Stage started");

        let failure = match tokio::time::timeout(spec.timeout, op).await {
            Ok(Ok(value)) => {
                return Ok(self.finish(spec, start, Ok(value), false));
            }
            Ok(Err(e)) => Failure::Failed(e),
            Err(_) => Failure::TimedOut,
        };

        let failure_text = match &failure {
            Failure::TimedOut => format!("timed out after {} ms", spec.timeout.as_millis()),
            Failure::Failed(e) => e.to_string(),
        };

        let contract_violation =
            matches!(&failure, Failure::Failed(e) if e.is_contract_violation());

        let failure = match fallback {
            Some(fallback) if !contract_violation => {
                warn!(stage = spec.name, reason = %failure_text, "Stage failed, running fallback");
                match fallback() {
                    Ok(value) => return Ok(self.finish(spec, start, Ok(value), true)),
                    Err(e) => {
                        warn!(stage = spec.name, error = %e, "Stage fallback failed");
                        Failure::Failed(e)
                    }
                }
            }
            _ => failure,
        };

        let err = match failure {
            Failure::TimedOut => ScanError::StageTimeout {
                stage: spec.name.to_string(),
                timeout_ms: spec.timeout.as_millis() as u64,
            },
            Failure::Failed(e) if e.is_contract_violation() => e,
            Failure::Failed(e) => match spec.fatality {
                Fatality::Fatal => ScanError::StageFailed {
                    stage: spec.name.to_string(),
                    source: Box::new(e),
                },
                Fatality::NonFatal => e,
            },
        };

        if spec.fatality == Fatality::NonFatal && !err.is_contract_violation() {
            warn!(stage = spec.name, error = %err, "Non-fatal stage failed, continuing degraded");
            return Ok(self.finish(spec, start, Err(err), false));
        }

        self.timeline.push(StageRecord {
            stage: spec.name.to_string(),
            succeeded: false,
            used_fallback: false,
            degraded: false,
            elapsed_ms: start.elapsed().as_millis() as u64,
            error: Some(err.to_string()),
        });
        error!(stage = spec.name, error = %err, "Fatal stage failure");
        Err(err)
    }

    fn finish<T>(
        &mut self,
        spec: StageSpec,
        start: Instant,
        result: std::result::Result<T, ScanError>,
        used_fallback: bool,
    ) -> StageOutcome<T> {
        let elapsed = start.elapsed();
        let (value, error, degraded) = match result {
            Ok(value) => (Some(value), None, false),
            Err(e) => (None, Some(e.to_string()), spec.fatality == Fatality::NonFatal),
        };
        let succeeded = value.is_some() || degraded;

        self.timeline.push(StageRecord {
            stage: spec.name.to_string(),
            succeeded,
            used_fallback,
            degraded,
            elapsed_ms: elapsed.as_millis() as u64,
            error: error.clone(),
        });
        debug!(
            stage = spec.name,
            elapsed_ms = elapsed.as_millis() as u64,
            used_fallback,
            degraded,
            "Stage finished"
        );

        StageOutcome {
            stage: spec.name,
            succeeded,
            used_fallback,
            degraded,
            elapsed,
            error,
            value,
        }
    }
}

/// Check that a required artifact exists and is non-empty
///
/// Returns its size in bytes.
pub fn validate_artifact(stage: &str, path: &Path) -> Result<u64> {
    let metadata = std::fs::metadata(path).map_err(|_| {
        frad_common::Error::contract(stage, format!("missing artifact {}", path.display()))
    })?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(frad_common::Error::contract(
            stage,
            format!("empty artifact {}", path.display()),
        )
        .into());
    }
    Ok(metadata.len())
}
