//! Scan orchestrator
//!
//! One [`Pipeline::run`] performs one scan cycle:
//!
//! ```text
//! Init → Capture → Classify → ResolveProfile → [Recapture] → Acquire
//!      → Normalize → Calibrate → Index → [Autotune] → Score → Override
//!      → Persist → Done
//! ```
//!
//! Any fatal stage error moves the run to `Failed`, logs the stage
//! timeline and returns the error; no result document is written then.
//! `Recapture` is the only backward edge and runs at most once, when the
//! resolved profile carries camera arguments.

use crate::autotune_hook::{AutotuneApplied, AutotuneRequest};
use crate::collaborators::{Classification, Collaborators};
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::result::{
    ArtifactPaths, DecisionSummary, FruitSummary, ImageSummary, PipelineResult, ProfileSummary,
};
use crate::stage::{validate_artifact, StageOutcome, StageRecord, StageRunner, StageSpec};
use chrono::Local;
use frad_common::calibration::{apply_calibration, load_calibration, CalibrationProfile};
use frad_common::channels::{compute_indices, normalize, smooth, Smoother};
use frad_common::decision::{apply_override, evaluate, POSITIVE_LABEL};
use frad_common::index_log::{append_index_row, write_readings_csv, IndexRecord};
use frad_common::profiles::{resolve_fruit_profile, ProfileSet, ResolvedProfile};
use frad_common::{Channel, ChannelReading, DecisionResult, Error};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Number of steps shown on the status display
const DISPLAY_STEPS: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    Capture,
    Classify,
    ResolveProfile,
    Recapture,
    Acquire,
    Normalize,
    Calibrate,
    Index,
    Autotune,
    Score,
    Override,
    Persist,
    Done,
    Failed,
}

impl PipelineState {
    pub fn label(self) -> &'static str {
        match self {
            PipelineState::Init => "Init",
            PipelineState::Capture => "Capture",
            PipelineState::Classify => "Classify",
            PipelineState::ResolveProfile => "Profile",
            PipelineState::Recapture => "Recapture",
            PipelineState::Acquire => "Acquire",
            PipelineState::Normalize => "Normalize",
            PipelineState::Calibrate => "Calibrate",
            PipelineState::Index => "Index",
            PipelineState::Autotune => "Autotune",
            PipelineState::Score => "Score",
            PipelineState::Override => "Override",
            PipelineState::Persist => "Persist",
            PipelineState::Done => "Done",
            PipelineState::Failed => "Failed",
        }
    }

    /// Position on the status display, for the states shown there
    pub fn display_step(self) -> Option<usize> {
        match self {
            PipelineState::Capture => Some(1),
            PipelineState::Classify => Some(2),
            PipelineState::ResolveProfile => Some(3),
            PipelineState::Acquire => Some(4),
            PipelineState::Normalize => Some(5),
            PipelineState::Calibrate => Some(6),
            PipelineState::Index => Some(7),
            PipelineState::Score => Some(8),
            PipelineState::Persist => Some(9),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }
}

/// Per-run options from the command line and environment
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Readings to acquire; `None` uses `acquisition.sample_count`
    pub count: Option<usize>,
    /// Skip classification and use this fruit (`FORCE_FRUIT`)
    pub forced_fruit: Option<String>,
    /// Live threshold adjustment (`AUTOTUNE`)
    pub autotune: Option<AutotuneRequest>,
}

/// Output files of one run
#[derive(Debug, Clone)]
struct RunPaths {
    image: PathBuf,
    raw: PathBuf,
    normalized: PathBuf,
    calibrated: PathBuf,
    result: PathBuf,
}

impl RunPaths {
    fn new(out_dir: &Path, stamp: &str) -> Self {
        Self {
            image: out_dir.join(format!("img_{}.jpg", stamp)),
            raw: out_dir.join(format!("raw_{}.csv", stamp)),
            normalized: out_dir.join(format!("norm_{}.csv", stamp)),
            calibrated: out_dir.join(format!("cal_{}.csv", stamp)),
            result: out_dir.join(format!("result_{}.json", stamp)),
        }
    }
}

/// Scan orchestrator
pub struct Pipeline {
    config: ScanConfig,
    collaborators: Collaborators,
    runner: StageRunner,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl Pipeline {
    pub fn new(config: ScanConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            runner: StageRunner::new(),
            state: PipelineState::Init,
            history: vec![PipelineState::Init],
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// States entered during the last run, in order
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    pub fn timeline(&self) -> &[StageRecord] {
        self.runner.timeline()
    }

    fn transition_to(&mut self, new_state: PipelineState) {
        info!(from = self.state.label(), to = new_state.label(), "Pipeline state transition");
        self.state = new_state;
        self.history.push(new_state);
        if let Some(step) = new_state.display_step() {
            self.collaborators
                .display
                .stage(step, DISPLAY_STEPS, new_state.label());
        }
    }

    /// Validate a stage artifact, recording a violation on the timeline
    fn check_artifact(&mut self, stage: &'static str, path: &Path) -> Result<u64> {
        validate_artifact(stage, path).map_err(|e| {
            self.runner.record_failure(stage, &e);
            e
        })
    }

    /// Run one scan cycle
    pub async fn run(&mut self, options: ScanOptions) -> Result<PipelineResult> {
        self.runner = StageRunner::new();
        self.state = PipelineState::Init;
        self.history = vec![PipelineState::Init];

        match self.execute(options).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.transition_to(PipelineState::Failed);
                self.runner.log_timeline();
                self.collaborators.display.message("SCAN FAILED", &e.to_string());
                Err(e)
            }
        }
    }

    async fn execute(&mut self, options: ScanOptions) -> Result<PipelineResult> {
        let started = Instant::now();
        let started_at = Local::now();
        let run_id = Uuid::new_v4();
        let timeouts = self.config.timeouts.clone();

        tokio::fs::create_dir_all(&self.config.out_dir).await?;
        let stamp = started_at.format("%Y%m%d_%H%M%S_%3f").to_string();
        let paths = RunPaths::new(&self.config.out_dir, &stamp);
        info!(%run_id, out_dir = %self.config.out_dir.display(), "Scan started");

        // Capture
        self.transition_to(PipelineState::Capture);
        let capture = self
            .runner
            .run(
                StageSpec::non_fatal("capture", timeouts.capture()),
                capture_image(&*self.collaborators.camera, &paths.image, &[]),
            )
            .await?;
        let mut image_available = capture.value.is_some();
        if !image_available {
            warn!(path = %paths.image.display(), "No image captured, continuing without one");
        }

        // Classify
        self.transition_to(PipelineState::Classify);
        let forced = options.forced_fruit.is_some();
        let classification = match &options.forced_fruit {
            Some(fruit) => {
                info!(fruit = %fruit, "Fruit forced, classification skipped");
                Classification {
                    fruit: frad_common::profiles::canonical_name(fruit),
                    confidence: 1.0,
                    model: "forced".to_string(),
                }
            }
            None => {
                let image = image_available.then_some(paths.image.as_path());
                let outcome = self
                    .runner
                    .run(
                        StageSpec::non_fatal("classify", timeouts.classify()),
                        self.collaborators.classifier.classify(image),
                    )
                    .await?;
                outcome
                    .value
                    .filter(|c| !c.fruit.trim().is_empty())
                    .unwrap_or_else(Classification::unknown)
            }
        };
        info!(fruit = %classification.fruit, confidence = classification.confidence, "Fruit identified");

        // ResolveProfile
        self.transition_to(PipelineState::ResolveProfile);
        let profiles_path = self.config.profiles_path.clone();
        let fruit = classification.fruit.clone();
        let config = &self.config;
        let (resolved, calibration_path) = required(
            self.runner
                .run(StageSpec::fatal("resolve", timeouts.resolve()), async {
                    let set = ProfileSet::load_or_default(&profiles_path)?;
                    let resolved = resolve_fruit_profile(&fruit, &set);
                    let calibration_path = calibration_path_for(config, &set, &resolved);
                    Ok((resolved, calibration_path))
                })
                .await?,
        )?;
        info!(
            fruit = %resolved.requested,
            matched = resolved.matched.as_deref().unwrap_or("<defaults>"),
            calibration = %calibration_path.display(),
            "Profile resolved"
        );

        let mut recaptured = false;
        if resolved.profile.requires_recapture() {
            self.transition_to(PipelineState::Recapture);
            let outcome = self
                .runner
                .run(
                    StageSpec::non_fatal("recapture", timeouts.capture()),
                    capture_image(
                        &*self.collaborators.camera,
                        &paths.image,
                        &resolved.profile.capture_args,
                    ),
                )
                .await?;
            if outcome.value.is_some() {
                image_available = true;
                recaptured = true;
            }
        }

        // Acquire
        self.transition_to(PipelineState::Acquire);
        let count = options
            .count
            .unwrap_or(self.config.acquisition.sample_count)
            .max(1);
        let samples = match resolved.matched {
            Some(_) => resolved.profile.samples,
            None => self.config.acquisition.samples,
        }
        .max(1);
        let delay = self.config.acquisition.inter_sample_delay();
        let sensor = &*self.collaborators.sensor;
        let raw = required(
            self.runner
                .run(StageSpec::fatal("acquire", timeouts.acquire()), async {
                    let mut readings = Vec::with_capacity(count);
                    for i in 0..count {
                        if i > 0 && !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        readings.push(sensor.read_channels(samples, delay).await?);
                    }
                    Ok(readings)
                })
                .await?,
        )?;
        write_readings_csv(&paths.raw, &raw)?;
        self.check_artifact("acquire", &paths.raw)?;

        // Normalize
        self.transition_to(PipelineState::Normalize);
        let window = self.config.acquisition.smoothing_window;
        let batch_input = raw.clone();
        let normalized = required(
            self.runner
                .run_with_fallback(
                    StageSpec::fatal("normalize", timeouts.normalize()),
                    async move {
                        let out =
                            tokio::task::spawn_blocking(move || normalize_batch(&batch_input, window))
                                .await?;
                        Ok(out)
                    },
                    || Ok(normalize_streaming(&raw, window)),
                )
                .await?,
        )?;
        require_readings("normalize", &normalized)?;
        write_readings_csv(&paths.normalized, &normalized)?;
        self.check_artifact("normalize", &paths.normalized)?;

        // Calibrate
        self.transition_to(PipelineState::Calibrate);
        let (mut calibration, calibrated) = required(
            self.runner
                .run(StageSpec::fatal("calibrate", timeouts.calibrate()), async {
                    let profile = load_calibration_or_identity(&calibration_path)?;
                    let calibrated: Vec<ChannelReading> = normalized
                        .iter()
                        .map(|r| apply_calibration(r, &profile))
                        .collect();
                    Ok((profile, calibrated))
                })
                .await?,
        )?;
        require_readings("calibrate", &calibrated)?;
        write_readings_csv(&paths.calibrated, &calibrated)?;
        self.check_artifact("calibrate", &paths.calibrated)?;

        // Index
        self.transition_to(PipelineState::Index);
        let bands = resolved.profile.band_map.unwrap_or_default();
        let indices = required(
            self.runner
                .run(StageSpec::fatal("index", timeouts.index()), async {
                    let latest = calibrated.last().ok_or_else(|| {
                        Error::contract("index", "no calibrated reading to index")
                    })?;
                    Ok(compute_indices(latest, &bands)?)
                })
                .await?,
        )?;
        let features = indices.features();
        info!(
            y_over_g = indices.y_over_g,
            r_over_g = indices.r_over_g,
            nir_over_red = indices.nir_over_red,
            green_drop = indices.green_drop,
            "Indices computed"
        );

        // Autotune
        let mut autotune: Option<AutotuneApplied> = None;
        if let Some(request) = &options.autotune {
            self.transition_to(PipelineState::Autotune);
            let fruit = resolved.matched.as_deref().unwrap_or(&resolved.requested);
            let outcome = self
                .runner
                .run(
                    StageSpec::non_fatal("autotune", timeouts.autotune()),
                    async { request.apply(fruit, &features, &mut calibration, &calibration_path) },
                )
                .await?;
            autotune = outcome.value.flatten();
        }

        // Score
        self.transition_to(PipelineState::Score);
        let decision_config = calibration.decision.clone().unwrap_or_default();
        let overrides = &resolved.profile.overrides;
        let overrides_attached = !overrides.is_empty();
        let mut retried_without_overrides = false;

        let mut scored: Option<DecisionResult> = None;
        if overrides_attached {
            let outcome = self
                .runner
                .run(StageSpec::non_fatal("score", timeouts.score()), async {
                    let with_overrides = decision_config.with_overrides(overrides)?;
                    Ok(evaluate(&features, &with_overrides))
                })
                .await?;
            scored = outcome.value;
        }
        let scored = match scored {
            Some(result) => result,
            None => {
                if overrides_attached {
                    warn!("Scoring with profile overrides failed, retrying without them");
                    retried_without_overrides = true;
                }
                required(
                    self.runner
                        .run(StageSpec::fatal("score_bare", timeouts.score()), async {
                            Ok(evaluate(&features, &decision_config))
                        })
                        .await?,
                )?
            }
        };
        for line in &scored.per_rule_log {
            info!(rule = %line, "Rule evaluated");
        }

        // Override
        self.transition_to(PipelineState::Override);
        let decision = apply_override(&features, overrides, &scored);
        let confidence = decision.confidence_or(self.config.decision.default_confidence);
        info!(
            label = %decision.label,
            confidence,
            votes = decision.votes_cast(),
            provenance = ?decision.provenance,
            "Decision"
        );

        // Persist
        self.transition_to(PipelineState::Persist);
        let result = PipelineResult {
            run_id,
            timestamp: started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            image: ImageSummary {
                path: paths.image.clone(),
                available: image_available,
                recaptured,
            },
            fruit: FruitSummary {
                fruit: classification.fruit.clone(),
                confidence: classification.confidence,
                model: classification.model.clone(),
                forced,
            },
            profile: ProfileSummary {
                requested: resolved.requested.clone(),
                matched: resolved.matched.clone(),
                integration_time_ms: resolved.profile.integration_time_ms,
                gain: resolved.profile.gain,
                samples,
                calibration: calibration_path.clone(),
            },
            files: ArtifactPaths {
                raw: paths.raw.clone(),
                normalized: paths.normalized.clone(),
                calibrated: paths.calibrated.clone(),
                index_log: self.config.index_log.clone(),
                result: paths.result.clone(),
            },
            indices,
            decision: DecisionSummary {
                label: decision.label.clone(),
                confidence,
                votes: decision.votes.clone(),
                provenance: decision.provenance,
                rules: decision.per_rule_log.iter().map(|o| o.to_string()).collect(),
                overrides_attached,
                retried_without_overrides,
            },
            autotune,
            stages: self.runner.timeline().to_vec(),
        };

        let index_log = self.config.index_log.clone();
        let label = decision.label.clone();
        let persisted = &result;
        required(
            self.runner
                .run(StageSpec::fatal("persist", timeouts.persist()), async {
                    persist_outputs(persisted, &index_log, &IndexRecord::now(&indices, label))
                })
                .await?,
        )?;

        self.transition_to(PipelineState::Done);
        self.collaborators
            .display
            .result(&decision.label, decision.label == POSITIVE_LABEL);
        info!(
            %run_id,
            label = %decision.label,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scan complete"
        );
        Ok(result)
    }
}

/// Capture to `path` and require a non-empty image
async fn capture_image(
    camera: &dyn crate::collaborators::Camera,
    path: &Path,
    extra_args: &[String],
) -> Result<()> {
    camera.capture_image(path, extra_args).await?;
    let len = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
    if len == 0 {
        return Err(ScanError::Collaborator(format!(
            "{} produced no image at {}",
            camera.name(),
            path.display()
        )));
    }
    Ok(())
}

/// Write the result, then append its index row
///
/// The index row goes last so a failed run never leaves one behind; a
/// failed append removes the result again.
fn persist_outputs(result: &PipelineResult, index_log: &Path, record: &IndexRecord) -> Result<()> {
    let result_path = result.write()?;
    validate_artifact("persist", result_path).map_err(|e| discard(result_path, e))?;

    append_index_row(index_log, record)
        .map_err(ScanError::from)
        .and_then(|()| validate_artifact("persist", index_log))
        .map_err(|e| discard(result_path, e))?;
    Ok(())
}

fn discard(path: &Path, err: ScanError) -> ScanError {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove result of failed persist");
    }
    err
}

/// Value of a fatal stage outcome
fn required<T>(outcome: StageOutcome<T>) -> Result<T> {
    let stage = outcome.stage;
    outcome
        .value
        .ok_or_else(|| Error::contract(stage, "stage produced no value").into())
}

fn require_readings(stage: &str, readings: &[ChannelReading]) -> Result<()> {
    if readings.is_empty() {
        return Err(Error::contract(stage, "no readings produced").into());
    }
    Ok(())
}

/// Divide by CLEAR, then trailing moving average over the whole sequence
pub fn normalize_batch(readings: &[ChannelReading], window: usize) -> Vec<ChannelReading> {
    let normalized: Vec<ChannelReading> = readings
        .iter()
        .map(|r| normalize(r, Channel::Clear))
        .collect();
    smooth(&normalized, window)
}

/// Inline equivalent of [`normalize_batch`], one reading at a time
pub fn normalize_streaming(readings: &[ChannelReading], window: usize) -> Vec<ChannelReading> {
    let mut smoother = Smoother::new(window);
    readings
        .iter()
        .map(|r| smoother.push(normalize(r, Channel::Clear)))
        .collect()
}

/// Calibration document named by the profile, else `<calibration_dir>/<fruit>_cal.json`
fn calibration_path_for(config: &ScanConfig, set: &ProfileSet, resolved: &ResolvedProfile) -> PathBuf {
    match &resolved.profile.calibration {
        Some(path) => set.resolve_path(path),
        None => {
            let fruit = resolved.matched.as_deref().unwrap_or(&resolved.requested);
            config.default_calibration_path(fruit)
        }
    }
}

/// A missing document means identity corrections and no rules
fn load_calibration_or_identity(path: &Path) -> Result<CalibrationProfile> {
    match load_calibration(path) {
        Ok(profile) => Ok(profile),
        Err(Error::NotFound(_)) => {
            warn!(path = %path.display(), "No calibration document, using identity calibration");
            Ok(CalibrationProfile::default())
        }
        Err(e) => Err(e.into()),
    }
}
