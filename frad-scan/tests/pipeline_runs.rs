//! End-to-end scan runs against in-process collaborators

use async_trait::async_trait;
use frad_common::decision::Provenance;
use frad_common::index_log::read_index_rows;
use frad_common::{ChannelReading, Error};
use frad_scan::autotune_hook::AutotuneRequest;
use frad_scan::collaborators::{
    Camera, Classification, Collaborators, DisplayHandle, FruitClassifier, NullDisplay,
    SimulatedSensor, SpectralSensor,
};
use frad_scan::config::ScanConfig;
use frad_scan::{Pipeline, PipelineState, ScanError, ScanOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const RIPE_RULES: &str = r#"{
  "channels": {},
  "decision": {
    "rules": [{"feature": "r_over_g", "op": ">=", "value": 1.2, "vote": "ripe"}],
    "fallback": "unripe"
  }
}"#;

/// Writes a small file and remembers the extra arguments of every call
#[derive(Default, Clone)]
struct RecordingCamera {
    calls: Arc<Mutex<Vec<Vec<String>>>>,
}

#[async_trait]
impl Camera for RecordingCamera {
    fn name(&self) -> &str {
        "recording"
    }

    async fn capture_image(&self, path: &Path, extra_args: &[String]) -> frad_scan::Result<()> {
        self.calls.lock().unwrap().push(extra_args.to_vec());
        tokio::fs::write(path, b"\xff\xd8jpeg").await?;
        Ok(())
    }
}

struct BrokenCamera;

#[async_trait]
impl Camera for BrokenCamera {
    fn name(&self) -> &str {
        "broken"
    }

    async fn capture_image(&self, _path: &Path, _extra_args: &[String]) -> frad_scan::Result<()> {
        Err(ScanError::Collaborator("rpicam-still exited with status 1".to_string()))
    }
}

/// Captures normally but occupies the run's result path with a directory
struct ResultPathSquatter;

#[async_trait]
impl Camera for ResultPathSquatter {
    fn name(&self) -> &str {
        "squatter"
    }

    async fn capture_image(&self, path: &Path, _extra_args: &[String]) -> frad_scan::Result<()> {
        let name = path.file_name().unwrap().to_string_lossy();
        let stamp = name.trim_start_matches("img_").trim_end_matches(".jpg");
        let result_path = path.with_file_name(format!("result_{}.json", stamp));
        tokio::fs::create_dir_all(result_path.join("occupied")).await?;
        tokio::fs::write(path, b"\xff\xd8jpeg").await?;
        Ok(())
    }
}

struct FixedClassifier(&'static str);

#[async_trait]
impl FruitClassifier for FixedClassifier {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn classify(&self, _image: Option<&Path>) -> frad_scan::Result<Classification> {
        Ok(Classification {
            fruit: self.0.to_string(),
            confidence: 0.8,
            model: "fixed".to_string(),
        })
    }
}

struct DeadSensor;

#[async_trait]
impl SpectralSensor for DeadSensor {
    fn name(&self) -> &str {
        "dead"
    }

    async fn probe(&self) -> bool {
        false
    }

    async fn read_channels(&self, _: u32, _: Duration) -> frad_scan::Result<ChannelReading> {
        Err(Error::SensorUnavailable("bus not responding".to_string()).into())
    }
}

struct StuckSensor;

#[async_trait]
impl SpectralSensor for StuckSensor {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn probe(&self) -> bool {
        true
    }

    async fn read_channels(&self, _: u32, _: Duration) -> frad_scan::Result<ChannelReading> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(ChannelReading::from_values(SimulatedSensor::DEFAULT_BASE))
    }
}

fn test_config(root: &Path) -> ScanConfig {
    let mut config = ScanConfig::default();
    config.out_dir = root.join("out");
    config.calibration_dir = root.join("cal");
    config.profiles_path = root.join("profiles.json");
    config.index_log = root.join("out").join("index_log.csv");
    config.acquisition.inter_sample_delay_ms = 0;
    config.acquisition.sample_count = 3;
    config
}

fn collaborators(
    sensor: Box<dyn SpectralSensor>,
    camera: Box<dyn Camera>,
    classifier: Box<dyn FruitClassifier>,
) -> Collaborators {
    Collaborators {
        sensor,
        camera,
        classifier,
        display: DisplayHandle::new(Box::new(NullDisplay)),
    }
}

fn steady_sensor() -> Box<dyn SpectralSensor> {
    Box::new(SimulatedSensor::with_seed(SimulatedSensor::DEFAULT_BASE, 0.0, 1))
}

fn write_calibration(root: &Path, fruit_file: &str, body: &str) {
    let dir = root.join("cal");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(fruit_file), body).unwrap();
}

fn forced(fruit: &str) -> ScanOptions {
    ScanOptions {
        forced_fruit: Some(fruit.to_string()),
        ..ScanOptions::default()
    }
}

#[tokio::test]
async fn test_forced_fruit_scan_persists_result_and_index_row() {
    let dir = TempDir::new().unwrap();
    write_calibration(dir.path(), "banana_cal.json", RIPE_RULES);
    let config = test_config(dir.path());
    let index_log = config.index_log.clone();

    let mut pipeline = Pipeline::new(
        config,
        collaborators(
            steady_sensor(),
            Box::new(RecordingCamera::default()),
            Box::new(FixedClassifier("mango")),
        ),
    );
    let result = pipeline.run(forced("Banana")).await.unwrap();

    assert_eq!(pipeline.state(), PipelineState::Done);
    assert!(!pipeline.history().contains(&PipelineState::Recapture));
    assert_eq!(result.fruit.fruit, "banana");
    assert!(result.fruit.forced);
    assert_eq!(result.decision.label, "ripe");
    assert_eq!(result.decision.votes, vec!["ripe".to_string()]);
    assert_eq!(result.decision.provenance, Provenance::Rules);
    assert!(result.image.available);

    assert!(result.files.result.exists());
    assert!(result.files.raw.exists());
    assert!(result.files.normalized.exists());
    assert!(result.files.calibrated.exists());

    let rows = read_index_rows(&index_log).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].label, "ripe");
    assert!(rows[0].r_over_g.unwrap() > 2.0);
    assert!(result.stages.iter().all(|s| s.stage != "persist"));

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&result.files.result).unwrap()).unwrap();
    assert_eq!(doc["decision"]["label"], "ripe");
    assert_eq!(doc["profile"]["calibration"], dir.path().join("cal/banana_cal.json").to_str().unwrap());
}

#[tokio::test]
async fn test_camera_failure_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = Pipeline::new(
        test_config(dir.path()),
        collaborators(
            steady_sensor(),
            Box::new(BrokenCamera),
            Box::new(FixedClassifier("banana")),
        ),
    );
    let result = pipeline.run(ScanOptions::default()).await.unwrap();

    assert!(!result.image.available);
    let capture = result.stages.iter().find(|s| s.stage == "capture").unwrap();
    assert!(capture.degraded);
    // No calibration document: identity corrections, empty rule set
    assert_eq!(result.decision.label, "unripe");
    assert_eq!(result.decision.provenance, Provenance::Fallback);
    assert_eq!(result.decision.confidence, 0.5);
}

#[tokio::test]
async fn test_profile_capture_args_trigger_single_recapture() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("profiles.json"),
        r#"{"apple": {"capture_args": ["--shutter", "20000"], "samples": 4}}"#,
    )
    .unwrap();
    let camera = RecordingCamera::default();
    let calls = camera.calls.clone();

    let mut pipeline = Pipeline::new(
        test_config(dir.path()),
        collaborators(
            steady_sensor(),
            Box::new(camera),
            Box::new(FixedClassifier("Green Apple")),
        ),
    );
    let result = pipeline.run(ScanOptions::default()).await.unwrap();

    assert_eq!(result.profile.matched.as_deref(), Some("apple"));
    assert_eq!(result.profile.samples, 4);
    assert!(result.image.recaptured);
    let recaptures = pipeline
        .history()
        .iter()
        .filter(|s| **s == PipelineState::Recapture)
        .count();
    assert_eq!(recaptures, 1);

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].is_empty());
    assert_eq!(calls[1], vec!["--shutter".to_string(), "20000".to_string()]);
}

#[tokio::test]
async fn test_profile_override_forces_positive_label() {
    let dir = TempDir::new().unwrap();
    write_calibration(
        dir.path(),
        "banana_cal.json",
        r#"{"decision": {"rules": [{"index": "r_over_g", "op": ">=", "value": 5.0}]}}"#,
    );
    std::fs::write(
        dir.path().join("profiles.json"),
        r#"{"banana": {"overrides": {"green_drop": {"<=": 1.0}}}}"#,
    )
    .unwrap();

    let mut pipeline = Pipeline::new(
        test_config(dir.path()),
        collaborators(
            steady_sensor(),
            Box::new(RecordingCamera::default()),
            Box::new(FixedClassifier("bananas")),
        ),
    );
    let result = pipeline.run(ScanOptions::default()).await.unwrap();

    assert!(result.decision.overrides_attached);
    assert!(!result.decision.retried_without_overrides);
    assert_eq!(result.decision.label, "ripe");
    assert_eq!(result.decision.provenance, Provenance::ProfileOverride);
    assert!(result.decision.confidence >= 0.9);
}

#[tokio::test]
async fn test_unusable_overrides_retry_bare_scoring() {
    let dir = TempDir::new().unwrap();
    write_calibration(dir.path(), "banana_cal.json", RIPE_RULES);
    std::fs::write(
        dir.path().join("profiles.json"),
        r#"{"banana": {"overrides": {"r_over_g": {"between": 1.0}}}}"#,
    )
    .unwrap();

    let mut pipeline = Pipeline::new(
        test_config(dir.path()),
        collaborators(
            steady_sensor(),
            Box::new(RecordingCamera::default()),
            Box::new(FixedClassifier("banana")),
        ),
    );
    let result = pipeline.run(ScanOptions::default()).await.unwrap();

    assert!(result.decision.retried_without_overrides);
    assert_eq!(result.decision.label, "ripe");
    assert_eq!(result.decision.provenance, Provenance::Rules);
    assert!(result.stages.iter().any(|s| s.stage == "score" && s.degraded));
    assert!(result.stages.iter().any(|s| s.stage == "score_bare" && s.succeeded));
}

#[tokio::test]
async fn test_malformed_calibration_fails_run_without_result() {
    let dir = TempDir::new().unwrap();
    write_calibration(dir.path(), "banana_cal.json", "{not json");
    let config = test_config(dir.path());
    let out_dir = config.out_dir.clone();
    let index_log = config.index_log.clone();

    let mut pipeline = Pipeline::new(
        config,
        collaborators(
            steady_sensor(),
            Box::new(RecordingCamera::default()),
            Box::new(FixedClassifier("banana")),
        ),
    );
    let err = pipeline.run(ScanOptions::default()).await.unwrap_err();

    assert!(matches!(err, ScanError::StageFailed { ref stage, .. } if stage == "calibrate"));
    assert_eq!(pipeline.state(), PipelineState::Failed);
    let last = pipeline.timeline().last().unwrap();
    assert_eq!(last.stage, "calibrate");
    assert!(!last.succeeded);

    let results: Vec<_> = std::fs::read_dir(&out_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("result_"))
        .collect();
    assert!(results.is_empty());
    assert!(!index_log.exists());
}

#[tokio::test]
async fn test_failed_result_write_leaves_no_index_row() {
    let dir = TempDir::new().unwrap();
    write_calibration(dir.path(), "banana_cal.json", RIPE_RULES);
    let config = test_config(dir.path());
    let index_log = config.index_log.clone();

    let mut pipeline = Pipeline::new(
        config,
        collaborators(
            steady_sensor(),
            Box::new(ResultPathSquatter),
            Box::new(FixedClassifier("banana")),
        ),
    );
    let err = pipeline.run(ScanOptions::default()).await.unwrap_err();

    assert!(matches!(err, ScanError::StageFailed { ref stage, .. } if stage == "persist"));
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert!(!index_log.exists());
}

#[tokio::test]
async fn test_sensor_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = Pipeline::new(
        test_config(dir.path()),
        collaborators(
            Box::new(DeadSensor),
            Box::new(RecordingCamera::default()),
            Box::new(FixedClassifier("banana")),
        ),
    );
    let err = pipeline.run(ScanOptions::default()).await.unwrap_err();
    match err {
        ScanError::StageFailed { stage, source } => {
            assert_eq!(stage, "acquire");
            assert!(matches!(*source, ScanError::Common(Error::SensorUnavailable(_))));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_stuck_sensor_times_out() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.timeouts.acquire_ms = 50;

    let mut pipeline = Pipeline::new(
        config,
        collaborators(
            Box::new(StuckSensor),
            Box::new(RecordingCamera::default()),
            Box::new(FixedClassifier("banana")),
        ),
    );
    let err = pipeline.run(ScanOptions::default()).await.unwrap_err();
    assert!(matches!(err, ScanError::StageTimeout { ref stage, timeout_ms: 50 } if stage == "acquire"));
    assert_eq!(pipeline.state(), PipelineState::Failed);
}

#[tokio::test]
async fn test_autotune_writes_calibration_before_scoring() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = Pipeline::new(
        test_config(dir.path()),
        collaborators(
            steady_sensor(),
            Box::new(RecordingCamera::default()),
            Box::new(FixedClassifier("banana")),
        ),
    );
    let options = ScanOptions {
        autotune: Some("banana:r_over_g:>=:0.25".parse::<AutotuneRequest>().unwrap()),
        ..ScanOptions::default()
    };
    let result = pipeline.run(options).await.unwrap();

    let applied = result.autotune.as_ref().unwrap();
    assert_eq!(applied.calibration, dir.path().join("cal/banana_cal.json"));
    assert!(applied.backup.is_none());
    assert!(applied.calibration.exists());
    assert_eq!(result.decision.label, "ripe");
    assert!(pipeline.history().contains(&PipelineState::Autotune));

    let saved = frad_common::calibration::load_calibration(&applied.calibration).unwrap();
    assert_eq!(saved.decision.unwrap().rules.len(), 1);
}

#[tokio::test]
async fn test_autotune_for_other_fruit_leaves_calibration_alone() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = Pipeline::new(
        test_config(dir.path()),
        collaborators(
            steady_sensor(),
            Box::new(RecordingCamera::default()),
            Box::new(FixedClassifier("banana")),
        ),
    );
    let options = ScanOptions {
        autotune: Some("mango:r_over_g:>=:0.25".parse::<AutotuneRequest>().unwrap()),
        ..ScanOptions::default()
    };
    let result = pipeline.run(options).await.unwrap();

    assert!(result.autotune.is_none());
    assert!(!dir.path().join("cal/banana_cal.json").exists());
}
