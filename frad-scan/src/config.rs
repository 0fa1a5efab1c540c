//! Bootstrap configuration for the scanner
//!
//! Loaded once at startup from TOML. Every field has a built-in default,
//! so an absent file is not an error; a file that exists but does not parse
//! is.
//!
//! # Resolution priority
//!
//! 1. `--config <path>`
//! 2. `FRAD_CONFIG` environment variable
//! 3. `<config_dir>/frad/config.toml`
//! 4. Built-in defaults

use frad_common::Error;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable naming a config file
pub const CONFIG_ENV_VAR: &str = "FRAD_CONFIG";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Output directory for images, stage artifacts and results
    pub out_dir: PathBuf,

    /// Directory of per-fruit calibration documents
    pub calibration_dir: PathBuf,

    /// Fruit profiles document
    pub profiles_path: PathBuf,

    /// Append-only index-row file
    pub index_log: PathBuf,

    pub acquisition: AcquisitionConfig,
    pub timeouts: TimeoutConfig,
    pub camera: CameraConfig,
    pub classifier: ClassifierConfig,
    pub decision: DecisionDefaults,
    pub logging: LoggingConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("out"),
            calibration_dir: PathBuf::from("cal"),
            profiles_path: PathBuf::from("profiles.json"),
            index_log: PathBuf::from("out/index_log.csv"),
            acquisition: AcquisitionConfig::default(),
            timeouts: TimeoutConfig::default(),
            camera: CameraConfig::default(),
            classifier: ClassifierConfig::default(),
            decision: DecisionDefaults::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Spectral acquisition settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Raw sensor reads averaged into one reading
    pub samples: u32,
    /// Readings taken per scan (overridden by `--count`)
    pub sample_count: usize,
    pub inter_sample_delay_ms: u64,
    pub smoothing_window: usize,
    /// Allow the simulated sensor when no hardware back-end answers
    pub fake_sensor: bool,
    /// External command printing one JSON channel reading per invocation
    pub sensor_command: Option<Vec<String>>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            samples: 10,
            sample_count: 5,
            inter_sample_delay_ms: 100,
            smoothing_window: 3,
            fake_sensor: false,
            sensor_command: None,
        }
    }
}

impl AcquisitionConfig {
    pub fn inter_sample_delay(&self) -> Duration {
        Duration::from_millis(self.inter_sample_delay_ms)
    }
}

/// Per-stage time budgets in milliseconds
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub capture_ms: u64,
    pub classify_ms: u64,
    pub resolve_ms: u64,
    pub acquire_ms: u64,
    pub normalize_ms: u64,
    pub calibrate_ms: u64,
    pub index_ms: u64,
    pub autotune_ms: u64,
    pub score_ms: u64,
    pub persist_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            capture_ms: 15_000,
            classify_ms: 30_000,
            resolve_ms: 5_000,
            acquire_ms: 60_000,
            normalize_ms: 10_000,
            calibrate_ms: 10_000,
            index_ms: 10_000,
            autotune_ms: 10_000,
            score_ms: 10_000,
            persist_ms: 5_000,
        }
    }
}

/// Camera command
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Program invoked as `<program> <args..> <extra args..> -o <path>`; empty disables capture
    pub program: String,
    pub args: Vec<String>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            program: "rpicam-still".to_string(),
            args: vec!["-n".to_string(), "-t".to_string(), "1000".to_string()],
        }
    }
}

/// Fruit classifier command
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Program and arguments; the image path is appended. `None` uses the filename heuristic
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DecisionDefaults {
    /// Confidence reported when the rule vote falls back
    pub default_confidence: f64,
}

impl Default for DecisionDefaults {
    fn default() -> Self {
        Self {
            default_confidence: 0.5,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl TimeoutConfig {
    pub fn capture(&self) -> Duration {
        Duration::from_millis(self.capture_ms)
    }

    pub fn classify(&self) -> Duration {
        Duration::from_millis(self.classify_ms)
    }

    pub fn resolve(&self) -> Duration {
        Duration::from_millis(self.resolve_ms)
    }

    pub fn acquire(&self) -> Duration {
        Duration::from_millis(self.acquire_ms)
    }

    pub fn normalize(&self) -> Duration {
        Duration::from_millis(self.normalize_ms)
    }

    pub fn calibrate(&self) -> Duration {
        Duration::from_millis(self.calibrate_ms)
    }

    pub fn index(&self) -> Duration {
        Duration::from_millis(self.index_ms)
    }

    pub fn autotune(&self) -> Duration {
        Duration::from_millis(self.autotune_ms)
    }

    pub fn score(&self) -> Duration {
        Duration::from_millis(self.score_ms)
    }

    pub fn persist(&self) -> Duration {
        Duration::from_millis(self.persist_ms)
    }
}

impl ScanConfig {
    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> frad_common::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&text).map_err(|e| {
            Error::Config(format!("Failed to parse TOML {}: {}", path.display(), e))
        })
    }

    /// Resolve and load the config following the priority order above
    ///
    /// Explicitly named files (CLI or environment) must exist; the per-user
    /// file is only used when present.
    pub fn load(cli_path: Option<&Path>) -> frad_common::Result<Self> {
        if let Some(path) = cli_path {
            info!(path = %path.display(), "Config from command line");
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                let path = PathBuf::from(path);
                info!(path = %path.display(), "Config from {}", CONFIG_ENV_VAR);
                return Self::from_file(&path);
            }
        }

        if let Some(path) = user_config_path().filter(|p| p.exists()) {
            info!(path = %path.display(), "Config from user config directory");
            return Self::from_file(&path);
        }

        info!("No config file found, using built-in defaults");
        Ok(Self::default())
    }

    /// Calibration document for a fruit when its profile names none
    pub fn default_calibration_path(&self, fruit: &str) -> PathBuf {
        let stem = frad_common::profiles::canonical_name(fruit).replace(' ', "_");
        self.calibration_dir.join(format!("{}_cal.json", stem))
    }
}

/// `<config_dir>/frad/config.toml`
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("frad").join("config.toml"))
}
