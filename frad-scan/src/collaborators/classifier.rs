//! Fruit-type classification
//!
//! The image model is an external program; this crate only reads its
//! answer. Without one configured, a filename heuristic stands in.

use crate::config::ClassifierConfig;
use crate::error::{Result, ScanError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Fruit label substrings recognized by [`FilenameClassifier`]
const KNOWN_FRUITS: [&str; 4] = ["banana", "mango", "avocado", "apple"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub fruit: String,
    pub confidence: f64,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_model() -> String {
    "external".to_string()
}

impl Classification {
    /// Default when classification failed or was inconclusive
    pub fn unknown() -> Self {
        Self {
            fruit: frad_common::profiles::UNKNOWN_FRUIT.to_string(),
            confidence: 0.0,
            model: "none".to_string(),
        }
    }
}

#[async_trait]
pub trait FruitClassifier: Send + Sync {
    fn name(&self) -> &str;

    /// Classify the captured image, or `None` when no image is available
    async fn classify(&self, image: Option<&Path>) -> Result<Classification>;
}

/// Runs `<command..> <image>` and parses `{"fruit", "confidence", "model"}` from stdout
pub struct CommandClassifier {
    program: String,
    args: Vec<String>,
}

impl CommandClassifier {
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl FruitClassifier for CommandClassifier {
    fn name(&self) -> &str {
        &self.program
    }

    async fn classify(&self, image: Option<&Path>) -> Result<Classification> {
        let image = image
            .ok_or_else(|| ScanError::Collaborator("no image to classify".to_string()))?;

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ScanError::Collaborator(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(ScanError::Collaborator(format!(
                "{} exited with {:?}: {}",
                self.program,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut result: Classification = serde_json::from_slice(&output.stdout)
            .map_err(|e| ScanError::Collaborator(format!("unreadable classifier output: {}", e)))?;
        result.fruit = frad_common::profiles::canonical_name(&result.fruit);
        result.confidence = result.confidence.clamp(0.0, 1.0);
        debug!(fruit = %result.fruit, confidence = result.confidence, "Classifier answered");
        Ok(result)
    }
}

/// Guesses the fruit from the image file name
pub struct FilenameClassifier;

impl FilenameClassifier {
    pub const MODEL: &'static str = "stub-v0";

    pub fn guess(name: &str) -> Classification {
        let lower = name.to_lowercase();
        match KNOWN_FRUITS.iter().find(|f| lower.contains(*f)) {
            Some(fruit) => Classification {
                fruit: fruit.to_string(),
                confidence: 0.9,
                model: Self::MODEL.to_string(),
            },
            None => Classification {
                fruit: frad_common::profiles::UNKNOWN_FRUIT.to_string(),
                confidence: 0.5,
                model: Self::MODEL.to_string(),
            },
        }
    }
}

#[async_trait]
impl FruitClassifier for FilenameClassifier {
    fn name(&self) -> &str {
        Self::MODEL
    }

    async fn classify(&self, image: Option<&Path>) -> Result<Classification> {
        let name = image
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::guess(&name))
    }
}

/// Command classifier when configured, filename heuristic otherwise
pub fn select_classifier(config: &ClassifierConfig) -> Box<dyn FruitClassifier> {
    match config.command.as_deref().and_then(CommandClassifier::new) {
        Some(classifier) => Box::new(classifier),
        None => Box::new(FilenameClassifier),
    }
}
