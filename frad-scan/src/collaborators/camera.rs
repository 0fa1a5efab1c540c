//! Still-image capture

use crate::config::CameraConfig;
use crate::error::{Result, ScanError};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

#[async_trait]
pub trait Camera: Send + Sync {
    fn name(&self) -> &str;

    /// Capture one image to `path`; a non-zero exit status is an error
    async fn capture_image(&self, path: &Path, extra_args: &[String]) -> Result<()>;
}

/// Runs `<program> <args..> <extra args..> -o <path>`
pub struct CommandCamera {
    program: String,
    args: Vec<String>,
}

impl CommandCamera {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Camera for CommandCamera {
    fn name(&self) -> &str {
        &self.program
    }

    async fn capture_image(&self, path: &Path, extra_args: &[String]) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        debug!(program = %self.program, path = %path.display(), extra = ?extra_args, "Capturing image");

        let status = Command::new(&self.program)
            .args(&self.args)
            .args(extra_args)
            .arg("-o")
            .arg(path)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| ScanError::Collaborator(format!("{}: {}", self.program, e)))?;

        if !status.success() {
            return Err(ScanError::Collaborator(format!(
                "{} exited with status {:?}",
                self.program,
                status.code()
            )));
        }
        info!(path = %path.display(), "Image captured");
        Ok(())
    }
}

/// Camera disabled by configuration; every capture fails
pub struct NullCamera;

#[async_trait]
impl Camera for NullCamera {
    fn name(&self) -> &str {
        "none"
    }

    async fn capture_image(&self, _path: &Path, _extra_args: &[String]) -> Result<()> {
        Err(ScanError::Collaborator("camera disabled".to_string()))
    }
}

/// Command camera unless the configured program is empty
pub fn select_camera(config: &CameraConfig) -> Box<dyn Camera> {
    if config.program.trim().is_empty() {
        Box::new(NullCamera)
    } else {
        Box::new(CommandCamera::new(config.program.clone(), config.args.clone()))
    }
}
