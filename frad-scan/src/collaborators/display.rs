//! Status display
//!
//! Display calls are fire-and-forget: [`DisplayHandle`] logs and swallows
//! every back-end error so a broken panel never aborts a scan.

use crate::error::Result;
use tracing::{info, warn};

pub trait StatusDisplay: Send + Sync {
    fn show_stage(&self, step: usize, total: usize, label: &str) -> Result<()>;
    fn show_result(&self, label: &str, emphasize: bool) -> Result<()>;
    fn show_message(&self, top: &str, bottom: &str) -> Result<()>;
}

/// Writes status updates to the log
pub struct LogDisplay;

impl StatusDisplay for LogDisplay {
    fn show_stage(&self, step: usize, total: usize, label: &str) -> Result<()> {
        info!(target: "frad::display", "[{}/{}] {}", step, total, label);
        Ok(())
    }

    fn show_result(&self, label: &str, emphasize: bool) -> Result<()> {
        if emphasize {
            info!(target: "frad::display", "RESULT: {} !", label.to_uppercase());
        } else {
            info!(target: "frad::display", "RESULT: {}", label.to_uppercase());
        }
        Ok(())
    }

    fn show_message(&self, top: &str, bottom: &str) -> Result<()> {
        info!(target: "frad::display", "{} | {}", top, bottom);
        Ok(())
    }
}

/// Display turned off (`--no-display`)
pub struct NullDisplay;

impl StatusDisplay for NullDisplay {
    fn show_stage(&self, _step: usize, _total: usize, _label: &str) -> Result<()> {
        Ok(())
    }

    fn show_result(&self, _label: &str, _emphasize: bool) -> Result<()> {
        Ok(())
    }

    fn show_message(&self, _top: &str, _bottom: &str) -> Result<()> {
        Ok(())
    }
}

pub struct DisplayHandle {
    inner: Box<dyn StatusDisplay>,
}

impl DisplayHandle {
    pub fn new(inner: Box<dyn StatusDisplay>) -> Self {
        Self { inner }
    }

    pub fn stage(&self, step: usize, total: usize, label: &str) {
        if let Err(e) = self.inner.show_stage(step, total, label) {
            warn!(error = %e, "Display stage update failed");
        }
    }

    pub fn result(&self, label: &str, emphasize: bool) {
        if let Err(e) = self.inner.show_result(label, emphasize) {
            warn!(error = %e, "Display result update failed");
        }
    }

    pub fn message(&self, top: &str, bottom: &str) {
        if let Err(e) = self.inner.show_message(top, bottom) {
            warn!(error = %e, "Display message failed");
        }
    }
}
