//! External collaborators of the scan pipeline
//!
//! Hardware and model access sits behind small traits so the orchestrator
//! never depends on a concrete back-end. Back-ends are chosen once at
//! startup from a priority list ([`select_sensor`], [`select_camera`],
//! [`select_classifier`]) and are not re-probed during a run.

pub mod camera;
pub mod classifier;
pub mod display;
pub mod sensor;

pub use camera::{select_camera, Camera, CommandCamera, NullCamera};
pub use classifier::{select_classifier, Classification, CommandClassifier, FilenameClassifier, FruitClassifier};
pub use display::{DisplayHandle, LogDisplay, NullDisplay, StatusDisplay};
pub use sensor::{select_sensor, CommandSensor, SimulatedSensor, SpectralSensor};

use crate::config::ScanConfig;
use crate::error::Result;

/// Back-ends used by one pipeline run
pub struct Collaborators {
    pub sensor: Box<dyn SpectralSensor>,
    pub camera: Box<dyn Camera>,
    pub classifier: Box<dyn FruitClassifier>,
    pub display: DisplayHandle,
}

impl Collaborators {
    /// Select every back-end from the configuration
    ///
    /// Fails only when no spectral sensor is available.
    pub async fn from_config(config: &ScanConfig, show_display: bool) -> Result<Self> {
        let sensor = select_sensor(&config.acquisition).await?;
        let display: Box<dyn StatusDisplay> = if show_display {
            Box::new(LogDisplay)
        } else {
            Box::new(NullDisplay)
        };

        Ok(Self {
            sensor,
            camera: select_camera(&config.camera),
            classifier: select_classifier(&config.classifier),
            display: DisplayHandle::new(display),
        })
    }
}
