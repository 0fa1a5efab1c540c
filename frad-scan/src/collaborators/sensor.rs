//! Spectral sensor back-ends
//!
//! Priority: [`CommandSensor`] (external reader program) first, then
//! [`SimulatedSensor`] when fake readings are enabled. No back-end is
//! `SensorUnavailable`.

use crate::config::AcquisitionConfig;
use crate::error::{Result, ScanError};
use async_trait::async_trait;
use frad_common::{Channel, ChannelReading, Error};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Budget for the startup probe of a command sensor
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of complete channel readings
#[async_trait]
pub trait SpectralSensor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the back-end can produce a reading right now
    async fn probe(&self) -> bool;

    /// Average of `sample_count` raw reads taken `inter_sample_delay` apart
    ///
    /// Every one of the ten channels must be present, otherwise
    /// `SensorUnavailable`.
    async fn read_channels(
        &self,
        sample_count: u32,
        inter_sample_delay: Duration,
    ) -> Result<ChannelReading>;
}

/// Runs an external program that prints one JSON object of channel values
///
/// `{"F1": 812, ..., "F8": 455, "CLEAR": 2210, "NIR": 130}`
pub struct CommandSensor {
    program: String,
    args: Vec<String>,
}

impl CommandSensor {
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    async fn read_once(&self) -> Result<ChannelReading> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::SensorUnavailable(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(Error::SensorUnavailable(format!(
                "{} exited with {:?}: {}",
                self.program,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }

        parse_reading(&output.stdout)
    }
}

/// Parse one complete JSON channel reading
fn parse_reading(stdout: &[u8]) -> Result<ChannelReading> {
    let raw: BTreeMap<String, f64> = serde_json::from_slice(stdout)
        .map_err(|e| Error::SensorUnavailable(format!("unreadable sensor output: {}", e)))?;

    let mut map = BTreeMap::new();
    for (key, value) in raw {
        if let Ok(channel) = key.parse::<Channel>() {
            map.insert(channel, value);
        }
    }
    let missing: Vec<&str> = Channel::ALL
        .iter()
        .filter(|c| !map.contains_key(c))
        .map(|c| c.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(Error::SensorUnavailable(format!(
            "sensor reading missing channels: {}",
            missing.join(", ")
        ))
        .into());
    }

    Ok(ChannelReading::from_map(&map)?)
}

#[async_trait]
impl SpectralSensor for CommandSensor {
    fn name(&self) -> &str {
        "command"
    }

    async fn probe(&self) -> bool {
        match tokio::time::timeout(PROBE_TIMEOUT, self.read_once()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(program = %self.program, error = %e, "Sensor command probe failed");
                false
            }
            Err(_) => {
                warn!(program = %self.program, "Sensor command probe timed out");
                false
            }
        }
    }

    async fn read_channels(
        &self,
        sample_count: u32,
        inter_sample_delay: Duration,
    ) -> Result<ChannelReading> {
        let mut reads = Vec::with_capacity(sample_count.max(1) as usize);
        for i in 0..sample_count.max(1) {
            if i > 0 {
                tokio::time::sleep(inter_sample_delay).await;
            }
            reads.push(self.read_once().await?);
        }
        ChannelReading::average(&reads)
            .ok_or_else(|| Error::SensorUnavailable("no samples read".to_string()).into())
    }
}

/// Simulated sensor producing a plausible fruit spectrum with small noise
pub struct SimulatedSensor {
    base: [f64; 10],
    noise: f64,
    rng: Mutex<StdRng>,
}

impl SimulatedSensor {
    /// Spectrum of a ripening yellow fruit under white light
    pub const DEFAULT_BASE: [f64; 10] = [
        120.0, 210.0, 340.0, 520.0, 880.0, 940.0, 760.0, 410.0, 4200.0, 260.0,
    ];

    pub fn new() -> Self {
        Self::with_rng(Self::DEFAULT_BASE, 0.02, StdRng::from_entropy())
    }

    /// Deterministic sensor for tests
    pub fn with_seed(base: [f64; 10], noise: f64, seed: u64) -> Self {
        Self::with_rng(base, noise, StdRng::seed_from_u64(seed))
    }

    fn with_rng(base: [f64; 10], noise: f64, rng: StdRng) -> Self {
        Self {
            base,
            noise: noise.abs(),
            rng: Mutex::new(rng),
        }
    }

    fn sample(&self) -> Result<ChannelReading> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| ScanError::Collaborator("simulated sensor state poisoned".to_string()))?;
        let mut values = self.base;
        if self.noise > 0.0 {
            for v in values.iter_mut() {
                *v = (*v * (1.0 + rng.gen_range(-self.noise..=self.noise))).max(0.0);
            }
        }
        Ok(ChannelReading::from_values(values))
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpectralSensor for SimulatedSensor {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn probe(&self) -> bool {
        true
    }

    async fn read_channels(
        &self,
        sample_count: u32,
        inter_sample_delay: Duration,
    ) -> Result<ChannelReading> {
        let mut reads = Vec::with_capacity(sample_count.max(1) as usize);
        for i in 0..sample_count.max(1) {
            if i > 0 && !inter_sample_delay.is_zero() {
                tokio::time::sleep(inter_sample_delay).await;
            }
            reads.push(self.sample()?);
        }
        ChannelReading::average(&reads)
            .ok_or_else(|| Error::SensorUnavailable("no samples read".to_string()).into())
    }
}

/// Pick the first back-end that answers its probe
pub async fn select_sensor(config: &AcquisitionConfig) -> Result<Box<dyn SpectralSensor>> {
    let mut candidates: Vec<Box<dyn SpectralSensor>> = Vec::new();
    if let Some(sensor) = config.sensor_command.as_deref().and_then(CommandSensor::new) {
        candidates.push(Box::new(sensor));
    }
    if config.fake_sensor {
        candidates.push(Box::new(SimulatedSensor::new()));
    }

    for sensor in candidates {
        debug!(backend = sensor.name(), "Probing sensor back-end");
        if sensor.probe().await {
            info!(backend = sensor.name(), "Spectral sensor selected");
            return Ok(sensor);
        }
    }

    Err(Error::SensorUnavailable(
        "no sensor back-end answered (configure acquisition.sensor_command or enable fake readings)"
            .to_string(),
    )
    .into())
}
