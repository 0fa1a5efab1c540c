//! Calibration documents
//!
//! A calibration document carries per-channel `{offset, scale}` pairs and an
//! optional [`DecisionConfig`]:
//!
//! ```json
//! {
//!   "channels": { "F1": {"offset": -12.0, "scale": 0.0011}, "NIR": {"scale": 0.9} },
//!   "decision": { "rules": [ {"feature": "r_over_g", "op": ">=", "value": 1.2} ],
//!                 "fallback": "unripe" }
//! }
//! ```
//!
//! Accepted on load, written back in the canonical form above:
//! - `channels` as a positional list in `F1..F8, CLEAR, NIR` order
//! - legacy wizard output whose top-level keys are channel names; those
//!   documents store the dark level as a subtractive offset, so the sign is
//!   flipped on load
//!
//! Unknown channel keys are dropped with a warning. Unknown top-level keys
//! are kept and written back by [`save_calibration`].

use crate::atomic_write::write_with_backup;
use crate::channels::{Channel, ChannelReading};
use crate::decision::DecisionConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Smallest white-minus-dark span used when deriving a scale
pub const MIN_REFERENCE_SPAN: f64 = 1e-6;

/// Per-channel linear correction: `(value + offset) * scale`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelCalibration {
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_scale() -> f64 {
    1.0
}

impl Default for ChannelCalibration {
    fn default() -> Self {
        Self {
            offset: 0.0,
            scale: 1.0,
        }
    }
}

impl ChannelCalibration {
    pub fn apply(&self, value: f64) -> f64 {
        (value + self.offset) * self.scale
    }
}

/// Parsed calibration document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationProfile {
    pub channels: BTreeMap<Channel, ChannelCalibration>,
    pub decision: Option<DecisionConfig>,
    /// Top-level keys this crate does not interpret
    pub extra: Map<String, Value>,
}

impl CalibrationProfile {
    /// Parse a document already decoded to JSON
    ///
    /// `path` is only used for error messages.
    pub fn from_value(value: Value, path: &Path) -> Result<Self> {
        let Value::Object(mut doc) = value else {
            return Err(Error::malformed(path, "calibration document is not an object"));
        };

        let channels = match doc.remove("channels") {
            Some(Value::Object(map)) => parse_channel_map(map, path, false)?,
            Some(Value::Array(list)) => parse_channel_list(list, path)?,
            Some(Value::Null) | None => {
                // Legacy documents: channel names at the top level
                let legacy: Map<String, Value> = doc
                    .iter()
                    .filter(|(k, _)| k.parse::<Channel>().is_ok())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for key in legacy.keys() {
                    doc.remove(key);
                }
                parse_channel_map(legacy, path, true)?
            }
            Some(other) => {
                return Err(Error::malformed(
                    path,
                    format!("'channels' must be an object or a list, got {}", other),
                ))
            }
        };

        let decision = match doc.remove("decision") {
            Some(Value::Null) | None => None,
            Some(v) => {
                let config: DecisionConfig = serde_json::from_value(v)
                    .map_err(|e| Error::malformed(path, format!("decision: {}", e)))?;
                config
                    .validate()
                    .map_err(|reason| Error::malformed(path, reason))?;
                Some(config)
            }
        };

        Ok(Self {
            channels,
            decision,
            extra: doc,
        })
    }

    /// Canonical JSON form
    pub fn to_value(&self) -> Result<Value> {
        let mut doc = self.extra.clone();
        let channels: Map<String, Value> = self
            .channels
            .iter()
            .map(|(ch, cal)| Ok((ch.as_str().to_string(), serde_json::to_value(cal)?)))
            .collect::<Result<_>>()?;
        doc.insert("channels".to_string(), Value::Object(channels));
        if let Some(decision) = &self.decision {
            doc.insert("decision".to_string(), serde_json::to_value(decision)?);
        }
        Ok(Value::Object(doc))
    }
}

fn parse_channel_entry(value: Value, key: &str, path: &Path) -> Result<ChannelCalibration> {
    serde_json::from_value(value)
        .map_err(|e| Error::malformed(path, format!("channel {}: {}", key, e)))
}

fn parse_channel_map(
    map: Map<String, Value>,
    path: &Path,
    subtractive_offsets: bool,
) -> Result<BTreeMap<Channel, ChannelCalibration>> {
    let mut channels = BTreeMap::new();
    for (key, value) in map {
        let Ok(channel) = key.parse::<Channel>() else {
            warn!(path = %path.display(), channel = %key, "Unknown calibration channel dropped");
            continue;
        };
        let mut cal = parse_channel_entry(value, &key, path)?;
        if subtractive_offsets {
            cal.offset = -cal.offset;
        }
        channels.insert(channel, cal);
    }
    Ok(channels)
}

fn parse_channel_list(
    list: Vec<Value>,
    path: &Path,
) -> Result<BTreeMap<Channel, ChannelCalibration>> {
    if list.len() > Channel::ALL.len() {
        warn!(
            path = %path.display(),
            entries = list.len(),
            "Calibration list longer than channel set, extra entries dropped"
        );
    }
    list.into_iter()
        .zip(Channel::ALL)
        .map(|(value, channel)| Ok((channel, parse_channel_entry(value, channel.as_str(), path)?)))
        .collect()
}

/// Load a calibration document
///
/// `NotFound` when the file does not exist, `Malformed` when it cannot be
/// parsed into a calibration profile.
pub fn load_calibration(path: &Path) -> Result<CalibrationProfile> {
    if !path.exists() {
        return Err(Error::NotFound(format!(
            "calibration file {}",
            path.display()
        )));
    }
    let text = fs::read_to_string(path)?;
    let value: Value =
        serde_json::from_str(&text).map_err(|e| Error::malformed(path, e.to_string()))?;
    CalibrationProfile::from_value(value, path)
}

/// Apply per-channel corrections; channels absent from the profile pass through
pub fn apply_calibration(reading: &ChannelReading, profile: &CalibrationProfile) -> ChannelReading {
    reading.map(|channel, value| match profile.channels.get(&channel) {
        Some(cal) => cal.apply(value),
        None => value,
    })
}

/// Save atomically, backing up any existing document
///
/// Returns the backup path when one was made.
pub fn save_calibration(path: &Path, profile: &CalibrationProfile) -> Result<Option<PathBuf>> {
    let text = serde_json::to_string_pretty(&profile.to_value()?)?;
    let backup = write_with_backup(path, text.as_bytes())?;
    info!(
        path = %path.display(),
        backup = ?backup.as_ref().map(|b| b.display().to_string()),
        "Calibration saved"
    );
    Ok(backup)
}

/// Build channel corrections from dark and white reference readings
///
/// After correction the dark reference maps to 0 and the white reference
/// to 1 on every channel.
pub fn derive_from_references(
    dark: &ChannelReading,
    white: &ChannelReading,
) -> BTreeMap<Channel, ChannelCalibration> {
    Channel::ALL
        .iter()
        .map(|&channel| {
            let d = dark.get(channel);
            let span = (white.get(channel) - d).max(MIN_REFERENCE_SPAN);
            (
                channel,
                ChannelCalibration {
                    offset: -d,
                    scale: 1.0 / span,
                },
            )
        })
        .collect()
}
