//! Channel math
//!
//! Pure functions over spectral readings: normalization by a reference
//! channel, trailing moving-average smoothing, and ripeness index
//! derivation from green/yellow/red band proxies.
//!
//! A reading always carries all ten channels (F1..F8, CLEAR, NIR). Partial
//! inputs are completed at construction time: CLEAR defaults to the mean of
//! the visible bands and NIR to the last visible band.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

/// Floor applied to the green denominator of the ratio indices
pub const RATIO_EPSILON: f64 = 1e-9;

/// Names of the derived index columns, in file order
pub const INDEX_KEYS: [&str; 4] = ["y_over_g", "r_over_g", "nir_over_red", "green_drop"];

/// One spectral measurement band
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Channel {
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    #[serde(rename = "CLEAR")]
    Clear,
    #[serde(rename = "NIR")]
    Nir,
}

impl Channel {
    /// All channels in storage order
    pub const ALL: [Channel; 10] = [
        Channel::F1,
        Channel::F2,
        Channel::F3,
        Channel::F4,
        Channel::F5,
        Channel::F6,
        Channel::F7,
        Channel::F8,
        Channel::Clear,
        Channel::Nir,
    ];

    /// The eight visible bands, shortest wavelength first
    pub const VISIBLE: [Channel; 8] = [
        Channel::F1,
        Channel::F2,
        Channel::F3,
        Channel::F4,
        Channel::F5,
        Channel::F6,
        Channel::F7,
        Channel::F8,
    ];

    /// Position in a reading's value array
    pub fn index(self) -> usize {
        self as usize
    }

    /// Sensor channel name (`F1`..`F8`, `CLEAR`, `NIR`)
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::F1 => "F1",
            Channel::F2 => "F2",
            Channel::F3 => "F3",
            Channel::F4 => "F4",
            Channel::F5 => "F5",
            Channel::F6 => "F6",
            Channel::F7 => "F7",
            Channel::F8 => "F8",
            Channel::Clear => "CLEAR",
            Channel::Nir => "NIR",
        }
    }

    /// Nominal center wavelength of a visible band
    pub fn wavelength_nm(self) -> Option<u16> {
        match self {
            Channel::F1 => Some(415),
            Channel::F2 => Some(445),
            Channel::F3 => Some(480),
            Channel::F4 => Some(515),
            Channel::F5 => Some(555),
            Channel::F6 => Some(590),
            Channel::F7 => Some(630),
            Channel::F8 => Some(680),
            Channel::Clear | Channel::Nir => None,
        }
    }

    /// Look up a visible band by a wavelength column name (`"480"` or `"480nm"`)
    pub fn from_wavelength(column: &str) -> Option<Channel> {
        let digits = column.trim().trim_end_matches("nm");
        let nm: u16 = digits.parse().ok()?;
        Channel::VISIBLE
            .into_iter()
            .find(|ch| ch.wavelength_nm() == Some(nm))
    }

    fn is_visible(self) -> bool {
        self.wavelength_nm().is_some()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        Channel::ALL
            .into_iter()
            .find(|ch| ch.as_str() == upper)
            .ok_or_else(|| Error::SchemaMismatch(format!("unknown channel '{}'", s)))
    }
}

/// One complete acquisition sample: a non-negative intensity per channel
///
/// Immutable after construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelReading {
    values: [f64; 10],
}

impl ChannelReading {
    /// Build a reading from a complete value array (storage order of [`Channel::ALL`])
    pub fn from_values(values: [f64; 10]) -> Self {
        Self { values }
    }

    /// Build a reading from a channel map, completing CLEAR and NIR
    ///
    /// All eight visible bands are required. Values must be finite and
    /// non-negative.
    pub fn from_map(map: &BTreeMap<Channel, f64>) -> Result<Self> {
        let missing: Vec<&str> = Channel::VISIBLE
            .iter()
            .filter(|ch| !map.contains_key(ch))
            .map(|ch| ch.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(Error::SchemaMismatch(format!(
                "reading is missing visible bands: {}",
                missing.join(", ")
            )));
        }

        let mut values = [0.0; 10];
        for (&channel, &value) in map {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidInput(format!(
                    "channel {} has invalid intensity {}",
                    channel, value
                )));
            }
            values[channel.index()] = value;
        }

        if !map.contains_key(&Channel::Clear) {
            let visible_sum: f64 = Channel::VISIBLE.iter().map(|ch| values[ch.index()]).sum();
            values[Channel::Clear.index()] = visible_sum / Channel::VISIBLE.len() as f64;
        }
        if !map.contains_key(&Channel::Nir) {
            values[Channel::Nir.index()] = values[Channel::F8.index()];
        }

        Ok(Self { values })
    }

    /// Build a reading from named columns
    ///
    /// Column names may be sensor names (`F3`, `CLEAR`) or wavelength names
    /// (`480`, `480nm`). When both name the same band, the wavelength column
    /// wins. Unrecognized columns (timestamps, labels) are ignored.
    pub fn from_columns<'a, I>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut by_sensor = BTreeMap::new();
        let mut by_wavelength = BTreeMap::new();
        for (name, value) in columns {
            if let Some(channel) = Channel::from_wavelength(name) {
                by_wavelength.insert(channel, value);
            } else if let Ok(channel) = name.parse::<Channel>() {
                by_sensor.insert(channel, value);
            }
        }
        by_sensor.extend(by_wavelength);
        Self::from_map(&by_sensor)
    }

    /// Intensity of one channel
    pub fn get(&self, channel: Channel) -> f64 {
        self.values[channel.index()]
    }

    /// Channels and values in storage order
    pub fn iter(&self) -> impl Iterator<Item = (Channel, f64)> + '_ {
        Channel::ALL.iter().map(move |&ch| (ch, self.values[ch.index()]))
    }

    /// Produce a new reading by transforming every channel
    pub fn map(&self, mut f: impl FnMut(Channel, f64) -> f64) -> Self {
        let mut values = self.values;
        for ch in Channel::ALL {
            values[ch.index()] = f(ch, self.values[ch.index()]);
        }
        Self { values }
    }

    /// Channel-wise mean of a sequence of readings
    pub fn average(readings: &[ChannelReading]) -> Option<Self> {
        if readings.is_empty() {
            return None;
        }
        let mut values = [0.0; 10];
        for reading in readings {
            for (slot, value) in values.iter_mut().zip(reading.values.iter()) {
                *slot += value;
            }
        }
        let n = readings.len() as f64;
        for slot in values.iter_mut() {
            *slot /= n;
        }
        Some(Self { values })
    }
}

/// Divide every channel by the reference channel
///
/// A non-positive reference yields all zeros, with the reference itself
/// recorded as 1.0 so downstream stages can tell "no signal" apart from a
/// dark reading.
pub fn normalize(reading: &ChannelReading, reference: Channel) -> ChannelReading {
    let denom = reading.get(reference);
    if denom <= 0.0 || !denom.is_finite() {
        return reading.map(|ch, _| if ch == reference { 1.0 } else { 0.0 });
    }
    reading.map(|ch, value| if ch == reference { 1.0 } else { value / denom })
}

/// Trailing moving average with an explicit history buffer
///
/// The window is clipped to the history seen so far: the first output is
/// the first input, the second is the mean of two, and so on.
#[derive(Debug, Clone)]
pub struct Smoother {
    window: usize,
    buffer: VecDeque<ChannelReading>,
    sum: [f64; 10],
}

impl Smoother {
    /// Create a smoother; a window of 0 behaves like 1 (no smoothing)
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            buffer: VecDeque::with_capacity(window),
            sum: [0.0; 10],
        }
    }

    /// Push a reading and return the current trailing average
    pub fn push(&mut self, reading: ChannelReading) -> ChannelReading {
        if self.buffer.len() == self.window {
            if let Some(oldest) = self.buffer.pop_front() {
                for (slot, value) in self.sum.iter_mut().zip(oldest.values.iter()) {
                    *slot -= value;
                }
            }
        }
        for (slot, value) in self.sum.iter_mut().zip(reading.values.iter()) {
            *slot += value;
        }
        self.buffer.push_back(reading);

        let n = self.buffer.len() as f64;
        let mut values = self.sum;
        for slot in values.iter_mut() {
            *slot /= n;
        }
        ChannelReading { values }
    }

    /// Drop all history
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.sum = [0.0; 10];
    }
}

/// Smooth a whole sequence with a fresh [`Smoother`]
pub fn smooth(readings: &[ChannelReading], window: usize) -> Vec<ChannelReading> {
    let mut smoother = Smoother::new(window);
    readings.iter().map(|r| smoother.push(*r)).collect()
}

/// Band proxies used for index derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandMap {
    pub green: Channel,
    pub yellow: Channel,
    pub red: Channel,
}

impl Default for BandMap {
    /// F3 (480nm) green, F5 (555nm) yellow, F7 (630nm) red
    fn default() -> Self {
        Self {
            green: Channel::F3,
            yellow: Channel::F5,
            red: Channel::F7,
        }
    }
}

impl BandMap {
    /// Target wavelengths (nm) for green, yellow and red
    pub const TARGET_NM: [u16; 3] = [480, 555, 630];

    /// Furthest a wavelength column may sit from its target band
    pub const MAX_OFFSET_NM: u16 = 40;

    /// Sensor column names used as proxies for green, yellow and red
    pub const SENSOR_COLUMNS: [&'static str; 3] = ["F3", "F5", "F7"];

    /// Resolve the band map from a tabular header
    ///
    /// Wavelength columns (`"515"`, `"555nm"`) take priority: each band maps
    /// to the nearest present wavelength within [`Self::MAX_OFFSET_NM`].
    /// Otherwise the F3/F5/F7 sensor columns are used as proxies.
    pub fn resolve<S: AsRef<str>>(columns: &[S]) -> Result<Self> {
        if let Some(map) = Self::from_wavelength_columns(columns) {
            return Ok(map);
        }

        let has_sensor_columns = Self::SENSOR_COLUMNS.iter().all(|w| {
            columns
                .iter()
                .any(|c| c.as_ref().trim().eq_ignore_ascii_case(w))
        });
        if has_sensor_columns {
            return Ok(Self::default());
        }

        let header: Vec<&str> = columns.iter().map(|c| c.as_ref()).collect();
        Err(Error::SchemaMismatch(format!(
            "no green/yellow/red columns in header [{}]",
            header.join(", ")
        )))
    }

    fn from_wavelength_columns<S: AsRef<str>>(columns: &[S]) -> Option<Self> {
        let present: Vec<Channel> = columns
            .iter()
            .filter_map(|c| Channel::from_wavelength(c.as_ref()))
            .collect();
        let nearest = |target: u16| {
            present
                .iter()
                .filter_map(|&ch| ch.wavelength_nm().map(|nm| (nm.abs_diff(target), ch)))
                .filter(|(offset, _)| *offset <= Self::MAX_OFFSET_NM)
                .min()
                .map(|(_, ch)| ch)
        };
        let [green, yellow, red] = Self::TARGET_NM;
        let map = Self {
            green: nearest(green)?,
            yellow: nearest(yellow)?,
            red: nearest(red)?,
        };
        map.validate().ok().map(|()| map)
    }

    fn validate(&self) -> Result<()> {
        let bands = [self.green, self.yellow, self.red];
        if let Some(bad) = bands.iter().find(|ch| !ch.is_visible()) {
            return Err(Error::SchemaMismatch(format!(
                "{} cannot serve as a color band proxy",
                bad
            )));
        }
        if self.green == self.yellow || self.green == self.red || self.yellow == self.red {
            return Err(Error::SchemaMismatch(format!(
                "band proxies must be distinct (g={}, y={}, r={})",
                self.green, self.yellow, self.red
            )));
        }
        Ok(())
    }
}

/// Derived ripeness indices for one reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexRow {
    pub y_over_g: f64,
    pub r_over_g: f64,
    pub nir_over_red: f64,
    pub green_drop: f64,
}

impl IndexRow {
    /// Look up an index by column name
    pub fn get(&self, key: &str) -> Option<f64> {
        match key {
            "y_over_g" => Some(self.y_over_g),
            "r_over_g" => Some(self.r_over_g),
            "nir_over_red" => Some(self.nir_over_red),
            "green_drop" => Some(self.green_drop),
            _ => None,
        }
    }

    /// Feature row view used by the decision engine
    pub fn features(&self) -> FeatureRow {
        INDEX_KEYS
            .iter()
            .filter_map(|k| self.get(k).map(|v| (k.to_string(), v)))
            .collect()
    }
}

/// Compute ratio indices from a reading
///
/// The green denominator is floored to [`RATIO_EPSILON`]; a dark green
/// band therefore produces very large ratios rather than an error.
pub fn compute_indices(reading: &ChannelReading, bands: &BandMap) -> Result<IndexRow> {
    bands.validate()?;

    let green = reading.get(bands.green);
    let yellow = reading.get(bands.yellow);
    let red = reading.get(bands.red);
    let nir = reading.get(Channel::Nir);
    let clear = reading.get(Channel::Clear);

    let green_denom = green.max(RATIO_EPSILON);

    Ok(IndexRow {
        y_over_g: yellow / green_denom,
        r_over_g: red / green_denom,
        nir_over_red: if red > 0.0 { nir / red } else { 0.0 },
        green_drop: if clear > 0.0 { green / clear } else { 0.0 },
    })
}

/// Named numeric features evaluated by decision rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureRow(BTreeMap<String, f64>);

impl FeatureRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    /// Value of a feature if present and numeric
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied().filter(|v| v.is_finite())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for FeatureRow {
    fn from_iter<T: IntoIterator<Item = (K, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(value: f64) -> ChannelReading {
        ChannelReading::from_values([value; 10])
    }

    fn reading(pairs: &[(&str, f64)]) -> ChannelReading {
        ChannelReading::from_columns(pairs.iter().copied()).unwrap()
    }

    #[test]
    fn test_missing_clear_and_nir_are_derived() {
        let r = reading(&[
            ("F1", 1.0),
            ("F2", 2.0),
            ("F3", 3.0),
            ("F4", 4.0),
            ("F5", 5.0),
            ("F6", 6.0),
            ("F7", 7.0),
            ("F8", 8.0),
        ]);
        assert_eq!(r.get(Channel::Clear), 4.5);
        assert_eq!(r.get(Channel::Nir), 8.0);
    }

    #[test]
    fn test_missing_visible_band_is_schema_mismatch() {
        let err = ChannelReading::from_columns([("F1", 1.0), ("F2", 1.0)]).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));
    }

    #[test]
    fn test_negative_intensity_rejected() {
        let mut map: BTreeMap<Channel, f64> = Channel::VISIBLE.iter().map(|&c| (c, 1.0)).collect();
        map.insert(Channel::F2, -3.0);
        assert!(matches!(
            ChannelReading::from_map(&map),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_wavelength_columns_win_over_sensor_columns() {
        let mut cols: Vec<(&str, f64)> = Channel::VISIBLE.iter().map(|c| (c.as_str(), 1.0)).collect();
        cols.push(("480", 9.0));
        let r = ChannelReading::from_columns(cols).unwrap();
        assert_eq!(r.get(Channel::F3), 9.0);
    }

    #[test]
    fn test_normalize_reference_is_exactly_one() {
        let r = reading(&[
            ("F1", 3.0),
            ("F2", 7.0),
            ("F3", 11.0),
            ("F4", 13.0),
            ("F5", 17.0),
            ("F6", 19.0),
            ("F7", 23.0),
            ("F8", 29.0),
            ("CLEAR", 0.3),
            ("NIR", 31.0),
        ]);
        let n = normalize(&r, Channel::Clear);
        assert_eq!(n.get(Channel::Clear), 1.0);
        assert!((n.get(Channel::F1) - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_normalize_without_signal() {
        let r = flat(500.0).map(|ch, v| if ch == Channel::Clear { 0.0 } else { v });
        let n = normalize(&r, Channel::Clear);
        assert_eq!(n.get(Channel::Clear), 1.0);
        for ch in Channel::VISIBLE {
            assert_eq!(n.get(ch), 0.0);
        }
        assert_eq!(n.get(Channel::Nir), 0.0);
    }

    #[test]
    fn test_smooth_window_is_clipped_to_history() {
        let seq = vec![flat(1.0), flat(3.0), flat(5.0), flat(7.0)];
        let out = smooth(&seq, 3);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].get(Channel::F1), 1.0);
        assert_eq!(out[1].get(Channel::F1), 2.0);
        assert_eq!(out[2].get(Channel::F1), 3.0);
        assert_eq!(out[3].get(Channel::F1), 5.0);
    }

    #[test]
    fn test_smoother_reset_restarts_history() {
        let mut s = Smoother::new(4);
        s.push(flat(10.0));
        s.reset();
        assert_eq!(s.push(flat(2.0)).get(Channel::F5), 2.0);
    }

    #[test]
    fn test_smoother_drops_oldest_from_window() {
        let mut s = Smoother::new(2);
        s.push(flat(100.0));
        s.push(flat(2.0));
        assert_eq!(s.push(flat(4.0)).get(Channel::F2), 3.0);
        assert_eq!(s.push(flat(6.0)).get(Channel::F2), 5.0);
    }

    #[test]
    fn test_uniform_reading_gives_unit_indices() {
        let r = flat(1000.0);
        let idx = compute_indices(&r, &BandMap::default()).unwrap();
        assert_eq!(
            idx,
            IndexRow {
                y_over_g: 1.0,
                r_over_g: 1.0,
                nir_over_red: 1.0,
                green_drop: 1.0
            }
        );
    }

    #[test]
    fn test_dark_green_uses_floored_denominator() {
        let r = flat(2.0).map(|ch, v| if ch == Channel::F3 { 0.0 } else { v });
        let idx = compute_indices(&r, &BandMap::default()).unwrap();
        assert_eq!(idx.y_over_g, 2.0 / RATIO_EPSILON);
        assert!(idx.y_over_g.is_finite());
        assert_eq!(idx.green_drop, 0.0);
    }

    #[test]
    fn test_dark_red_and_clear_give_zero() {
        let r = flat(5.0).map(|ch, v| match ch {
            Channel::F7 | Channel::Clear => 0.0,
            _ => v,
        });
        let idx = compute_indices(&r, &BandMap::default()).unwrap();
        assert_eq!(idx.nir_over_red, 0.0);
        assert_eq!(idx.green_drop, 0.0);
        assert_eq!(idx.r_over_g, 0.0);
    }

    #[test]
    fn test_band_map_resolution_priority() {
        assert_eq!(
            BandMap::resolve(&["ts", "480", "555", "630"]).unwrap(),
            BandMap::default()
        );
        assert_eq!(
            BandMap::resolve(&["F3", "F5", "F7", "CLEAR"]).unwrap(),
            BandMap::default()
        );
        assert!(matches!(
            BandMap::resolve(&["F1", "F2"]),
            Err(Error::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_band_map_uses_wavelength_columns_found() {
        let header = ["ts", "515nm", "555nm", "630nm", "F3", "F5", "F7"];
        assert_eq!(
            BandMap::resolve(&header).unwrap(),
            BandMap {
                green: Channel::F4,
                yellow: Channel::F5,
                red: Channel::F7,
            }
        );

        // 415 is too far from green; fall back to the sensor proxies
        let header = ["415", "555", "630", "F3", "F5", "F7"];
        assert_eq!(BandMap::resolve(&header).unwrap(), BandMap::default());
    }

    #[test]
    fn test_band_map_rejects_clear_as_proxy() {
        let bands = BandMap {
            green: Channel::Clear,
            ..BandMap::default()
        };
        assert!(matches!(
            compute_indices(&flat(1.0), &bands),
            Err(Error::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_feature_row_hides_non_finite_values() {
        let mut row = FeatureRow::new();
        row.insert("r_over_g", f64::NAN);
        row.insert("y_over_g", 1.5);
        assert_eq!(row.get("r_over_g"), None);
        assert_eq!(row.get("y_over_g"), Some(1.5));
    }
}
