//! Index-row and channel-sequence CSV files
//!
//! Index-row files are append-only with the columns
//! `timestamp, y_over_g, r_over_g, nir_over_red, green_drop, label`.
//! Channel-sequence files hold one reading per line (`sample, F1..F8,
//! CLEAR, NIR`) and are written in one piece through [`write_atomic`].

use crate::atomic_write::write_atomic;
use crate::channels::{Channel, ChannelReading, FeatureRow, IndexRow, INDEX_KEYS};
use crate::evaluation::LabeledRow;
use crate::{Error, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// One line of an index-row file
///
/// Index columns that are empty or not numeric read back as `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub y_over_g: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub r_over_g: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub nir_over_red: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub green_drop: Option<f64>,
    #[serde(default)]
    pub label: String,
}

impl IndexRecord {
    /// Record stamped with the current local time
    pub fn now(row: &IndexRow, label: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            y_over_g: Some(row.y_over_g),
            r_over_g: Some(row.r_over_g),
            nir_over_red: Some(row.nir_over_red),
            green_drop: Some(row.green_drop),
            label: label.into(),
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        match key {
            "y_over_g" => self.y_over_g,
            "r_over_g" => self.r_over_g,
            "nir_over_red" => self.nir_over_red,
            "green_drop" => self.green_drop,
            _ => None,
        }
    }

    /// Present index values as a feature row
    pub fn features(&self) -> FeatureRow {
        INDEX_KEYS
            .iter()
            .filter_map(|k| self.get(k).map(|v| (*k, v)))
            .collect()
    }
}

/// Append one record, writing the header first if the file is new or empty
pub fn append_index_row(path: &Path, record: &IndexRecord) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let needs_header = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(file);
    writer.serialize(record)?;
    writer.flush()?;

    debug!(path = %path.display(), label = %record.label, "Index row appended");
    Ok(())
}

/// Read every record of an index-row file
pub fn read_index_rows(path: &Path) -> Result<Vec<IndexRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    reader
        .deserialize()
        .map(|record| record.map_err(Error::from))
        .collect()
}

/// Write a channel sequence as CSV
pub fn write_readings_csv(path: &Path, readings: &[ChannelReading]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = vec!["sample".to_string()];
    header.extend(Channel::ALL.iter().map(|c| c.as_str().to_string()));
    writer.write_record(&header)?;

    for (i, reading) in readings.iter().enumerate() {
        let mut record = vec![i.to_string()];
        record.extend(reading.iter().map(|(_, v)| v.to_string()));
        writer.write_record(&record)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?;
    write_atomic(path, &bytes)
}

/// Read a channel sequence CSV
///
/// Columns may be sensor names or wavelengths; CLEAR and NIR are derived
/// when absent.
pub fn read_readings_csv(path: &Path) -> Result<Vec<ChannelReading>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();

    let mut readings = Vec::new();
    for record in reader.records() {
        let record = record?;
        let columns: Vec<(&str, f64)> = headers
            .iter()
            .zip(record.iter())
            .filter_map(|(name, field)| field.trim().parse::<f64>().ok().map(|v| (name, v)))
            .collect();
        readings.push(ChannelReading::from_columns(columns)?);
    }
    Ok(readings)
}

/// `*.csv` files under `root` (or `root` itself), in sorted path order
pub fn collect_csv_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Err(Error::NotFound(format!("{}", root.display())));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let path = entry.path();
        if entry.file_type().is_file()
            && path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("csv"))
                .unwrap_or(false)
        {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Load every index row from the CSV files under `root`
///
/// Unreadable files are skipped with a warning.
pub fn load_population(root: &Path) -> Result<Vec<LabeledRow>> {
    let mut rows = Vec::new();
    for file in collect_csv_files(root)? {
        match read_index_rows(&file) {
            Ok(records) => rows.extend(records.iter().map(|r| LabeledRow {
                features: r.features(),
                source: file.clone(),
            })),
            Err(e) => warn!(path = %file.display(), error = %e, "Skipping unreadable index file"),
        }
    }
    debug!(root = %root.display(), rows = rows.len(), "Population loaded");
    Ok(rows)
}

/// First record of each file, as used by repeatability checks
///
/// Files without a data row are skipped with a warning; no usable file at
/// all is `InsufficientData`.
pub fn first_rows(files: &[PathBuf]) -> Result<Vec<(PathBuf, IndexRecord)>> {
    let mut rows = Vec::new();
    for file in files {
        match read_index_rows(file) {
            Ok(records) => match records.into_iter().next() {
                Some(first) => rows.push((file.clone(), first)),
                None => warn!(path = %file.display(), "Skipping index file without data row"),
            },
            Err(e) => warn!(path = %file.display(), error = %e, "Skipping unreadable index file"),
        }
    }
    if rows.is_empty() {
        return Err(Error::InsufficientData("no valid index rows found".to_string()));
    }
    Ok(rows)
}
