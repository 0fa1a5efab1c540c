//! Atomic file replacement
//!
//! All persistent writes (calibration documents, pipeline results, stage
//! artifacts) go through [`write_atomic`]: content lands in a sibling temp
//! file which is flushed, synced and renamed over the target. Readers never
//! see a half-written file.
//!
//! [`write_with_backup`] additionally copies any existing target to a
//! timestamped backup before the rename.

use crate::Result;
use chrono::Local;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Temp path used while writing `path` (`<name>.<uuid>.tmp` in the same directory)
///
/// Unique per call, so concurrent writers to one target never share a temp file.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    path.with_file_name(name)
}

/// Backup path for `path` at the current local time (`<name>.bak.<YYYYmmdd_HHMMSS>`)
pub fn backup_path_for(path: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".bak.{}", stamp));
    let candidate = path.with_file_name(&name);
    if !candidate.exists() {
        return candidate;
    }
    // Two saves within the same second: disambiguate with a counter
    (1u32..)
        .map(|n| {
            let mut numbered = name.clone();
            numbered.push(format!(".{}", n));
            path.with_file_name(numbered)
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Write `contents` to `path` via temp file + rename
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }

    let tmp = temp_path_for(path);
    let write_result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    debug!(path = %path.display(), bytes = contents.len(), "Atomic write complete");
    Ok(())
}

/// Atomic write preceded by a timestamped backup of any existing file
///
/// Returns the backup path when a prior file existed.
pub fn write_with_backup(path: &Path, contents: &[u8]) -> Result<Option<PathBuf>> {
    let backup = if path.exists() {
        let backup = backup_path_for(path);
        fs::copy(path, &backup)?;
        debug!(
            path = %path.display(),
            backup = %backup.display(),
            "Backed up existing file"
        );
        Some(backup)
    } else {
        None
    };

    write_atomic(path, contents)?;
    Ok(backup)
}
