//! Pointer file naming the newest calibrated stream.
//!
//! A live plotter polls this file to find which CSV to tail. It is rewritten
//! at the start of every run, before acquisition starts, with the absolute
//! path of the mapped stream and nothing else.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{AppResult, LoggerError};

/// Overwrite `pointer_path` with the absolute path of `mapped_path`.
///
/// Returns the absolute path that was written.
pub fn write_pointer_file(pointer_path: &Path, mapped_path: &Path) -> AppResult<PathBuf> {
    let absolute = std::path::absolute(mapped_path)?;
    let text = absolute.to_str().ok_or_else(|| {
        LoggerError::Storage(format!(
            "output path {} is not valid UTF-8",
            absolute.display()
        ))
    })?;

    if let Some(parent) = pointer_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(pointer_path, text)?;

    info!(
        pointer = %pointer_path.display(),
        target = %absolute.display(),
        "Pointer file updated"
    );
    Ok(absolute)
}

/// Read the stream path recorded in a pointer file.
pub fn read_pointer_file(pointer_path: &Path) -> AppResult<PathBuf> {
    let text = fs::read_to_string(pointer_path)?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(LoggerError::Storage(format!(
            "pointer file {} is empty",
            pointer_path.display()
        )));
    }
    Ok(PathBuf::from(trimmed))
}
