//! Dual-stream CSV persistence.
//!
//! Every extracted cycle becomes one row in two files: the raw voltages and
//! the calibrated values. Both files share the header `Time,<id>,<id>,...`
//! and are flushed after every row so a crash loses at most the cycle being
//! written. Downstream tools read the columns positionally, so the writer
//! refuses rows whose width differs from the header.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::consumer::SampleSet;
use crate::error::{AppResult, LoggerError};

/// Timestamp format used in output file names.
pub const FILE_TIMESTAMP_FORMAT: &str = "%m-%d-%Y_%H-%M-%S";

/// Destination for extracted cycles.
pub trait SampleSink {
    /// Write the column header. Must be called exactly once, before any row.
    fn write_header(&mut self, channel_ids: &[u32]) -> AppResult<()>;

    /// Whether the header has been written.
    fn has_header(&self) -> bool;

    /// Append one cycle and make it durable.
    fn write_row(&mut self, set: &SampleSet) -> AppResult<()>;

    /// Flush and release the underlying streams. Idempotent.
    fn close(&mut self) -> AppResult<()>;
}

/// Header record for a channel list.
pub fn header_record(channel_ids: &[u32]) -> Vec<String> {
    std::iter::once("Time".to_string())
        .chain(channel_ids.iter().map(u32::to_string))
        .collect()
}

/// Output locations of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFiles {
    /// `<timestamp>_<prefix>`, shared by every file of the run
    pub base: String,
    pub raw: PathBuf,
    pub mapped: PathBuf,
}

impl RunFiles {
    /// Name the files of a run started at `started`.
    pub fn new(output_dir: &Path, prefix: &str, started: DateTime<Local>) -> Self {
        let base = format!("{}_{prefix}", started.format(FILE_TIMESTAMP_FORMAT));
        Self {
            raw: output_dir.join(format!("{base}_RAW.csv")),
            mapped: output_dir.join(format!("{base}_MAPPED.csv")),
            base,
        }
    }

    /// Path for a sibling file of the run, e.g. the archived configuration.
    pub fn sibling(&self, extension: &str) -> PathBuf {
        self.raw.with_file_name(format!("{}.{extension}", self.base))
    }
}

struct Stream {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl Stream {
    fn create(path: &Path) -> AppResult<Self> {
        let file = File::create(path).map_err(|e| {
            LoggerError::Storage(format!("Failed to create {}: {e}", path.display()))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: csv::Writer::from_writer(file),
        })
    }

    fn write(&mut self, record: &[String]) -> AppResult<()> {
        self.writer.write_record(record)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Raw and mapped CSV files written in lockstep.
pub struct DualCsvSink {
    raw: Option<Stream>,
    mapped: Option<Stream>,
    precision: usize,
    columns: Option<usize>,
    rows: u64,
    out_of_step: bool,
}

impl DualCsvSink {
    /// Create both files, truncating any existing content.
    ///
    /// The parent directory is created if missing.
    pub fn create(raw_path: &Path, mapped_path: &Path, precision: usize) -> AppResult<Self> {
        for path in [raw_path, mapped_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }
        let raw = Stream::create(raw_path)?;
        let mapped = Stream::create(mapped_path)?;
        info!(
            raw = %raw_path.display(),
            mapped = %mapped_path.display(),
            "Output streams opened"
        );
        Ok(Self {
            raw: Some(raw),
            mapped: Some(mapped),
            precision,
            columns: None,
            rows: 0,
            out_of_step: false,
        })
    }

    /// Open the pair of files named by `files` and write their header.
    ///
    /// A sink returned from here never leaves a headerless file behind.
    pub fn for_run(files: &RunFiles, precision: usize, channel_ids: &[u32]) -> AppResult<Self> {
        let mut sink = Self::create(&files.raw, &files.mapped, precision)?;
        sink.write_header(channel_ids)?;
        Ok(sink)
    }

    /// Rows written to each stream so far.
    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    fn format_row(&self, elapsed: f64, values: impl Iterator<Item = f64>) -> Vec<String> {
        std::iter::once(elapsed)
            .chain(values)
            .map(|v| format!("{:.*}", self.precision, v))
            .collect()
    }

    fn streams(&mut self) -> AppResult<(&mut Stream, &mut Stream)> {
        match (self.raw.as_mut(), self.mapped.as_mut()) {
            (Some(raw), Some(mapped)) => Ok((raw, mapped)),
            _ => Err(LoggerError::Storage("output streams are closed".to_string())),
        }
    }
}

impl SampleSink for DualCsvSink {
    fn write_header(&mut self, channel_ids: &[u32]) -> AppResult<()> {
        if self.columns.is_some() {
            return Err(LoggerError::Storage("header already written".to_string()));
        }
        let header = header_record(channel_ids);
        let (raw, mapped) = self.streams()?;
        raw.write(&header)?;
        mapped.write(&header)?;
        self.columns = Some(header.len());
        debug!(columns = header.len(), "Header written");
        Ok(())
    }

    fn has_header(&self) -> bool {
        self.columns.is_some()
    }

    fn write_row(&mut self, set: &SampleSet) -> AppResult<()> {
        let Some(columns) = self.columns else {
            return Err(LoggerError::Storage("row written before header".to_string()));
        };
        if self.out_of_step {
            return Err(LoggerError::Storage(format!(
                "streams out of step after row {}; refusing further rows",
                self.rows
            )));
        }
        let raw_row = self.format_row(set.elapsed_secs, set.raw_values());
        let mapped_row = self.format_row(set.elapsed_secs, set.mapped_values());
        if raw_row.len() != columns {
            return Err(LoggerError::Storage(format!(
                "row has {} columns, header has {columns}",
                raw_row.len()
            )));
        }

        let (raw, mapped) = self.streams()?;
        let written = raw.write(&raw_row).and_then(|()| mapped.write(&mapped_row));
        if let Err(e) = written {
            // The raw stream may already hold this row.
            self.out_of_step = true;
            return Err(LoggerError::Storage(format!(
                "row {} not written to both streams: {e}",
                self.rows + 1
            )));
        }
        self.rows += 1;
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        if self.raw.is_none() && self.mapped.is_none() {
            return Ok(());
        }
        let mut result: AppResult<()> = Ok(());
        for mut stream in [self.raw.take(), self.mapped.take()].into_iter().flatten() {
            if let Err(e) = stream.writer.flush() {
                warn!(path = %stream.path.display(), error = %e, "Failed to flush stream");
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        if self.columns.is_some() {
            info!(rows = self.rows, "Output streams closed");
        }
        result
    }
}

impl Drop for DualCsvSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
