//! Lineage records: which files a run read and wrote, with their digests.

use super::hasher::{HASH_ALGORITHM, compute_file_hash};
use crate::error::{Result, ResultExt as _};
use crate::io::{Format, write_atomically};
use crate::pipeline::executor::{OutputRole, RunReport};
use crate::pipeline::planner::ExecutionPlan;
use crate::pipeline::runtime::Strategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Current lineage schema version.
pub const LINEAGE_VERSION: u32 = 1;

/// Provenance of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub lineage_version: u32,
    pub run_id: Uuid,
    pub started_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub pipeline: String,
    pub producer: ProducerInfo,
    pub strategy: Strategy,
    pub chunk_rows: Option<usize>,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_quarantined: u64,
    pub hash_algorithm: String,
    pub inputs: Vec<FileDigest>,
    pub outputs: Vec<OutputDigest>,
    pub state_files: Vec<FileDigest>,
}

/// The program that produced the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub app_name: String,
    pub app_version: String,
    pub platform: String,
}

impl ProducerInfo {
    pub fn current() -> Self {
        Self {
            app_name: env!("CARGO_PKG_NAME").to_owned(),
            app_version: env!("CARGO_PKG_VERSION").to_owned(),
            platform: std::env::consts::OS.to_owned(),
        }
    }
}

/// Size and digest of a file as it was when the record was made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    pub size_bytes: u64,
    pub sha256: String,
}

impl FileDigest {
    /// Measure `path` now.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read.
    pub fn of(path: &Path, format: Option<Format>) -> Result<Self> {
        let size_bytes = std::fs::metadata(path).at_path(path)?.len();
        Ok(Self {
            path: path.to_path_buf(),
            format,
            size_bytes,
            sha256: compute_file_hash(path)?,
        })
    }
}

/// A written file with its role and row count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDigest {
    #[serde(flatten)]
    pub file: FileDigest,
    pub role: OutputRole,
    pub rows: u64,
}

/// Build the lineage record of a finished run.
///
/// # Errors
///
/// Returns `Io` if any input, output or state file can no longer be read.
pub fn create_record(plan: &ExecutionPlan, report: &RunReport) -> Result<LineageRecord> {
    let inputs = plan
        .inputs
        .iter()
        .map(|input| FileDigest::of(&input.path, Some(input.format)))
        .collect::<Result<Vec<_>>>()?;
    let outputs = report
        .outputs
        .iter()
        .map(|written| {
            Ok(OutputDigest {
                file: FileDigest::of(&written.file.path, Some(written.file.format))?,
                role: written.role,
                rows: written.rows,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let state_files = report
        .state_files
        .iter()
        .map(|path| FileDigest::of(path, None))
        .collect::<Result<Vec<_>>>()?;

    Ok(LineageRecord {
        lineage_version: LINEAGE_VERSION,
        run_id: report.run_id,
        started_utc: report.started_at,
        created_utc: Utc::now(),
        pipeline: report.pipeline.clone(),
        producer: ProducerInfo::current(),
        strategy: report.strategy,
        chunk_rows: report.chunk_rows,
        rows_read: report.rows_read,
        rows_written: report.rows_written,
        rows_quarantined: report.quarantined(),
        hash_algorithm: HASH_ALGORITHM.to_owned(),
        inputs,
        outputs,
        state_files,
    })
}

/// Write `record` as pretty JSON, replacing `path` atomically.
///
/// # Errors
///
/// Returns `Io` if the file cannot be written.
pub fn save_record(record: &LineageRecord, path: &Path) -> Result<()> {
    write_atomically(path, |writer| {
        serde_json::to_writer_pretty(writer, record).at_path(path)
    })?;
    tracing::info!("Wrote lineage record to {}", path.display());
    Ok(())
}
