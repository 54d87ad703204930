//! Tabular file I/O.
//!
//! The engine never touches CSV or Parquet directly. It pulls polars
//! `DataFrame` chunks from a [`ChunkSource`] and pushes results into a
//! [`TableSink`]:
//!
//! - [`source`]: chunked readers over polars lazy scans, plus an in-memory source.
//! - [`sink`]: batched writers that stage into a temporary file and only move
//!   it onto the target path when the run succeeds.

pub mod sink;
pub mod source;

pub use sink::{FileSinks, MemorySinks, SinkFactory, TableSink};
pub use source::{ChunkSource, FileInputs, MemoryInput, SourceFactory};

use crate::error::{PrepError, Result, ResultExt as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};

/// Supported file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Csv,
    #[serde(alias = "pq")]
    Parquet,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Parquet => "parquet",
        }
    }

    pub fn extension(self) -> &'static str {
        self.as_str()
    }

    /// Format implied by a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "parquet" | "pq" => Some(Self::Parquet),
            _ => None,
        }
    }

    /// Declared format, or the one implied by the extension.
    ///
    /// # Errors
    ///
    /// Returns `Config` on `field` when neither is available.
    pub fn resolve(declared: Option<Self>, path: &Path, field: &str) -> Result<Self> {
        declared.or_else(|| Self::from_path(path)).ok_or_else(|| {
            PrepError::config(
                field,
                format!(
                    "cannot infer format of '{}'; declare `format: csv` or `format: parquet`",
                    path.display()
                ),
            )
        })
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file with a resolved format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FileRef {
    pub path: PathBuf,
    pub format: Format,
}

impl FileRef {
    pub fn new(path: impl Into<PathBuf>, format: Format) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path.display(), self.format)
    }
}

/// Directory that holds `path`, `.` for bare file names.
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Create a temporary file next to `path`, creating the directory if needed.
///
/// # Errors
///
/// Returns `Io` if the directory or the temporary file cannot be created.
pub fn staging_file(path: &Path) -> Result<tempfile::NamedTempFile> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(dir).at_path(dir)?;
    tempfile::Builder::new()
        .prefix(".mlprep-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .at_path(dir)
}

/// A fully written temporary file waiting to replace its target.
/// Dropping it without [`commit`](Self::commit) deletes it.
#[derive(Debug)]
pub struct StagedFile {
    staged: tempfile::NamedTempFile,
    target: PathBuf,
}

impl StagedFile {
    /// Write and sync a temporary sibling of `path`.
    ///
    /// # Errors
    ///
    /// Returns `Io` on any filesystem failure, or whatever `write` returns.
    pub fn write<F>(path: &Path, write: F) -> Result<Self>
    where
        F: FnOnce(&mut BufWriter<&mut File>) -> Result<()>,
    {
        let mut staged = staging_file(path)?;
        {
            let mut writer = BufWriter::new(staged.as_file_mut());
            write(&mut writer)?;
            writer.flush().at_path(path)?;
        }
        staged.as_file().sync_all().at_path(path)?;
        Ok(Self {
            staged,
            target: path.to_path_buf(),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Move the staged file onto its target.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the rename fails.
    pub fn commit(self) -> Result<()> {
        let Self { staged, target } = self;
        staged
            .persist(&target)
            .map_err(|e| PrepError::io(&target, e.error))?;
        Ok(())
    }
}

/// Write `path` through a temporary sibling file that replaces it on success.
/// A failure part-way leaves any existing file at `path` untouched.
///
/// # Errors
///
/// Returns `Io` on any filesystem failure, or whatever `write` returns.
pub fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> Result<()>,
{
    StagedFile::write(path, write)?.commit()
}
