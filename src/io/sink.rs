//! Frame sinks.
//!
//! File sinks stage rows into a hidden temporary file beside the target and
//! only rename it onto the target in [`TableSink::finish`]. Dropping a sink
//! without finishing it discards everything written so far, so a failed run
//! never leaves a partial output behind.

use super::{FileRef, Format, staging_file};
use crate::error::{PrepError, Result, ResultExt as _};
use polars::io::csv::write::BatchedWriter as CsvBatchedWriter;
use polars::io::parquet::write::BatchedWriter as ParquetBatchedWriter;
use polars::prelude::{CsvWriter, DataFrame, ParquetWriter, SerWriter as _};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;

/// Destination for output chunks.
pub trait TableSink {
    /// Append `df`. Every frame written to one sink has the same schema.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the rows cannot be written.
    fn write(&mut self, df: &DataFrame) -> Result<()>;

    /// Make everything written visible at the target.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the output cannot be finalized.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Creates sinks for output targets.
pub trait SinkFactory {
    /// # Errors
    ///
    /// Returns `Io` if the target cannot be prepared.
    fn create(&self, target: &FileRef) -> Result<Box<dyn TableSink>>;
}

/// Sinks that write real files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSinks;

impl SinkFactory for FileSinks {
    fn create(&self, target: &FileRef) -> Result<Box<dyn TableSink>> {
        Ok(Box::new(FileSink::new(target.clone())?))
    }
}

/// Batched polars writer, created from the first frame's schema.
enum Encoder {
    Csv(Option<CsvBatchedWriter<File>>),
    Parquet(Option<ParquetBatchedWriter<File>>),
}

/// File sink staging into a temporary sibling of the target.
pub struct FileSink {
    target: FileRef,
    staged: NamedTempFile,
    encoder: Encoder,
}

impl FileSink {
    /// # Errors
    ///
    /// Returns `Io` if the target directory or staging file cannot be created.
    pub fn new(target: FileRef) -> Result<Self> {
        let staged = staging_file(&target.path)?;
        let encoder = match target.format {
            Format::Csv => Encoder::Csv(None),
            Format::Parquet => Encoder::Parquet(None),
        };
        Ok(Self {
            target,
            staged,
            encoder,
        })
    }
}

impl TableSink for FileSink {
    fn write(&mut self, df: &DataFrame) -> Result<()> {
        let path = &self.target.path;
        let mut df = df.clone();
        df.align_chunks();
        let df = &df;
        match &mut self.encoder {
            Encoder::Csv(writer) => {
                if writer.is_none() {
                    let file = self.staged.as_file().try_clone().at_path(path)?;
                    *writer = Some(CsvWriter::new(file).batched(df.schema()).at_path(path)?);
                }
                if let Some(writer) = writer.as_mut() {
                    writer.write_batch(df).at_path(path)?;
                }
            }
            Encoder::Parquet(writer) => {
                if writer.is_none() {
                    let file = self.staged.as_file().try_clone().at_path(path)?;
                    *writer = Some(ParquetWriter::new(file).batched(df.schema()).at_path(path)?);
                }
                if let Some(writer) = writer.as_mut() {
                    writer.write_batch(df).at_path(path)?;
                }
            }
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let Self {
            target,
            staged,
            encoder,
        } = *self;
        match encoder {
            Encoder::Csv(Some(mut writer)) => writer.finish().at_path(&target.path)?,
            Encoder::Parquet(Some(writer)) => {
                writer.finish().at_path(&target.path)?;
            }
            Encoder::Csv(None) | Encoder::Parquet(None) => {}
        }
        staged.as_file().sync_all().at_path(&target.path)?;
        staged
            .persist(&target.path)
            .map_err(|e| PrepError::io(&target.path, e.error))?;
        tracing::debug!("Finalized output {target}");
        Ok(())
    }
}

/// Sinks that collect finished outputs in memory, keyed by target path.
#[derive(Debug, Clone, Default)]
pub struct MemorySinks {
    finished: Arc<Mutex<BTreeMap<PathBuf, DataFrame>>>,
}

impl MemorySinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finished output for `path`, if a sink for it was finished.
    pub fn get(&self, path: impl Into<PathBuf>) -> Option<DataFrame> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path.into())
            .cloned()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl SinkFactory for MemorySinks {
    fn create(&self, target: &FileRef) -> Result<Box<dyn TableSink>> {
        Ok(Box::new(MemorySink {
            path: target.path.clone(),
            buffer: None,
            finished: Arc::clone(&self.finished),
        }))
    }
}

struct MemorySink {
    path: PathBuf,
    buffer: Option<DataFrame>,
    finished: Arc<Mutex<BTreeMap<PathBuf, DataFrame>>>,
}

impl TableSink for MemorySink {
    fn write(&mut self, df: &DataFrame) -> Result<()> {
        match self.buffer.as_mut() {
            Some(buffer) => {
                buffer.vstack_mut(df)?;
            }
            None => self.buffer = Some(df.clone()),
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let df = self.buffer.unwrap_or_default();
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.path, df);
        Ok(())
    }
}
