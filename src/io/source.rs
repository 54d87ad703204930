//! Chunked frame sources.

use super::{FileRef, Format};
use crate::error::{PrepError, Result, ResultExt as _};
use crate::frame::{self, Schema};
use polars::prelude::{
    DataFrame, IdxSize, LazyCsvReader, LazyFileListReader as _, LazyFrame, col,
};

/// A finite stream of frame chunks. Restartable only by opening a new one.
///
/// The first call to `next_chunk` always yields a frame, possibly with zero
/// rows, so consumers always learn the stream's schema. Every chunk is
/// conformed to the source's schema.
pub trait ChunkSource {
    fn schema(&self) -> &Schema;

    /// Next chunk, or `None` once the stream is exhausted.
    ///
    /// # Errors
    ///
    /// Returns `Io` when the underlying data cannot be read.
    fn next_chunk(&mut self) -> Result<Option<DataFrame>>;
}

/// Opens fresh [`ChunkSource`]s over the same data.
pub trait SourceFactory {
    /// Schema every opened source yields.
    fn schema(&self) -> &Schema;

    /// Open a new source. `chunk_rows: None` reads everything as one chunk.
    ///
    /// # Errors
    ///
    /// Returns `Io` when the data cannot be opened.
    fn open(&self, chunk_rows: Option<usize>) -> Result<Box<dyn ChunkSource>>;
}

fn scan(input: &FileRef) -> Result<LazyFrame> {
    match input.format {
        Format::Csv => LazyCsvReader::new(&input.path)
            .with_infer_schema_length(Some(10000))
            .with_has_header(true)
            .finish()
            .at_path(&input.path),
        Format::Parquet => {
            LazyFrame::scan_parquet(&input.path, Default::default()).at_path(&input.path)
        }
    }
}

/// Read the schema of an input file without loading its rows.
///
/// # Errors
///
/// Returns `Io` if the file cannot be opened or its schema cannot be inferred.
pub fn read_schema(input: &FileRef) -> Result<Schema> {
    if !input.path.exists() {
        return Err(PrepError::io(&input.path, "input file does not exist"));
    }
    let mut lf = scan(input)?;
    let schema = lf.collect_schema().at_path(&input.path)?;
    Ok(Schema::of_polars(&schema))
}

/// Input files read in declared order as one stream.
#[derive(Debug, Clone)]
pub struct FileInputs {
    inputs: Vec<FileRef>,
    schema: Schema,
}

impl FileInputs {
    /// Inputs that must all provide `schema`'s columns.
    pub fn new(inputs: Vec<FileRef>, schema: Schema) -> Self {
        Self { inputs, schema }
    }

    pub fn inputs(&self) -> &[FileRef] {
        &self.inputs
    }
}

impl SourceFactory for FileInputs {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn open(&self, chunk_rows: Option<usize>) -> Result<Box<dyn ChunkSource>> {
        Ok(Box::new(FileChunks {
            pending: self.inputs.iter().rev().cloned().collect(),
            current: None,
            schema: self.schema.clone(),
            chunk_rows: chunk_rows.map(|n| IdxSize::try_from(n.max(1)).unwrap_or(IdxSize::MAX)),
            emitted: false,
        }))
    }
}

struct OpenFile {
    input: FileRef,
    frame: LazyFrame,
    offset: i64,
    done: bool,
}

struct FileChunks {
    /// Files not yet opened, last input first.
    pending: Vec<FileRef>,
    current: Option<OpenFile>,
    schema: Schema,
    chunk_rows: Option<IdxSize>,
    emitted: bool,
}

impl FileChunks {
    fn open_next(&mut self) -> Result<bool> {
        let Some(input) = self.pending.pop() else {
            return Ok(false);
        };
        if !input.path.exists() {
            return Err(PrepError::io(&input.path, "input file does not exist"));
        }
        let mut lf = scan(&input)?;
        let available = lf.collect_schema().at_path(&input.path)?;
        if let Some(missing) = self.schema.names().find(|name| !available.contains(name)) {
            return Err(PrepError::schema(
                format!("input {}", input.path.display()),
                format!("column '{missing}' not present"),
            ));
        }
        let projection: Vec<_> = self.schema.names().map(col).collect();
        let frame = lf.select(projection);
        tracing::debug!("Reading input {input}");
        self.current = Some(OpenFile {
            input,
            frame,
            offset: 0,
            done: false,
        });
        Ok(true)
    }
}

impl ChunkSource for FileChunks {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn next_chunk(&mut self) -> Result<Option<DataFrame>> {
        loop {
            let file = match self.current.as_mut() {
                Some(file) if !file.done => file,
                _ => {
                    if self.open_next()? {
                        continue;
                    }
                    if self.emitted {
                        return Ok(None);
                    }
                    self.emitted = true;
                    return Ok(Some(frame::empty(&self.schema)));
                }
            };

            let df = match self.chunk_rows {
                None => {
                    file.done = true;
                    file.frame.clone().collect()
                }
                Some(rows) => {
                    let df = file.frame.clone().slice(file.offset, rows).collect();
                    if let Ok(df) = &df {
                        file.offset += i64::try_from(df.height()).unwrap_or(i64::MAX);
                        file.done = df.height() < rows as usize;
                    }
                    df
                }
            }
            .at_path(&file.input.path)?;

            if df.height() == 0 && self.emitted {
                continue;
            }
            let origin = format!("input {}", file.input.path.display());
            let chunk = frame::conform(&df, &self.schema, &origin)?;
            self.emitted = true;
            return Ok(Some(chunk));
        }
    }
}

/// In-memory data exposed as a source, sliced into chunks on demand.
#[derive(Debug, Clone)]
pub struct MemoryInput {
    df: DataFrame,
    schema: Schema,
}

impl MemoryInput {
    pub fn new(df: DataFrame) -> Self {
        let schema = frame::schema_of(&df);
        Self { df, schema }
    }
}

impl SourceFactory for MemoryInput {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn open(&self, chunk_rows: Option<usize>) -> Result<Box<dyn ChunkSource>> {
        Ok(Box::new(MemoryChunks {
            df: self.df.clone(),
            schema: self.schema.clone(),
            chunk_rows: chunk_rows.unwrap_or(usize::MAX).max(1),
            offset: 0,
            emitted: false,
        }))
    }
}

struct MemoryChunks {
    df: DataFrame,
    schema: Schema,
    chunk_rows: usize,
    offset: usize,
    emitted: bool,
}

impl ChunkSource for MemoryChunks {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn next_chunk(&mut self) -> Result<Option<DataFrame>> {
        if self.offset >= self.df.height() && self.emitted {
            return Ok(None);
        }
        let offset = i64::try_from(self.offset).unwrap_or(i64::MAX);
        let chunk = self.df.slice(offset, self.chunk_rows);
        self.offset += chunk.height();
        self.emitted = true;
        Ok(Some(frame::conform(&chunk, &self.schema, "memory input")?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use polars::prelude::{Column, NamedFrom as _};

    fn drain(source: &mut dyn ChunkSource) -> Vec<usize> {
        let mut sizes = Vec::new();
        while let Some(chunk) = source.next_chunk().unwrap() {
            sizes.push(chunk.height());
        }
        sizes
    }

    fn counting(n: i64) -> DataFrame {
        let values: Vec<i64> = (0..n).collect();
        DataFrame::new(vec![Column::new("n".into(), values)]).unwrap()
    }

    #[test]
    fn test_memory_input_chunks() {
        let input = MemoryInput::new(counting(10));
        assert_eq!(drain(input.open(Some(4)).unwrap().as_mut()), [4, 4, 2]);
        assert_eq!(drain(input.open(None).unwrap().as_mut()), [10]);
    }

    #[test]
    fn test_empty_input_still_yields_one_chunk() {
        let input = MemoryInput::new(counting(0));
        assert_eq!(drain(input.open(Some(4)).unwrap().as_mut()), [0]);
    }

    #[test]
    fn test_csv_files_chain_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        std::fs::write(&a, "id,name\n1,x\n2,y\n3,z\n").unwrap();
        std::fs::write(&b, "name,id\nw,4\n").unwrap();

        let first = FileRef::new(&a, Format::Csv);
        let schema = read_schema(&first).unwrap();
        assert_eq!(schema.names().collect::<Vec<_>>(), ["id", "name"]);

        let inputs = FileInputs::new(vec![first, FileRef::new(&b, Format::Csv)], schema);
        let mut source = inputs.open(Some(2)).unwrap();
        let mut ids = Vec::new();
        while let Some(chunk) = source.next_chunk().unwrap() {
            assert!(chunk.height() <= 2);
            ids.extend(chunk.column("id").unwrap().i64().unwrap().into_iter().flatten());
        }
        assert_eq!(ids, [1, 2, 3, 4]);
    }

    #[test]
    fn test_later_input_missing_a_column_is_schema_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        std::fs::write(&a, "id,name\n1,x\n").unwrap();
        std::fs::write(&b, "id\n2\n").unwrap();

        let first = FileRef::new(&a, Format::Csv);
        let schema = read_schema(&first).unwrap();
        let inputs = FileInputs::new(vec![first, FileRef::new(&b, Format::Csv)], schema);
        let mut source = inputs.open(None).unwrap();
        assert!(source.next_chunk().unwrap().is_some());
        let err = source.next_chunk().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert!(err.to_string().contains("b.csv"));
    }

    #[test]
    fn test_declared_type_mismatch_names_column_and_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("scores.csv");
        std::fs::write(&path, "id,score\n1,3.7\n2,abc\n").unwrap();

        let schema = Schema::new(vec![
            frame::Field::new("id", frame::DataType::Int64),
            frame::Field::new("score", frame::DataType::Int64),
        ]);
        let inputs = FileInputs::new(vec![FileRef::new(&path, Format::Csv)], schema);
        let err = inputs.open(None).unwrap().next_chunk().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataProcessing);
        let message = err.to_string();
        assert!(message.contains("scores.csv"), "{message}");
        assert!(message.contains("'score'"), "{message}");
    }

    #[test]
    fn test_missing_input_is_io_error() {
        let input = FileRef::new("/nonexistent/input.csv", Format::Csv);
        let err = read_schema(&input).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
