//! Centralized error handling for mlprep.
//!
//! Every fallible engine operation returns [`Result`], whose error type
//! [`PrepError`] separates the four failure families of a pipeline run:
//!
//! - **Config**: the pipeline description itself is wrong (bad YAML, unknown
//!   step type, missing field, unparsable runtime value). Raised before any
//!   data is touched.
//! - **Schema**: a step references a column that does not exist at that point
//!   of the plan, or a column has the wrong type for the operation.
//! - **Validation**: a strict-mode check failed on a concrete row.
//! - **Io**: a file could not be read or written, including corrupt state files.
//!
//! Quarantined rows are *not* errors; they are reported through the
//! [`RunReport`](crate::pipeline::RunReport).
//!
//! ```
//! use mlprep::error::{ErrorKind, PrepError};
//!
//! let err = PrepError::schema("step 2 (select)", "column 'age' not found");
//! assert_eq!(err.kind(), ErrorKind::Schema);
//! assert_eq!(err.to_string(), "Schema error in step 2 (select): column 'age' not found");
//! ```
//!
//! Foreign errors carry the path they happened on through [`ResultExt`]:
//!
//! ```no_run
//! use mlprep::error::{Result, ResultExt as _};
//! use std::path::Path;
//!
//! fn load(path: &Path) -> Result<String> {
//!     std::fs::read_to_string(path).at_path(path)
//! }
//! ```

use std::path::{Path, PathBuf};

/// Boxed source error carried by [`PrepError::Io`].
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for mlprep operations.
#[derive(Debug, thiserror::Error)]
pub enum PrepError {
    /// Malformed pipeline description or runtime setting.
    #[error("Configuration error at '{field}': {message}")]
    Config { field: String, message: String },

    /// Column missing or mistyped at a given step of the plan.
    #[error("Schema error in {step}: {message}")]
    Schema { step: String, message: String },

    /// Strict-mode check violation. `row` is 1-based in consumption order.
    #[error("Validation failed: check '{check}' at row {row}: {message}")]
    Validation {
        check: String,
        row: u64,
        message: String,
    },

    /// Unreadable input, unwritable output, or unreadable state file.
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: BoxedSource,
    },

    /// Failure while computing over data that is not tied to a file.
    #[error("Data processing error: {0}")]
    DataProcessing(String),
}

/// Coarse error category, used for process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Schema,
    Validation,
    Io,
    DataProcessing,
}

impl ErrorKind {
    /// Process exit code reported by the command line for this category.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Config => 2,
            Self::Schema => 3,
            Self::Validation => 4,
            Self::Io => 5,
            Self::DataProcessing => 1,
        }
    }
}

impl PrepError {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn schema(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn validation(check: impl Into<String>, row: u64, message: impl Into<String>) -> Self {
        Self::Validation {
            check: check.into(),
            row,
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: impl Into<BoxedSource>) -> Self {
        Self::Io {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Config,
            Self::Schema { .. } => ErrorKind::Schema,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Io { .. } => ErrorKind::Io,
            Self::DataProcessing(_) => ErrorKind::DataProcessing,
        }
    }
}

impl From<polars::error::PolarsError> for PrepError {
    fn from(err: polars::error::PolarsError) -> Self {
        Self::DataProcessing(err.to_string())
    }
}

/// Result type alias for mlprep operations.
pub type Result<T> = std::result::Result<T, PrepError>;

/// Extension trait to attach context to foreign errors.
pub trait ResultExt<T> {
    /// Turn the error into [`PrepError::Io`] on `path`.
    fn at_path(self, path: &Path) -> Result<T>;

    /// Turn the error into [`PrepError::DataProcessing`] prefixed with `msg`.
    fn context(self, msg: impl Into<String>) -> Result<T>;

    /// Lazy variant of [`ResultExt::context`].
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn at_path(self, path: &Path) -> Result<T> {
        self.map_err(|e| PrepError::io(path, e))
    }

    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| PrepError::DataProcessing(format!("{}: {e}", msg.into())))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| PrepError::DataProcessing(format!("{}: {e}", f())))
    }
}
