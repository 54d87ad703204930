//! # mlprep
//!
//! A config-driven engine for preparing tabular data for machine learning.
//! A pipeline file declares inputs, an ordered list of steps and outputs;
//! the engine checks the whole plan against the input schema, then pushes
//! the data through it either as one frame or in memory-bounded chunks.
//!
//! ## Steps
//!
//! - **select**: keep and reorder columns
//! - **validate**: per-column checks (`not_null`, `unique`, `range`, `regex`,
//!   `enum`) in `strict`, `quarantine` or `warn` mode
//! - **features**: fitted transforms (`standard_scale`, `min_max_scale`,
//!   `one_hot`, `count_encode`) whose parameters can be saved and reloaded
//! - **group_by**: grouped aggregation
//!
//! ## Quick Start
//!
//! ```no_run
//! use mlprep::pipeline::{self, RunOptions};
//!
//! let report = pipeline::run("pipeline.yaml", &RunOptions::default())?;
//! println!("{}", report.summary());
//! # Ok::<(), mlprep::error::PrepError>(())
//! ```
//!
//! ## Modules
//!
//! - [`pipeline`]: pipeline files, planning and execution
//! - [`steps`]: the step kernels
//! - [`frame`]: polars frames and the logical schema steps check against
//! - [`io`]: CSV/Parquet sources and sinks
//! - [`state`]: persisted feature parameters
//! - [`integrity`]: lineage records and file digests
//! - [`error`]: error types
//! - [`logging`]: subscriber setup for the binary

#![warn(clippy::all, rust_2018_idioms)]

pub mod error;
pub mod frame;
pub mod integrity;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod state;
pub mod steps;
