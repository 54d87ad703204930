//! Execution strategy and chunk sizing.

use super::spec::RuntimeConfig;
use crate::error::{PrepError, Result};
use crate::frame::{DataType, Schema};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Chunk size when neither `chunk_rows` nor `memory_limit` is set.
pub const DEFAULT_CHUNK_ROWS: usize = 65_536;
pub const MAX_CHUNK_ROWS: usize = 1_048_576;

/// Chunks are sized to a quarter of the budget, leaving room for step
/// outputs and conversion buffers.
const BUDGET_FRACTION: u64 = 4;
const MIN_ROW_BYTES: u64 = 64;

static MEMORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([0-9]+(?:\.[0-9]+)?)\s*([A-Za-z]*)\s*$").expect("valid memory limit regex")
});

/// How the input is pushed through the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// The whole input is one chunk.
    Materialized,
    /// The input is pulled in bounded chunks.
    Streaming,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Materialized => "materialized",
            Self::Streaming => "streaming",
        })
    }
}

/// Runtime settings supplied by the caller rather than the pipeline file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Forces streaming on; `false` defers to the pipeline file.
    pub streaming: bool,
    /// Replaces the pipeline's `memory_limit` when set.
    pub memory_limit: Option<String>,
}

/// Runtime settings after applying caller overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRuntime {
    pub strategy: Strategy,
    /// Rows per chunk; `None` reads the whole input at once.
    pub chunk_rows: Option<usize>,
    pub memory_limit: Option<u64>,
    pub lineage_path: Option<PathBuf>,
}

impl ResolvedRuntime {
    /// Merge `config` with `options` for an input of shape `schema`.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an unparsable memory limit, a streaming memory
    /// limit too small to hold a single row, or a zero `chunk_rows`.
    pub fn resolve(config: &RuntimeConfig, options: &RunOptions, schema: &Schema) -> Result<Self> {
        let streaming = options.streaming || config.streaming;
        let memory_limit = options
            .memory_limit
            .as_deref()
            .or(config.memory_limit.as_deref())
            .map(parse_memory_limit)
            .transpose()?;
        if config.chunk_rows == Some(0) {
            return Err(PrepError::config(
                "runtime.chunk_rows",
                "chunk_rows must be at least 1",
            ));
        }
        if let Some(limit) = memory_limit.filter(|_| streaming) {
            let row_bytes = estimate_row_bytes(schema);
            if limit < row_bytes {
                return Err(PrepError::config(
                    "runtime.memory_limit",
                    format!("memory limit of {limit} bytes cannot hold one row (~{row_bytes} bytes)"),
                ));
            }
        }
        let (strategy, chunk_rows) = if streaming {
            (
                Strategy::Streaming,
                Some(chunk_rows(config.chunk_rows, memory_limit, schema)),
            )
        } else {
            (Strategy::Materialized, None)
        };
        Ok(Self {
            strategy,
            chunk_rows,
            memory_limit,
            lineage_path: config.lineage_path.clone(),
        })
    }
}

/// Parse a human size such as `"500MB"`, `"1.5 GiB"` or `"1024"` into bytes.
///
/// Units are 1024-based and case-insensitive; a bare number is bytes.
///
/// # Errors
///
/// Returns `Config` on `runtime.memory_limit` if the text is not a positive size.
pub fn parse_memory_limit(text: &str) -> Result<u64> {
    let invalid = || {
        PrepError::config(
            "runtime.memory_limit",
            format!("invalid memory limit '{text}' (expected e.g. 512MB or 4GB)"),
        )
    };
    let caps = MEMORY_RE.captures(text).ok_or_else(invalid)?;
    let number: f64 = caps
        .get(1)
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(invalid)?;
    let unit = caps.get(2).map_or("", |m| m.as_str()).to_ascii_lowercase();
    let exponent = match unit.as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 1,
        "m" | "mb" | "mib" => 2,
        "g" | "gb" | "gib" => 3,
        "t" | "tb" | "tib" => 4,
        _ => return Err(invalid()),
    };
    let bytes = number * 1024_f64.powi(exponent);
    if bytes < 1.0 || !bytes.is_finite() {
        return Err(invalid());
    }
    Ok(bytes as u64)
}

/// Conservative in-memory size of one row of `schema`.
pub fn estimate_row_bytes(schema: &Schema) -> u64 {
    let bytes: u64 = schema
        .fields()
        .iter()
        .map(|f| match f.dtype {
            DataType::Int64 | DataType::Float64 => 16,
            DataType::Bool => 2,
            DataType::Utf8 => 64,
        })
        .sum();
    bytes.max(MIN_ROW_BYTES)
}

/// Rows per streaming chunk. Under a memory limit, estimated row bytes
/// times the returned row count stays within the limit whenever the limit
/// holds at least one row.
pub fn chunk_rows(explicit: Option<usize>, memory_limit: Option<u64>, schema: &Schema) -> usize {
    if let Some(rows) = explicit {
        return rows.max(1);
    }
    let Some(limit) = memory_limit else {
        return DEFAULT_CHUNK_ROWS;
    };
    let rows = limit / (estimate_row_bytes(schema) * BUDGET_FRACTION);
    usize::try_from(rows)
        .unwrap_or(MAX_CHUNK_ROWS)
        .clamp(1, MAX_CHUNK_ROWS)
}
