//! Persisted feature state.
//!
//! A features step either **fits** its transforms on the data it sees, or
//! **loads** parameters fitted by an earlier run. Which path a step takes is
//! decided once, up front, by [`StateResolution::resolve`]:
//!
//! ```text
//! state_path unset              -> Fit { persist_to: None }
//! state_path set, refit: true   -> Fit { persist_to: Some(path) }
//! state_path set, file missing  -> Fit { persist_to: Some(path) }
//! state_path set, file present  -> Load { state }     (never refits)
//! ```
//!
//! State files are JSON and are replaced atomically, so a crash while saving
//! never corrupts a previously valid file.

use crate::error::{PrepError, Result, ResultExt as _};
use crate::io::StagedFile;
use crate::pipeline::spec::Transform;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Version written into every state file.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Fitted parameters of one features step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureState {
    pub format_version: u32,
    #[serde(default)]
    pub fitted_at: Option<DateTime<Utc>>,
    /// Rows the fit observed.
    #[serde(default)]
    pub rows_fitted: u64,
    pub entries: Vec<FittedTransform>,
}

/// Parameters for one (column, transform) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transform", rename_all = "snake_case")]
pub enum FittedTransform {
    StandardScale {
        column: String,
        mean: f64,
        std: f64,
    },
    MinMaxScale {
        column: String,
        min: f64,
        max: f64,
    },
    OneHotEncode {
        column: String,
        /// Fit-time first-seen order; fixes indicator column order.
        categories: Vec<String>,
    },
    CountEncode {
        column: String,
        counts: BTreeMap<String, u64>,
        total: u64,
    },
}

impl FittedTransform {
    pub fn column(&self) -> &str {
        match self {
            Self::StandardScale { column, .. }
            | Self::MinMaxScale { column, .. }
            | Self::OneHotEncode { column, .. }
            | Self::CountEncode { column, .. } => column,
        }
    }

    pub fn transform(&self) -> Transform {
        match self {
            Self::StandardScale { .. } => Transform::StandardScale,
            Self::MinMaxScale { .. } => Transform::MinMaxScale,
            Self::OneHotEncode { .. } => Transform::OneHotEncode,
            Self::CountEncode { .. } => Transform::CountEncode,
        }
    }
}

impl FeatureState {
    pub fn new(entries: Vec<FittedTransform>, rows_fitted: u64) -> Self {
        Self {
            format_version: STATE_FORMAT_VERSION,
            fitted_at: Some(Utc::now()),
            rows_fitted,
            entries,
        }
    }

    pub fn entry(&self, column: &str, transform: Transform) -> Option<&FittedTransform> {
        self.entries
            .iter()
            .find(|e| e.column() == column && e.transform() == transform)
    }

    /// Read a state file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read, is not valid state JSON, or
    /// was written by a newer format version.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).at_path(path)?;
        let state: Self = serde_json::from_str(&content).at_path(path)?;
        if state.format_version > STATE_FORMAT_VERSION {
            return Err(PrepError::io(
                path,
                format!(
                    "state format version {} is newer than supported version {STATE_FORMAT_VERSION}",
                    state.format_version
                ),
            ));
        }
        Ok(state)
    }

    /// Write the state beside `path`; it replaces `path` once committed.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be written.
    pub fn stage(&self, path: &Path) -> Result<StagedFile> {
        StagedFile::write(path, |writer| {
            serde_json::to_writer_pretty(writer, self).at_path(path)
        })
    }

    /// Write the state atomically to `path`.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.stage(path)?.commit()?;
        tracing::info!("Saved feature state to {}", path.display());
        Ok(())
    }
}

/// How a features step obtains its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum StateResolution {
    /// Use parameters from an existing state file; never refit.
    Load { path: PathBuf, state: FeatureState },
    /// Fit on the data, then save to `persist_to` if set.
    Fit { persist_to: Option<PathBuf> },
}

impl StateResolution {
    /// Decide between loading and fitting.
    ///
    /// # Errors
    ///
    /// Returns `Io` if an existing state file cannot be read or parsed.
    pub fn resolve(state_path: Option<&Path>, refit: bool) -> Result<Self> {
        let Some(path) = state_path else {
            return Ok(Self::Fit { persist_to: None });
        };
        if refit || !path.try_exists().at_path(path)? {
            return Ok(Self::Fit {
                persist_to: Some(path.to_path_buf()),
            });
        }
        let state = FeatureState::load(path)?;
        tracing::info!("Loaded feature state from {}", path.display());
        Ok(Self::Load {
            path: path.to_path_buf(),
            state,
        })
    }

    pub fn is_fit(&self) -> bool {
        matches!(self, Self::Fit { .. })
    }
}
