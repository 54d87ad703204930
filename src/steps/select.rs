//! Column projection.

use super::{Emit, PassMode, StepKernel};
use crate::error::{PrepError, Result};
use polars::prelude::DataFrame;

/// Keeps exactly the listed columns, in list order.
#[derive(Debug, Clone)]
pub struct SelectKernel {
    label: String,
    columns: Vec<String>,
}

impl SelectKernel {
    pub fn new(label: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            label: label.into(),
            columns,
        }
    }
}

impl StepKernel for SelectKernel {
    type State = ();

    fn init(&self, _mode: PassMode) -> Self::State {}

    fn push(&self, _state: &mut Self::State, chunk: DataFrame) -> Result<Emit> {
        // Names produced by a not-yet-fitted one-hot encoder are only checked here.
        if let Some(missing) = self.columns.iter().find(|c| chunk.get_column_index(c).is_none()) {
            return Err(PrepError::schema(
                &self.label,
                format!("column '{missing}' not present in input"),
            ));
        }
        Ok(Emit::output(chunk.select(self.columns.iter().map(String::as_str))?))
    }

    fn finish(&self, _state: &mut Self::State) -> Result<Emit> {
        Ok(Emit::default())
    }
}
