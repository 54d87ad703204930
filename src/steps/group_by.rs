//! Hash aggregation.
//!
//! Groups are keyed by the tuple of key values (nulls included, so a null
//! key forms its own group) and emitted at end of input in first-seen order.
//! Memory grows with the number of distinct keys, not with the number of rows.

use super::{Emit, Moments, PassMode, StepKernel};
use crate::error::{PrepError, Result};
use crate::frame::{self, DataType, Field, KeyValue, Schema};
use crate::pipeline::spec::{AggFunc, AggSpec};
use polars::prelude::DataFrame;
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Accumulator {
    IntSum(i64),
    FloatSum(f64),
    Count(i64),
    Mean { sum: f64, count: u64 },
    Extreme { best: Option<KeyValue>, max: bool },
    First(Option<KeyValue>),
    Last(KeyValue),
    Spread { moments: Moments, std: bool },
}

impl Accumulator {
    fn new(func: AggFunc, input: DataType) -> Self {
        match func {
            AggFunc::Sum if input == DataType::Int64 => Self::IntSum(0),
            AggFunc::Sum => Self::FloatSum(0.0),
            AggFunc::Count => Self::Count(0),
            AggFunc::Mean => Self::Mean { sum: 0.0, count: 0 },
            AggFunc::Min => Self::Extreme {
                best: None,
                max: false,
            },
            AggFunc::Max => Self::Extreme {
                best: None,
                max: true,
            },
            AggFunc::First => Self::First(None),
            AggFunc::Last => Self::Last(KeyValue::Null),
            AggFunc::Std => Self::Spread {
                moments: Moments::default(),
                std: true,
            },
            AggFunc::Var => Self::Spread {
                moments: Moments::default(),
                std: false,
            },
        }
    }

    fn update(&mut self, value: &KeyValue) -> std::result::Result<(), String> {
        match self {
            Self::IntSum(total) => {
                if let KeyValue::Int64(v) = value {
                    *total = total
                        .checked_add(*v)
                        .ok_or_else(|| format!("integer overflow adding {v} to {total}"))?;
                }
            }
            Self::FloatSum(total) => *total += value.as_f64().unwrap_or(0.0),
            Self::Count(count) => {
                if !value.is_null() {
                    *count += 1;
                }
            }
            Self::Mean { sum, count } => {
                if let Some(v) = value.as_f64() {
                    *sum += v;
                    *count += 1;
                }
            }
            Self::Extreme { best, max } => {
                let skip = value.is_null() || value.as_f64().is_some_and(f64::is_nan);
                let replace = !skip && best.as_ref().is_none_or(|b| outranks(value, b, *max));
                if replace {
                    *best = Some(value.clone());
                }
            }
            Self::First(first) => {
                if first.is_none() {
                    *first = Some(value.clone());
                }
            }
            Self::Last(last) => last.clone_from(value),
            Self::Spread { moments, .. } => {
                if let Some(v) = value.as_f64() {
                    moments.push(v);
                }
            }
        }
        Ok(())
    }

    fn result(&self) -> KeyValue {
        match self {
            Self::IntSum(total) => KeyValue::Int64(*total),
            Self::FloatSum(total) => KeyValue::from_f64(*total),
            Self::Count(count) => KeyValue::Int64(*count),
            Self::Mean { sum, count } => {
                if *count == 0 {
                    KeyValue::Null
                } else {
                    KeyValue::from_f64(sum / *count as f64)
                }
            }
            Self::Extreme { best, .. } | Self::First(best) => best.clone().unwrap_or(KeyValue::Null),
            Self::Last(last) => last.clone(),
            Self::Spread { moments, std } => moments.variance().map_or(KeyValue::Null, |var| {
                KeyValue::from_f64(if *std { var.sqrt() } else { var })
            }),
        }
    }
}

/// Whether `candidate` beats `best` as a minimum (or maximum when `max`).
fn outranks(candidate: &KeyValue, best: &KeyValue, max: bool) -> bool {
    let ordering = match (candidate, best) {
        (KeyValue::Int64(v), KeyValue::Int64(b)) => v.cmp(b),
        (KeyValue::Utf8(v), KeyValue::Utf8(b)) => v.cmp(b),
        (KeyValue::Bool(v), KeyValue::Bool(b)) => v.cmp(b),
        (v, b) => match (v.as_f64(), b.as_f64()) {
            (Some(v), Some(b)) => v.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    };
    ordering == if max { Ordering::Greater } else { Ordering::Less }
}

/// Compiled group-by step.
#[derive(Debug, Clone)]
pub struct GroupByKernel {
    label: String,
    by: Vec<String>,
    aggs: Vec<AggSpec>,
}

impl GroupByKernel {
    pub fn new(label: impl Into<String>, by: Vec<String>, aggs: Vec<AggSpec>) -> Self {
        Self {
            label: label.into(),
            by,
            aggs,
        }
    }

    /// Output schema for an input with schema `input`.
    ///
    /// # Errors
    ///
    /// Returns `Schema` if a key or aggregated column is missing.
    pub fn output_schema(&self, input: &Schema) -> Result<Schema> {
        let dtype = |name: &str| {
            input.field(name).map(|f| f.dtype).ok_or_else(|| {
                PrepError::schema(&self.label, format!("column '{name}' not present in input"))
            })
        };
        let mut fields = Vec::with_capacity(self.by.len() + self.aggs.len());
        for key in &self.by {
            fields.push(Field::new(key.clone(), dtype(key)?));
        }
        for agg in &self.aggs {
            let output = agg.func.output_type(dtype(&agg.column)?);
            fields.push(Field::new(agg.output_name(), output));
        }
        Ok(Schema::new(fields))
    }

    /// Cells of the named columns of `chunk`, one vector per column.
    fn cells<'n>(
        &self,
        chunk: &DataFrame,
        names: impl Iterator<Item = &'n str>,
    ) -> Result<Vec<Vec<KeyValue>>> {
        names
            .map(|name| {
                let column = chunk.column(name).map_err(|_| {
                    PrepError::schema(&self.label, format!("column '{name}' not present in input"))
                })?;
                frame::keys(column)
            })
            .collect()
    }
}

/// Per-pass state of a group-by step.
#[derive(Debug, Default)]
pub struct GroupByState {
    input: Option<Schema>,
    index: HashMap<Vec<KeyValue>, usize>,
    keys: Vec<Vec<KeyValue>>,
    accumulators: Vec<Vec<Accumulator>>,
}

impl StepKernel for GroupByKernel {
    type State = GroupByState;

    fn init(&self, _mode: PassMode) -> Self::State {
        GroupByState::default()
    }

    fn push(&self, state: &mut Self::State, chunk: DataFrame) -> Result<Emit> {
        let keys = self.cells(&chunk, self.by.iter().map(String::as_str))?;
        let values = self.cells(&chunk, self.aggs.iter().map(|a| a.column.as_str()))?;
        let input = state.input.get_or_insert_with(|| frame::schema_of(&chunk));
        let input_types: Vec<DataType> = self
            .aggs
            .iter()
            .map(|agg| input.field(&agg.column).map_or(DataType::Float64, |f| f.dtype))
            .collect();

        for row in 0..chunk.height() {
            let key: Vec<KeyValue> = keys
                .iter()
                .filter_map(|cells| cells.get(row).cloned())
                .collect();
            let group = if let Some(&group) = state.index.get(&key) {
                group
            } else {
                let group = state.keys.len();
                state.index.insert(key.clone(), group);
                state.keys.push(key);
                state.accumulators.push(
                    self.aggs
                        .iter()
                        .zip(&input_types)
                        .map(|(agg, dtype)| Accumulator::new(agg.func, *dtype))
                        .collect(),
                );
                group
            };
            let Some(accumulators) = state.accumulators.get_mut(group) else {
                continue;
            };
            for ((accumulator, cells), agg) in accumulators.iter_mut().zip(&values).zip(&self.aggs) {
                let Some(value) = cells.get(row) else {
                    continue;
                };
                accumulator.update(value).map_err(|message| {
                    PrepError::DataProcessing(format!(
                        "{}: {}({}) failed: {message}",
                        self.label, agg.func, agg.column
                    ))
                })?;
            }
        }
        Ok(Emit::default())
    }

    fn finish(&self, state: &mut Self::State) -> Result<Emit> {
        let Some(input) = state.input.take() else {
            return Ok(Emit::default());
        };
        let schema = self.output_schema(&input)?;
        let keys = std::mem::take(&mut state.keys);
        let accumulators = std::mem::take(&mut state.accumulators);
        state.index.clear();

        let width = self.by.len();
        let columns = schema
            .fields()
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let cells: Vec<KeyValue> = if i < width {
                    keys.iter()
                        .map(|key| key.get(i).cloned().unwrap_or(KeyValue::Null))
                        .collect()
                } else {
                    accumulators
                        .iter()
                        .map(|group| group.get(i - width).map_or(KeyValue::Null, Accumulator::result))
                        .collect()
                };
                frame::column_from_keys(&field.name, field.dtype, &cells)
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!("{}: {} group(s)", self.label, keys.len());
        Ok(Emit::output(DataFrame::new(columns)?))
    }
}
