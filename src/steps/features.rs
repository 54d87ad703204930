//! Feature transforms: fit, persist, apply.
//!
//! A features kernel is built in one of two shapes:
//!
//! - **apply**: parameters are known (loaded from a state file, or fitted by a
//!   streaming pre-pass) and every chunk is transformed as it arrives;
//! - **fit**: parameters are unknown, so chunks are buffered while a
//!   [`FeatureFitter`] accumulates statistics, and the whole buffered input is
//!   transformed at end of input.
//!
//! Every transform in a step reads its source column from the step's input.

use super::{Emit, Moments, PassMode, StepKernel};
use crate::error::{PrepError, Result};
use crate::pipeline::spec::{FeatureSpec, Transform};
use crate::state::{FeatureState, FittedTransform, StateResolution};
use crate::frame;
use polars::prelude::{
    ChunkApply as _, ChunkCompareEq as _, Column, DataFrame, FillNullStrategy, Float64Chunked,
    IntoColumn as _,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Fitted parameters prepared for column-wise application.
#[derive(Debug, Clone)]
enum Applier {
    Standard { mean: f64, std: f64 },
    MinMax { min: f64, max: f64 },
    OneHot { categories: Vec<String> },
    Count { frequencies: HashMap<String, f64> },
}

impl Applier {
    fn from_fitted(fitted: &FittedTransform) -> Self {
        match fitted {
            FittedTransform::StandardScale { mean, std, .. } => Self::Standard {
                mean: *mean,
                std: *std,
            },
            FittedTransform::MinMaxScale { min, max, .. } => Self::MinMax {
                min: *min,
                max: *max,
            },
            FittedTransform::OneHotEncode { categories, .. } => Self::OneHot {
                categories: categories.clone(),
            },
            FittedTransform::CountEncode { counts, total, .. } => Self::Count {
                frequencies: counts
                    .iter()
                    .map(|(category, count)| {
                        let frequency = if *total == 0 {
                            0.0
                        } else {
                            *count as f64 / *total as f64
                        };
                        (category.clone(), frequency)
                    })
                    .collect(),
            },
        }
    }

    /// Columns produced from `column`, the first named `name`. One-hot
    /// encoding yields one `Int64` indicator per category, prefixed by `name`.
    fn apply(&self, name: &str, column: &Column) -> Result<Vec<Column>> {
        let scaled = match self {
            Self::Standard { mean, std } => {
                let (mean, std) = (*mean, *std);
                let values = frame::numbers(column)?;
                if std.abs() < f64::EPSILON {
                    values.apply_values(|_| 0.0)
                } else {
                    values.apply_values(move |v| (v - mean) / std)
                }
            }
            Self::MinMax { min, max } => {
                let (min, range) = (*min, max - min);
                let values = frame::numbers(column)?;
                if range.abs() < f64::EPSILON {
                    values.apply_values(|_| 0.5)
                } else {
                    values.apply_values(move |v| (v - min) / range)
                }
            }
            Self::Count { frequencies } => frame::labels(column)?
                .into_iter()
                .map(|label| Some(label.and_then(|l| frequencies.get(l)).copied().unwrap_or(0.0)))
                .collect::<Float64Chunked>(),
            Self::OneHot { categories } => {
                let labels = frame::labels(column)?;
                return categories
                    .iter()
                    .map(|category| {
                        let hits = labels
                            .equal(category.as_str())
                            .into_column()
                            .cast(&polars::prelude::DataType::Int64)?
                            .fill_null(FillNullStrategy::Zero)?;
                        Ok(hits.with_name(indicator_name(name, category).into()))
                    })
                    .collect();
            }
        };
        Ok(vec![scaled.with_name(name.into()).into_column()])
    }
}

/// Name of the indicator column for `category`.
pub fn indicator_name(prefix: &str, category: &str) -> String {
    format!("{prefix}_{category}")
}

#[derive(Debug, Clone)]
enum FitAccumulator {
    Standard(Moments),
    MinMax {
        min: Option<f64>,
        max: Option<f64>,
    },
    OneHot {
        categories: Vec<String>,
        seen: HashSet<String>,
    },
    Count {
        counts: BTreeMap<String, u64>,
        total: u64,
    },
}

impl FitAccumulator {
    fn new(transform: Transform) -> Self {
        match transform {
            Transform::StandardScale => Self::Standard(Moments::default()),
            Transform::MinMaxScale => Self::MinMax {
                min: None,
                max: None,
            },
            Transform::OneHotEncode => Self::OneHot {
                categories: Vec::new(),
                seen: HashSet::new(),
            },
            Transform::CountEncode => Self::Count {
                counts: BTreeMap::new(),
                total: 0,
            },
        }
    }

    fn observe(&mut self, column: &Column) -> Result<()> {
        match self {
            Self::Standard(moments) => {
                for v in frame::numbers(column)?.into_iter().flatten().filter(|v| v.is_finite()) {
                    moments.push(v);
                }
            }
            Self::MinMax { min, max } => {
                for v in frame::numbers(column)?.into_iter().flatten().filter(|v| v.is_finite()) {
                    *min = Some(min.map_or(v, |m| m.min(v)));
                    *max = Some(max.map_or(v, |m| m.max(v)));
                }
            }
            Self::OneHot { categories, seen } => {
                for label in frame::labels(column)?.into_iter().flatten() {
                    if seen.insert(label.to_owned()) {
                        categories.push(label.to_owned());
                    }
                }
            }
            Self::Count { counts, total } => {
                for label in frame::labels(column)?.into_iter().flatten() {
                    *counts.entry(label.to_owned()).or_insert(0) += 1;
                    *total += 1;
                }
            }
        }
        Ok(())
    }

    fn into_fitted(self, column: String) -> FittedTransform {
        match self {
            Self::Standard(moments) => FittedTransform::StandardScale {
                column,
                mean: moments.mean().unwrap_or(0.0),
                std: moments.variance().map_or(0.0, f64::sqrt),
            },
            Self::MinMax { min, max } => FittedTransform::MinMaxScale {
                column,
                min: min.unwrap_or(0.0),
                max: max.unwrap_or(0.0),
            },
            Self::OneHot { categories, .. } => {
                FittedTransform::OneHotEncode { column, categories }
            }
            Self::Count { counts, total } => FittedTransform::CountEncode {
                column,
                counts,
                total,
            },
        }
    }
}

/// Accumulates fit statistics for the transforms of one features step.
#[derive(Debug, Clone)]
pub struct FeatureFitter {
    label: String,
    specs: Vec<FeatureSpec>,
    accumulators: Vec<FitAccumulator>,
    rows: u64,
}

impl FeatureFitter {
    fn new(label: &str, specs: &[FeatureSpec]) -> Self {
        Self {
            label: label.to_owned(),
            specs: specs.to_vec(),
            accumulators: specs.iter().map(|s| FitAccumulator::new(s.transform)).collect(),
            rows: 0,
        }
    }

    /// Fold one chunk into the statistics.
    ///
    /// # Errors
    ///
    /// Returns `Schema` if a source column is missing from the chunk.
    pub fn observe(&mut self, chunk: &DataFrame) -> Result<()> {
        for (spec, accumulator) in self.specs.iter().zip(&mut self.accumulators) {
            let column = chunk.column(&spec.column).map_err(|_| {
                PrepError::schema(
                    &self.label,
                    format!("column '{}' not present in input", spec.column),
                )
            })?;
            accumulator.observe(column)?;
        }
        self.rows += chunk.height() as u64;
        Ok(())
    }

    pub fn finish(self) -> FeatureState {
        let entries = self
            .specs
            .into_iter()
            .zip(self.accumulators)
            .map(|(spec, accumulator)| accumulator.into_fitted(spec.column))
            .collect();
        FeatureState::new(entries, self.rows)
    }
}

/// Compiled features step.
#[derive(Debug, Clone)]
pub struct FeaturesKernel {
    label: String,
    specs: Vec<FeatureSpec>,
    persist_to: Option<PathBuf>,
    /// `None` until parameters are known.
    appliers: Option<Arc<[Applier]>>,
}

impl FeaturesKernel {
    /// Build the kernel for a resolved state source. `field_prefix` locates
    /// the step in the pipeline file for error messages.
    ///
    /// # Errors
    ///
    /// Returns `Config` if loaded state lacks an entry for a configured transform.
    pub fn new(
        label: impl Into<String>,
        field_prefix: &str,
        specs: Vec<FeatureSpec>,
        resolution: &StateResolution,
    ) -> Result<Self> {
        let mut kernel = Self {
            label: label.into(),
            specs,
            persist_to: None,
            appliers: None,
        };
        match resolution {
            StateResolution::Load { path, state } => {
                kernel.appliers = Some(kernel.appliers_for(state).map_err(|missing| {
                    PrepError::config(
                        format!("{field_prefix}.state_path"),
                        format!(
                            "state file {} has no fitted {} for column '{}'",
                            path.display(),
                            missing.transform,
                            missing.column
                        ),
                    )
                })?);
            }
            StateResolution::Fit { persist_to } => kernel.persist_to.clone_from(persist_to),
        }
        Ok(kernel)
    }

    /// Same step, applying `state` instead of fitting.
    ///
    /// # Errors
    ///
    /// Returns `DataProcessing` if `state` does not cover every transform.
    pub fn with_fitted(&self, state: &FeatureState) -> Result<Self> {
        let appliers = self.appliers_for(state).map_err(|missing| {
            PrepError::DataProcessing(format!(
                "{}: fitted state has no {} for column '{}'",
                self.label, missing.transform, missing.column
            ))
        })?;
        Ok(Self {
            appliers: Some(appliers),
            ..self.clone()
        })
    }

    fn appliers_for(&self, state: &FeatureState) -> std::result::Result<Arc<[Applier]>, FeatureSpec> {
        self.specs
            .iter()
            .map(|spec| {
                state
                    .entry(&spec.column, spec.transform)
                    .map(Applier::from_fitted)
                    .ok_or_else(|| spec.clone())
            })
            .collect()
    }

    pub fn needs_fit(&self) -> bool {
        self.appliers.is_none()
    }

    pub fn persist_to(&self) -> Option<&PathBuf> {
        self.persist_to.as_ref()
    }

    /// Known one-hot vocabulary for `column`, when parameters are loaded.
    pub fn categories(&self, column: &str) -> Option<&[String]> {
        let appliers = self.appliers.as_deref()?;
        self.specs
            .iter()
            .zip(appliers)
            .find_map(|(spec, applier)| match applier {
                Applier::OneHot { categories }
                    if spec.column == column && spec.transform == Transform::OneHotEncode =>
                {
                    Some(categories.as_slice())
                }
                _ => None,
            })
    }

    pub fn fitter(&self) -> FeatureFitter {
        FeatureFitter::new(&self.label, &self.specs)
    }

    /// Transform `chunk`. A transformed column is replaced in place by its
    /// output, except that scaling and count encoding with an alias keep the
    /// source and insert the output right after it.
    fn apply(&self, appliers: &[Applier], chunk: &DataFrame) -> Result<DataFrame> {
        if let Some(missing) = self
            .specs
            .iter()
            .find(|spec| chunk.get_column_index(&spec.column).is_none())
        {
            return Err(PrepError::schema(
                &self.label,
                format!("column '{}' not present in input", missing.column),
            ));
        }
        let mut columns = Vec::with_capacity(chunk.width() + self.specs.len());
        for column in chunk.get_columns() {
            let transform = self
                .specs
                .iter()
                .zip(appliers)
                .find(|(spec, _)| spec.column == column.name().as_str());
            let Some((spec, applier)) = transform else {
                columns.push(column.clone());
                continue;
            };
            if spec.alias.is_some() && !matches!(applier, Applier::OneHot { .. }) {
                columns.push(column.clone());
            }
            columns.extend(applier.apply(spec.output_name(), column)?);
        }
        frame::with_columns(chunk, columns)
    }
}

/// Per-pass state of a features step.
#[derive(Debug)]
pub struct FeaturesState {
    fitter: Option<FeatureFitter>,
    buffered: Vec<DataFrame>,
    fitted: Option<FeatureState>,
}

impl FeaturesState {
    pub fn take_fitted(&mut self) -> Option<FeatureState> {
        self.fitted.take()
    }
}

impl StepKernel for FeaturesKernel {
    type State = FeaturesState;

    fn init(&self, _mode: PassMode) -> Self::State {
        FeaturesState {
            fitter: self.needs_fit().then(|| self.fitter()),
            buffered: Vec::new(),
            fitted: None,
        }
    }

    fn push(&self, state: &mut Self::State, chunk: DataFrame) -> Result<Emit> {
        if let Some(appliers) = &self.appliers {
            return Ok(Emit::output(self.apply(appliers, &chunk)?));
        }
        if let Some(fitter) = state.fitter.as_mut() {
            fitter.observe(&chunk)?;
        }
        state.buffered.push(chunk);
        Ok(Emit::default())
    }

    fn finish(&self, state: &mut Self::State) -> Result<Emit> {
        let Some(fitter) = state.fitter.take() else {
            return Ok(Emit::default());
        };
        let fitted = fitter.finish();
        tracing::info!(
            "{}: fitted {} transform(s) on {} row(s)",
            self.label,
            fitted.entries.len(),
            fitted.rows_fitted
        );
        let applying = self.with_fitted(&fitted)?;
        state.fitted = Some(fitted);

        let mut buffered = std::mem::take(&mut state.buffered).into_iter();
        let Some(mut all) = buffered.next() else {
            return Ok(Emit::default());
        };
        for chunk in buffered {
            all.vstack_mut(&chunk)?;
        }
        let appliers = applying.appliers.as_deref().unwrap_or_default();
        Ok(Emit::output(applying.apply(appliers, &all)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::steps::test_support::{f64s, floats, frame, i64s, ints, run_chunked, strs};

    fn spec(column: &str, transform: Transform, alias: Option<&str>) -> FeatureSpec {
        FeatureSpec {
            column: column.to_owned(),
            transform,
            alias: alias.map(str::to_owned),
        }
    }

    fn fitting(specs: Vec<FeatureSpec>) -> FeaturesKernel {
        FeaturesKernel::new(
            "step 1 (features)",
            "steps[0]",
            specs,
            &StateResolution::Fit { persist_to: None },
        )
        .unwrap()
    }

    fn fit_and_run(
        kernel: &FeaturesKernel,
        input: &DataFrame,
        chunk_rows: usize,
    ) -> (DataFrame, FeatureState) {
        let mut state = kernel.init(PassMode::Output);
        let mut offset = 0;
        while offset < input.height() {
            let chunk = input.slice(i64::try_from(offset).unwrap(), chunk_rows);
            let emit = kernel.push(&mut state, chunk).unwrap();
            assert!(emit.output.is_none(), "fit mode emits only at end of input");
            offset += chunk_rows;
        }
        let output = kernel.finish(&mut state).unwrap().output.unwrap();
        (output, state.take_fitted().unwrap())
    }

    #[test]
    fn test_standard_scale_fit_and_apply() {
        let kernel = fitting(vec![spec("income", Transform::StandardScale, None)]);
        let input = frame(vec![floats("income", &[Some(8.0), Some(10.0), Some(12.0), None])]);
        let (output, fitted) = fit_and_run(&kernel, &input, 2);

        assert_eq!(
            fitted.entries,
            vec![FittedTransform::StandardScale {
                column: "income".to_owned(),
                mean: 10.0,
                std: 2.0
            }]
        );
        assert_eq!(f64s(&output, "income"), [Some(-1.0), Some(0.0), Some(1.0), None]);

        let reloaded = kernel.with_fitted(&fitted).unwrap();
        let other = frame(vec![ints("income", &[Some(12)])]);
        let (applied, _) = run_chunked(&reloaded, &other, 10).unwrap();
        assert_eq!(f64s(&applied.unwrap(), "income"), [Some(1.0)]);
    }

    #[test]
    fn test_zero_variance_scales_to_constants() {
        let kernel = fitting(vec![
            spec("x", Transform::StandardScale, None),
            spec("y", Transform::MinMaxScale, None),
        ]);
        let input = frame(vec![
            floats("x", &[Some(3.0), Some(3.0)]),
            floats("y", &[Some(7.0), Some(7.0)]),
        ]);
        let (output, _) = fit_and_run(&kernel, &input, 5);
        assert_eq!(f64s(&output, "x"), [Some(0.0), Some(0.0)]);
        assert_eq!(f64s(&output, "y"), [Some(0.5), Some(0.5)]);
    }

    #[test]
    fn test_one_hot_first_seen_order_and_unseen_category() {
        let kernel = fitting(vec![spec("segment", Transform::OneHotEncode, None)]);
        let input = frame(vec![
            ints("id", &[Some(1), Some(2), Some(3)]),
            strs("segment", &[Some("A"), Some("B"), Some("A")]),
        ]);
        let (output, fitted) = fit_and_run(&kernel, &input, 1);
        assert_eq!(output.get_column_names_str(), ["id", "segment_A", "segment_B"]);
        assert_eq!(i64s(&output, "segment_A"), [Some(1), Some(0), Some(1)]);
        assert_eq!(i64s(&output, "segment_B"), [Some(0), Some(1), Some(0)]);

        let reloaded = kernel.with_fitted(&fitted).unwrap();
        assert_eq!(
            reloaded.categories("segment"),
            Some(["A".to_owned(), "B".to_owned()].as_slice())
        );
        let unseen = frame(vec![
            ints("id", &[Some(9), Some(10)]),
            strs("segment", &[Some("C"), None]),
        ]);
        let (applied, _) = run_chunked(&reloaded, &unseen, 10).unwrap();
        let applied = applied.unwrap();
        assert_eq!(i64s(&applied, "segment_A"), [Some(0), Some(0)]);
        assert_eq!(i64s(&applied, "segment_B"), [Some(0), Some(0)]);
    }

    #[test]
    fn test_one_hot_without_categories_keeps_row_count() {
        let kernel = fitting(vec![spec("segment", Transform::OneHotEncode, None)]);
        let input = frame(vec![strs("segment", &[None, None, None])]);
        let (output, fitted) = fit_and_run(&kernel, &input, 2);
        assert_eq!(output.shape(), (3, 0));

        let reloaded = kernel.with_fitted(&fitted).unwrap();
        let (applied, _) = run_chunked(&reloaded, &input, 2).unwrap();
        assert_eq!(applied.unwrap().shape(), (3, 0));
    }

    #[test]
    fn test_alias_keeps_source_column() {
        let kernel = fitting(vec![
            spec("city", Transform::CountEncode, Some("city_freq")),
            spec("age", Transform::MinMaxScale, Some("age_scaled")),
        ]);
        let input = frame(vec![
            strs("city", &[Some("x"), Some("x"), Some("y"), None]),
            floats("age", &[Some(10.0), Some(20.0), Some(30.0), None]),
        ]);
        let (output, _) = fit_and_run(&kernel, &input, 3);
        assert_eq!(
            output.get_column_names_str(),
            ["city", "city_freq", "age", "age_scaled"]
        );
        let freq = f64s(&output, "city_freq");
        assert_eq!(freq[0], Some(2.0 / 3.0));
        assert_eq!(freq[3], Some(0.0));
        assert_eq!(f64s(&output, "age_scaled"), [Some(0.0), Some(0.5), Some(1.0), None]);
    }

    #[test]
    fn test_fit_is_independent_of_chunking() {
        let values: Vec<Option<f64>> = (0..50).map(|i| Some(f64::from(i) * 0.37 - 4.0)).collect();
        let input = frame(vec![floats("v", &values)]);
        let kernel = fitting(vec![spec("v", Transform::StandardScale, None)]);
        let (whole, whole_state) = fit_and_run(&kernel, &input, 50);
        let (chunked, chunked_state) = fit_and_run(&kernel, &input, 7);
        assert_eq!(whole_state.entries, chunked_state.entries);
        assert!(whole.equals_missing(&chunked));
    }

    #[test]
    fn test_loaded_state_missing_entry_is_config_error() {
        let state = FeatureState::new(
            vec![FittedTransform::StandardScale {
                column: "income".to_owned(),
                mean: 0.0,
                std: 1.0,
            }],
            1,
        );
        let resolution = StateResolution::Load {
            path: PathBuf::from("state.json"),
            state,
        };
        let err = FeaturesKernel::new(
            "step 2 (features)",
            "steps[1]",
            vec![spec("segment", Transform::OneHotEncode, None)],
            &resolution,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("steps[1].state_path"));
    }
}
