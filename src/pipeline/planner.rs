//! Plan building: turns a parsed [`Pipeline`] into an [`ExecutionPlan`].
//!
//! Planning simulates the pipeline over its schema, step by step, so every
//! structural problem surfaces before a single row is read:
//!
//! - `select` narrows the schema to the listed columns;
//! - `validate` leaves it unchanged;
//! - `features` replaces or adds scaled/encoded columns. A one-hot encoder
//!   whose vocabulary is not known yet leaves an *open prefix*: any column
//!   named `<prefix>_...` is accepted downstream and checked at run time;
//! - `group_by` replaces the schema with the key and aggregate columns.

use super::runtime::{ResolvedRuntime, RunOptions};
use super::spec::{
    FeaturesStep, GroupByStep, Pipeline, SelectStep, Step, Transform, ValidateStep, ValidationMode,
};
use crate::error::{PrepError, Result};
use crate::io::{FileRef, Format, source::read_schema};
use crate::state::StateResolution;
use crate::steps::features::indicator_name;
use crate::steps::{
    FeaturesKernel, GroupByKernel, Kernel, PlannedStep, SelectKernel, ValidateKernel, step_label,
};
use crate::frame::{DataType, Field, Schema};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Schema knowledge at one point of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSchema {
    fields: Vec<Field>,
    /// Indicator prefixes of one-hot encoders that are not fitted yet.
    open_prefixes: Vec<String>,
}

impl PlanSchema {
    pub fn new(schema: &Schema) -> Self {
        Self {
            fields: schema.fields().to_vec(),
            open_prefixes: Vec::new(),
        }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn open_prefixes(&self) -> &[String] {
        &self.open_prefixes
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    fn is_open(&self, name: &str) -> bool {
        self.open_prefixes
            .iter()
            .any(|p| name.strip_prefix(p.as_str()).is_some_and(|rest| rest.starts_with('_')))
    }

    /// Type of `name` at this point. Columns under an open one-hot prefix are indicators.
    fn dtype(&self, label: &str, name: &str) -> Result<DataType> {
        if let Some(field) = self.fields.iter().find(|f| f.name == name) {
            return Ok(field.dtype);
        }
        if self.is_open(name) {
            return Ok(DataType::Int64);
        }
        let available: Vec<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        Err(PrepError::schema(
            label,
            format!(
                "column '{name}' not found (available: {})",
                available.join(", ")
            ),
        ))
    }

    fn require_numeric(&self, label: &str, name: &str, purpose: &str) -> Result<DataType> {
        let dtype = self.dtype(label, name)?;
        if !dtype.is_numeric() {
            return Err(PrepError::schema(
                label,
                format!("{purpose} needs a numeric column, but '{name}' is {dtype}"),
            ));
        }
        Ok(dtype)
    }
}

impl fmt::Display for PlanSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .fields
            .iter()
            .map(|field| format!("{}: {}", field.name, field.dtype))
            .collect();
        parts.extend(self.open_prefixes.iter().map(|p| format!("{p}_*: int64")));
        write!(f, "[{}]", parts.join(", "))
    }
}

/// A pipeline ready to run: resolved files, compiled steps, runtime settings.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub name: String,
    pub inputs: Vec<FileRef>,
    pub input_schema: Schema,
    pub steps: Vec<PlannedStep>,
    pub outputs: Vec<FileRef>,
    /// Schema of the rows reaching the outputs, as far as planning knows it.
    pub output_schema: PlanSchema,
    pub runtime: ResolvedRuntime,
}

impl ExecutionPlan {
    /// Quarantine targets, by step position.
    pub fn quarantine_targets(&self) -> Vec<(usize, &FileRef)> {
        self.steps
            .iter()
            .filter_map(|s| s.quarantine_target().map(|t| (s.position, t)))
            .collect()
    }
}

/// Plan `pipeline`, reading only input metadata.
///
/// The input schema comes from the pipeline's declared `schema`, or else from
/// the first input file; further inputs must provide the same columns.
///
/// # Errors
///
/// `Config` for malformed settings, `Schema` for column problems, `Io` when an
/// input or state file cannot be read.
pub fn plan(pipeline: &Pipeline, options: &RunOptions) -> Result<ExecutionPlan> {
    let inputs = resolve_inputs(pipeline)?;
    let schema = match &pipeline.schema {
        Some(declared) => Schema::new(
            declared
                .iter()
                .map(|(name, dtype)| Field::new(name.clone(), *dtype))
                .collect(),
        ),
        None => read_input_schema(&inputs)?,
    };
    plan_with_schema(pipeline, options, schema)
}

/// Plan `pipeline` against a known input schema without touching input files.
///
/// # Errors
///
/// Same as [`plan`], minus input I/O.
pub fn plan_with_schema(
    pipeline: &Pipeline,
    options: &RunOptions,
    input_schema: Schema,
) -> Result<ExecutionPlan> {
    let inputs = resolve_inputs(pipeline)?;
    let runtime = ResolvedRuntime::resolve(&pipeline.runtime, options, &input_schema)?;
    let outputs = resolve_outputs(pipeline)?;

    let mut schema = PlanSchema::new(&input_schema);
    let mut steps = Vec::with_capacity(pipeline.steps.len());
    let mut quarantine_steps = 0;
    for (i, step) in pipeline.steps.iter().enumerate() {
        let position = i + 1;
        let label = step_label(position, step.kind());
        let field = format!("steps[{i}]");
        let kernel = match step {
            Step::Select(select) => Kernel::Select(plan_select(&label, &field, select, &mut schema)?),
            Step::Validate(validate) => {
                let quarantine = if validate.mode == ValidationMode::Quarantine {
                    quarantine_steps += 1;
                    Some(quarantine_target(validate, &field, &outputs, quarantine_steps)?)
                } else {
                    None
                };
                Kernel::Validate(plan_validate(&label, &field, validate, quarantine, &schema)?)
            }
            Step::Features(features) => {
                Kernel::Features(plan_features(&label, &field, features, &mut schema)?)
            }
            Step::GroupBy(group_by) => {
                Kernel::GroupBy(plan_group_by(&label, &field, group_by, &mut schema)?)
            }
        };
        tracing::debug!("Planned {label}: {schema}");
        steps.push(PlannedStep { position, kernel });
    }

    Ok(ExecutionPlan {
        name: pipeline.display_name().to_owned(),
        inputs,
        input_schema,
        steps,
        outputs,
        output_schema: schema,
        runtime,
    })
}

fn resolve_inputs(pipeline: &Pipeline) -> Result<Vec<FileRef>> {
    if pipeline.inputs.is_empty() {
        return Err(PrepError::config("inputs", "at least one input is required"));
    }
    pipeline
        .inputs
        .iter()
        .enumerate()
        .map(|(i, input)| {
            let format = Format::resolve(input.format, &input.path, &format!("inputs[{i}].format"))?;
            Ok(FileRef::new(&input.path, format))
        })
        .collect()
}

fn resolve_outputs(pipeline: &Pipeline) -> Result<Vec<FileRef>> {
    if pipeline.outputs.is_empty() {
        return Err(PrepError::config("outputs", "at least one output is required"));
    }
    let mut seen = HashSet::new();
    pipeline
        .outputs
        .iter()
        .enumerate()
        .map(|(i, output)| {
            let format =
                Format::resolve(output.format, &output.path, &format!("outputs[{i}].format"))?;
            if !seen.insert(output.path.clone()) {
                return Err(PrepError::config(
                    format!("outputs[{i}].path"),
                    format!("output {} is declared twice", output.path.display()),
                ));
            }
            Ok(FileRef::new(&output.path, format))
        })
        .collect()
}

fn read_input_schema(inputs: &[FileRef]) -> Result<Schema> {
    let Some((first, rest)) = inputs.split_first() else {
        return Err(PrepError::config("inputs", "at least one input is required"));
    };
    let schema = read_schema(first)?;
    for input in rest {
        let other = read_schema(input)?;
        if let Some(missing) = schema.names().find(|name| !other.contains(name)) {
            return Err(PrepError::schema(
                format!("input {}", input.path.display()),
                format!(
                    "column '{missing}' from {} is missing; all inputs must share one schema",
                    first.path.display()
                ),
            ));
        }
    }
    Ok(schema)
}

/// Where quarantined rows of a validate step go: the declared path, or
/// `<first output stem>_quarantine[_N].<ext>` beside the first output.
fn quarantine_target(
    step: &ValidateStep,
    field: &str,
    outputs: &[FileRef],
    ordinal: usize,
) -> Result<FileRef> {
    if let Some(path) = &step.quarantine_path {
        let format = Format::resolve(None, path, &format!("{field}.quarantine_path"))?;
        return Ok(FileRef::new(path, format));
    }
    let Some(first) = outputs.first() else {
        return Err(PrepError::config("outputs", "at least one output is required"));
    };
    let stem = first
        .path
        .file_stem()
        .map_or_else(|| "output".into(), |s| s.to_string_lossy());
    let suffix = if ordinal > 1 {
        format!("_{ordinal}")
    } else {
        String::new()
    };
    let name = format!("{stem}_quarantine{suffix}.{}", first.format.extension());
    let path = first
        .path
        .parent()
        .map_or_else(|| PathBuf::from(&name), |dir: &Path| dir.join(&name));
    Ok(FileRef::new(path, first.format))
}

fn plan_select(
    label: &str,
    field: &str,
    step: &SelectStep,
    schema: &mut PlanSchema,
) -> Result<SelectKernel> {
    if step.columns.is_empty() {
        return Err(PrepError::config(
            format!("{field}.columns"),
            "select needs at least one column",
        ));
    }
    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(step.columns.len());
    for column in &step.columns {
        if !seen.insert(column.as_str()) {
            return Err(PrepError::config(
                format!("{field}.columns"),
                format!("column '{column}' is listed twice"),
            ));
        }
        fields.push(Field::new(column.clone(), schema.dtype(label, column)?));
    }
    *schema = PlanSchema {
        fields,
        open_prefixes: Vec::new(),
    };
    Ok(SelectKernel::new(label, step.columns.clone()))
}

fn plan_validate(
    label: &str,
    field: &str,
    step: &ValidateStep,
    quarantine: Option<FileRef>,
    schema: &PlanSchema,
) -> Result<ValidateKernel> {
    if step.checks.is_empty() {
        return Err(PrepError::config(
            format!("{field}.checks"),
            "validate needs at least one check",
        ));
    }
    let kernel = ValidateKernel::compile(label, field, step, quarantine)?;
    for column in kernel.columns() {
        schema.dtype(label, column)?;
    }
    for column in kernel.numeric_columns() {
        schema.require_numeric(label, column, "range check")?;
    }
    Ok(kernel)
}

fn plan_features(
    label: &str,
    field: &str,
    step: &FeaturesStep,
    schema: &mut PlanSchema,
) -> Result<FeaturesKernel> {
    if step.config.is_empty() {
        return Err(PrepError::config(
            format!("{field}.config"),
            "features needs at least one transform",
        ));
    }
    let mut seen = HashSet::new();
    for (j, spec) in step.config.iter().enumerate() {
        if !seen.insert(spec.column.as_str()) {
            return Err(PrepError::config(
                format!("{field}.config[{j}].column"),
                format!("column '{}' is transformed twice in one step", spec.column),
            ));
        }
        if spec.transform.requires_numeric() {
            schema.require_numeric(label, &spec.column, spec.transform.as_str())?;
        } else {
            schema.dtype(label, &spec.column)?;
        }
    }

    let resolution = StateResolution::resolve(step.state_path.as_deref(), step.refit)?;
    let kernel = FeaturesKernel::new(label, field, step.config.clone(), &resolution)?;

    let mut next = schema.clone();
    for (j, spec) in step.config.iter().enumerate() {
        let alias_field = format!("{field}.config[{j}].alias");
        let name = spec.output_name();
        let index = next.index_of(&spec.column);
        if spec.transform == Transform::OneHotEncode {
            let indicators = match kernel.categories(&spec.column) {
                Some(categories) => categories
                    .iter()
                    .map(|c| Field::new(indicator_name(name, c), DataType::Int64))
                    .collect(),
                None => {
                    next.open_prefixes.push(name.to_owned());
                    Vec::new()
                }
            };
            for indicator in &indicators {
                ensure_new_name(&next, &indicator.name, &alias_field)?;
            }
            if let Some(index) = index {
                next.fields.splice(index..=index, indicators);
            }
            continue;
        }
        let scaled = Field::new(name, DataType::Float64);
        match (spec.alias.is_some(), index) {
            (true, Some(index)) => {
                ensure_new_name(&next, name, &alias_field)?;
                next.fields.insert(index + 1, scaled);
            }
            (false, Some(index)) => {
                if let Some(slot) = next.fields.get_mut(index) {
                    *slot = scaled;
                }
            }
            (_, None) => {
                ensure_new_name(&next, name, &alias_field)?;
                next.fields.push(scaled);
            }
        }
    }
    *schema = next;
    Ok(kernel)
}

fn ensure_new_name(schema: &PlanSchema, name: &str, field: &str) -> Result<()> {
    if schema.index_of(name).is_some() {
        return Err(PrepError::config(
            field,
            format!("output column '{name}' already exists"),
        ));
    }
    Ok(())
}

fn plan_group_by(
    label: &str,
    field: &str,
    step: &GroupByStep,
    schema: &mut PlanSchema,
) -> Result<GroupByKernel> {
    if step.by.is_empty() {
        return Err(PrepError::config(
            format!("{field}.by"),
            "group_by needs at least one key column",
        ));
    }
    if step.aggs.is_empty() {
        return Err(PrepError::config(
            format!("{field}.aggs"),
            "group_by needs at least one aggregate",
        ));
    }

    let mut names = HashSet::new();
    let mut fields = Vec::with_capacity(step.by.len() + step.aggs.len());
    for key in &step.by {
        let dtype = schema.dtype(label, key)?;
        if !names.insert(key.as_str()) {
            return Err(PrepError::config(
                format!("{field}.by"),
                format!("key column '{key}' is listed twice"),
            ));
        }
        fields.push(Field::new(key.clone(), dtype));
    }
    for (j, agg) in step.aggs.iter().enumerate() {
        let input = if agg.func.requires_numeric() {
            schema.require_numeric(label, &agg.column, agg.func.as_str())?
        } else {
            schema.dtype(label, &agg.column)?
        };
        let output = agg.output_name();
        if !names.insert(output) {
            return Err(PrepError::config(
                format!("{field}.aggs[{j}].alias"),
                format!("output column '{output}' is produced twice"),
            ));
        }
        fields.push(Field::new(output, agg.func.output_type(input)));
    }

    *schema = PlanSchema {
        fields,
        open_prefixes: Vec::new(),
    };
    Ok(GroupByKernel::new(label, step.by.clone(), step.aggs.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64),
            Field::new("email", DataType::Utf8),
            Field::new("age", DataType::Float64),
            Field::new("segment", DataType::Utf8),
        ])
    }

    fn plan_yaml(yaml: &str) -> Result<ExecutionPlan> {
        let pipeline = Pipeline::from_yaml_str(yaml)?;
        plan_with_schema(&pipeline, &RunOptions::default(), schema())
    }

    fn field_of(err: PrepError) -> String {
        match err {
            PrepError::Config { field, .. } => field,
            other => panic!("expected a config error, got {other}"),
        }
    }

    #[test]
    fn test_plan_threads_schema() {
        let plan = plan_yaml(
            r"
inputs: [{ path: users.csv }]
steps:
  - type: validate
    mode: quarantine
    checks:
      - { name: email, unique: true }
      - { name: age, range: [0, 120] }
  - type: features
    config:
      - { column: age, transform: standard_scale }
      - { column: segment, transform: one_hot_encode }
  - type: select
    columns: [id, age, segment_A]
outputs: [{ path: out/clean.parquet }]
",
        )
        .unwrap();

        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].label(), "step 1 (validate)");
        let targets = plan.quarantine_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].1.path, PathBuf::from("out/clean_quarantine.parquet"));
        assert_eq!(
            plan.output_schema.fields(),
            [
                Field::new("id", DataType::Int64),
                Field::new("age", DataType::Float64),
                Field::new("segment_A", DataType::Int64),
            ]
        );
        assert!(plan.steps[1].pending_fit().is_some());
    }

    #[test]
    fn test_select_missing_column_is_schema_error() {
        let err = plan_yaml(
            r"
inputs: [{ path: users.csv }]
steps:
  - { type: select, columns: [id, nonexistent] }
outputs: [{ path: out.csv }]
",
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert!(err.to_string().contains("step 1 (select)"));
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn test_select_narrows_for_later_steps() {
        let err = plan_yaml(
            r"
inputs: [{ path: users.csv }]
steps:
  - { type: select, columns: [id] }
  - { type: validate, checks: [{ name: email, not_null: true }] }
outputs: [{ path: out.csv }]
",
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert!(err.to_string().contains("step 2 (validate)"));
    }

    #[test]
    fn test_numeric_requirements() {
        for yaml in [
            "steps: [{ type: validate, checks: [{ name: email, range: [0, 1] }] }]",
            "steps: [{ type: features, config: [{ column: email, transform: standard_scale }] }]",
            "steps: [{ type: group_by, by: id, aggs: [{ column: email, func: sum }] }]",
        ] {
            let full = format!("inputs: [{{ path: in.csv }}]\noutputs: [{{ path: out.csv }}]\n{yaml}");
            let err = plan_yaml(&full).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Schema, "{yaml}");
        }
    }

    #[test]
    fn test_group_by_replaces_schema() {
        let plan = plan_yaml(
            r"
inputs: [{ path: users.csv }]
steps:
  - type: group_by
    by: segment
    aggs:
      - { column: age, func: sum, alias: total_age }
      - { column: id, func: count }
outputs: [{ path: out.csv }]
",
        )
        .unwrap();
        assert_eq!(
            plan.output_schema.fields(),
            [
                Field::new("segment", DataType::Utf8),
                Field::new("total_age", DataType::Float64),
                Field::new("id", DataType::Int64),
            ]
        );
    }

    #[test]
    fn test_config_errors_name_fields() {
        let cases = [
            (
                "steps: [{ type: group_by, by: segment, aggs: [{ column: age, func: sum, alias: segment }] }]",
                "steps[0].aggs[0].alias",
            ),
            (
                "steps: [{ type: features, config: [{ column: age, transform: standard_scale }, { column: age, transform: min_max_scale }] }]",
                "steps[0].config[1].column",
            ),
            (
                "steps: [{ type: features, config: [{ column: age, transform: standard_scale, alias: id }] }]",
                "steps[0].config[0].alias",
            ),
            ("steps: [{ type: select, columns: [] }]", "steps[0].columns"),
        ];
        for (steps, expected) in cases {
            let full = format!("inputs: [{{ path: in.csv }}]\noutputs: [{{ path: out.csv }}]\n{steps}");
            assert_eq!(field_of(plan_yaml(&full).unwrap_err()), expected);
        }

        let bad_output = "inputs: [{ path: in.csv }]\noutputs: [{ path: out.json }]\nsteps: []";
        assert_eq!(field_of(plan_yaml(bad_output).unwrap_err()), "outputs[0].format");
    }

    #[test]
    fn test_second_quarantine_step_gets_numbered_target() {
        let plan = plan_yaml(
            r"
inputs: [{ path: users.csv }]
steps:
  - { type: validate, mode: quarantine, checks: [{ name: email, unique: true }] }
  - { type: validate, mode: quarantine, checks: [{ name: age, not_null: true }] }
  - { type: validate, mode: quarantine, quarantine_path: bad/ages.csv, checks: [{ name: age, range: [0, 120] }] }
outputs: [{ path: clean.csv }]
",
        )
        .unwrap();
        let targets: Vec<_> = plan
            .quarantine_targets()
            .into_iter()
            .map(|(_, t)| t.path.clone())
            .collect();
        assert_eq!(
            targets,
            [
                PathBuf::from("clean_quarantine.csv"),
                PathBuf::from("clean_quarantine_2.csv"),
                PathBuf::from("bad/ages.csv"),
            ]
        );
    }

    #[test]
    fn test_loaded_one_hot_state_resolves_names() {
        let dir = tempfile::TempDir::new().unwrap();
        let state_path = dir.path().join("state.json");
        crate::state::FeatureState::new(
            vec![crate::state::FittedTransform::OneHotEncode {
                column: "segment".to_owned(),
                categories: vec!["B".to_owned(), "A".to_owned()],
            }],
            2,
        )
        .save(&state_path)
        .unwrap();

        let yaml = format!(
            r"
inputs: [{{ path: users.csv }}]
steps:
  - type: features
    state_path: {}
    config: [{{ column: segment, transform: one_hot_encode }}]
  - {{ type: select, columns: [segment_C] }}
outputs: [{{ path: out.csv }}]
",
            state_path.display()
        );
        let err = plan_yaml(&yaml).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert!(err.to_string().contains("segment_B"));
    }
}
