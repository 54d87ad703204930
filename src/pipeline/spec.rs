//! Pipeline description data structures.
//!
//! A pipeline is written in YAML:
//!
//! ```yaml
//! name: customers
//! inputs:
//!   - path: data/customers.csv
//! steps:
//!   - type: validate
//!     mode: quarantine
//!     checks:
//!       - name: email
//!         unique: true
//!       - name: age
//!         range: [0, 120]
//!   - type: features
//!     state_path: state/customers.json
//!     config:
//!       features:
//!         - { column: income, transform: standard_scale }
//!         - { column: segment, transform: one_hot_encode }
//!   - type: group_by
//!     by: [region]
//!     aggs:
//!       - { column: income, func: sum, alias: total_income }
//! outputs:
//!   - path: out/customers.parquet
//! runtime:
//!   streaming: true
//!   memory_limit: 512MB
//! ```
//!
//! `${VAR}` references are substituted from the environment before parsing.
//! Parsing only checks shape; column references are resolved by the
//! [`planner`](super::planner).

use crate::error::{PrepError, Result, ResultExt as _};
use crate::io::Format;
use crate::frame::DataType;
use regex::Regex;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Step `type` values accepted in a pipeline description.
pub const STEP_TYPES: [&str; 4] = ["select", "validate", "features", "group_by"];

/// Root pipeline description.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    /// Human-readable name; defaults to the file stem when loaded from disk.
    #[serde(default)]
    pub name: Option<String>,

    pub inputs: Vec<InputSpec>,

    /// Declared input schema, in column order. Skips probing the input.
    #[serde(default, deserialize_with = "de_declared_schema")]
    pub schema: Option<Vec<(String, DataType)>>,

    #[serde(default)]
    pub steps: Vec<Step>,

    #[serde(default)]
    pub outputs: Vec<OutputSpec>,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Pipeline {
    /// Load a pipeline description from a YAML file.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read, `Config` if it does not describe a pipeline.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).at_path(path)?;
        let mut pipeline = Self::from_yaml_str(&content)?;
        if pipeline.name.is_none() {
            pipeline.name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned());
        }
        Ok(pipeline)
    }

    /// Parse a pipeline description, substituting `${VAR}` from the process environment.
    ///
    /// # Errors
    ///
    /// `Config` on a missing variable or a malformed description.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::from_yaml_str_with(yaml, |name| std::env::var(name).ok())
    }

    /// Parse a pipeline description with a custom variable lookup.
    ///
    /// # Errors
    ///
    /// `Config` on a missing variable or a malformed description.
    pub fn from_yaml_str_with<F>(yaml: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let substituted = substitute_env_vars(yaml, lookup)?;
        check_step_types(&substituted)?;
        serde_yaml::from_str(&substituted).map_err(|e| yaml_error(&e))
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("pipeline")
    }
}

/// Replace every `${VAR}` with `lookup(VAR)`.
///
/// # Errors
///
/// Returns `Config` listing every variable the lookup could not resolve.
pub fn substitute_env_vars<F>(input: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = caps.get(1).map_or("", |m| m.as_str());
        lookup(name).unwrap_or_else(|| {
            missing.push(name.to_owned());
            String::new()
        })
    });

    if !missing.is_empty() {
        return Err(PrepError::config(
            "environment",
            format!("missing environment variable(s): {}", missing.join(", ")),
        ));
    }
    Ok(result.into_owned())
}

/// Reject unknown step types with the exact field that carries them.
fn check_step_types(yaml: &str) -> Result<()> {
    let Ok(doc) = serde_yaml::from_str::<serde_yaml::Value>(yaml) else {
        // Syntax errors are reported by the typed parse.
        return Ok(());
    };
    let Some(steps) = doc.get("steps").and_then(serde_yaml::Value::as_sequence) else {
        return Ok(());
    };
    for (idx, step) in steps.iter().enumerate() {
        let field = format!("steps[{idx}].type");
        match step.get("type") {
            None => return Err(PrepError::config(field, "missing step type")),
            Some(serde_yaml::Value::String(kind)) if STEP_TYPES.contains(&kind.as_str()) => {}
            Some(other) => {
                let shown = other
                    .as_str()
                    .map_or_else(|| format!("{other:?}"), ToOwned::to_owned);
                return Err(PrepError::config(
                    field,
                    format!(
                        "unknown step type '{shown}', expected one of: {}",
                        STEP_TYPES.join(", ")
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// serde_yaml reports nested errors as `path: message`; keep the path as the field.
fn yaml_error(err: &serde_yaml::Error) -> PrepError {
    let text = err.to_string();
    if let Some((path, message)) = text.split_once(": ")
        && !path.contains(' ')
    {
        return PrepError::config(path, message);
    }
    PrepError::config("pipeline", text)
}

/// Input file reference.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub format: Option<Format>,
}

/// Output file reference.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub format: Option<Format>,
}

/// Execution settings. None of these change results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub streaming: bool,

    /// Byte budget such as `"4GB"` or `"500MB"`; sizes streaming chunks.
    #[serde(default)]
    pub memory_limit: Option<String>,

    /// Explicit chunk size, overriding the one derived from `memory_limit`.
    #[serde(default)]
    pub chunk_rows: Option<usize>,

    /// Where to write the run's lineage record.
    #[serde(default)]
    pub lineage_path: Option<PathBuf>,
}

/// One pipeline step, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Select(SelectStep),
    Validate(ValidateStep),
    Features(FeaturesStep),
    GroupBy(GroupByStep),
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Select(_) => "select",
            Self::Validate(_) => "validate",
            Self::Features(_) => "features",
            Self::GroupBy(_) => "group_by",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectStep {
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidateStep {
    #[serde(deserialize_with = "de_checks")]
    pub checks: Vec<ColumnCheck>,

    #[serde(default)]
    pub mode: ValidationMode,

    /// Where quarantined rows go; derived from the first output when unset.
    #[serde(default)]
    pub quarantine_path: Option<PathBuf>,
}

/// What a validate step does with a violating row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Abort the run at the first violation.
    #[default]
    Strict,
    /// Keep every row and report violation counts.
    Warn,
    /// Move violating rows to the quarantine output.
    Quarantine,
}

/// Checks declared for one column.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnCheck {
    #[serde(alias = "column")]
    pub name: String,

    #[serde(default)]
    pub not_null: bool,

    #[serde(default)]
    pub unique: bool,

    /// Inclusive `[min, max]`.
    #[serde(default)]
    pub range: Option<[f64; 2]>,

    #[serde(default)]
    pub regex: Option<String>,

    /// Allowed values, compared by their text form.
    #[serde(default, rename = "enum", alias = "allowed", deserialize_with = "de_scalar_list")]
    pub allowed: Option<Vec<String>>,
}

impl ColumnCheck {
    pub fn has_any_check(&self) -> bool {
        self.not_null
            || self.unique
            || self.range.is_some()
            || self.regex.is_some()
            || self.allowed.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeaturesStep {
    #[serde(deserialize_with = "de_feature_config")]
    pub config: Vec<FeatureSpec>,

    /// Fitted parameters are loaded from here when present and saved here after a fit.
    #[serde(default)]
    pub state_path: Option<PathBuf>,

    /// Fit again even if `state_path` exists.
    #[serde(default)]
    pub refit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureSpec {
    pub column: String,
    pub transform: Transform,
    #[serde(default)]
    pub alias: Option<String>,
}

impl FeatureSpec {
    /// Name of the scaled or encoded column, or the indicator prefix for one-hot.
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    #[serde(alias = "standard")]
    StandardScale,
    #[serde(alias = "min_max", alias = "minmax")]
    MinMaxScale,
    #[serde(alias = "one_hot", alias = "onehot")]
    OneHotEncode,
    #[serde(alias = "count")]
    CountEncode,
}

impl Transform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StandardScale => "standard_scale",
            Self::MinMaxScale => "min_max_scale",
            Self::OneHotEncode => "one_hot_encode",
            Self::CountEncode => "count_encode",
        }
    }

    pub fn requires_numeric(self) -> bool {
        matches!(self, Self::StandardScale | Self::MinMaxScale)
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupByStep {
    #[serde(deserialize_with = "de_one_or_many")]
    pub by: Vec<String>,

    #[serde(deserialize_with = "de_aggs")]
    pub aggs: Vec<AggSpec>,
}

/// One aggregate of a group-by step.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggSpec {
    pub column: String,
    pub func: AggFunc,
    #[serde(default)]
    pub alias: Option<String>,
}

impl AggSpec {
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    Sum,
    Count,
    #[serde(alias = "avg")]
    Mean,
    Min,
    Max,
    First,
    Last,
    Std,
    Var,
}

impl AggFunc {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Mean => "mean",
            Self::Min => "min",
            Self::Max => "max",
            Self::First => "first",
            Self::Last => "last",
            Self::Std => "std",
            Self::Var => "var",
        }
    }

    pub fn requires_numeric(self) -> bool {
        matches!(
            self,
            Self::Sum | Self::Mean | Self::Min | Self::Max | Self::Std | Self::Var
        )
    }

    /// Output column type for a source column of type `input`.
    pub fn output_type(self, input: DataType) -> DataType {
        match self {
            Self::Count => DataType::Int64,
            Self::Sum if input == DataType::Int64 => DataType::Int64,
            Self::Sum | Self::Mean | Self::Std | Self::Var => DataType::Float64,
            Self::Min | Self::Max | Self::First | Self::Last => input,
        }
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Flexible field shapes
// ---------------------------------------------------------------------------

/// Map visitor that keeps entries in document order.
struct OrderedMap<V>(PhantomData<V>);

impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMap<V> {
    type Value = Vec<(String, V)>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a mapping")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
        let mut entries: Vec<(String, V)> = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((key, value)) = map.next_entry::<String, V>()? {
            if entries.iter().any(|(k, _)| *k == key) {
                return Err(de::Error::custom(format!("duplicate key '{key}'")));
            }
            entries.push((key, value));
        }
        Ok(entries)
    }
}

fn de_declared_schema<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<(String, DataType)>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct NamedField {
        name: String,
        #[serde(rename = "type", alias = "dtype")]
        dtype: DataType,
    }

    struct SchemaVisitor;

    impl<'de> Visitor<'de> for SchemaVisitor {
        type Value = Option<Vec<(String, DataType)>>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping of column to type, or a list of {name, type}")
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_map<A: MapAccess<'de>>(self, map: A) -> std::result::Result<Self::Value, A::Error> {
            OrderedMap::<DataType>(PhantomData).visit_map(map).map(Some)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
            let mut fields = Vec::new();
            while let Some(field) = seq.next_element::<NamedField>()? {
                fields.push((field.name, field.dtype));
            }
            Ok(Some(fields))
        }
    }

    deserializer.deserialize_any(SchemaVisitor)
}

fn de_checks<'de, D>(deserializer: D) -> std::result::Result<Vec<ColumnCheck>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        List(Vec<ColumnCheck>),
        Grouped { columns: Vec<ColumnCheck> },
    }

    match Repr::deserialize(deserializer) {
        Ok(Repr::List(checks) | Repr::Grouped { columns: checks }) => Ok(checks),
        Err(_) => Err(de::Error::custom(
            "checks must be a list of column checks ({name, not_null?, unique?, range?, regex?, enum?}) or {columns: [...]}",
        )),
    }
}

fn de_feature_config<'de, D>(deserializer: D) -> std::result::Result<Vec<FeatureSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        List(Vec<FeatureSpec>),
        Grouped { features: Vec<FeatureSpec> },
    }

    match Repr::deserialize(deserializer) {
        Ok(Repr::List(specs) | Repr::Grouped { features: specs }) => Ok(specs),
        Err(_) => Err(de::Error::custom(
            "config must be {features: [{column, transform, alias?}]} with transform one of: standard_scale, min_max_scale, one_hot_encode, count_encode",
        )),
    }
}

fn de_one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::One(name) => vec![name],
        Repr::Many(names) => names,
    })
}

fn de_aggs<'de, D>(deserializer: D) -> std::result::Result<Vec<AggSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Keyed {
        func: AggFunc,
        #[serde(default)]
        alias: Option<String>,
    }

    struct AggsVisitor;

    impl<'de> Visitor<'de> for AggsVisitor {
        type Value = Vec<AggSpec>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a list of {column, func, alias?} or a mapping of column to {func, alias?}")
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
            let mut aggs = Vec::new();
            while let Some(agg) = seq.next_element::<AggSpec>()? {
                aggs.push(agg);
            }
            Ok(aggs)
        }

        fn visit_map<A: MapAccess<'de>>(self, map: A) -> std::result::Result<Self::Value, A::Error> {
            let entries = OrderedMap::<Keyed>(PhantomData).visit_map(map)?;
            Ok(entries
                .into_iter()
                .map(|(column, keyed)| AggSpec {
                    column,
                    func: keyed.func,
                    alias: keyed.alias,
                })
                .collect())
        }
    }

    deserializer.deserialize_any(AggsVisitor)
}

fn de_scalar_list<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Bool(bool),
        Int(i64),
        Float(f64),
        Text(String),
    }

    let values = Option::<Vec<Scalar>>::deserialize(deserializer)?;
    Ok(values.map(|values| {
        values
            .into_iter()
            .map(|value| match value {
                Scalar::Bool(b) => b.to_string(),
                Scalar::Int(i) => i.to_string(),
                Scalar::Float(x) => x.to_string(),
                Scalar::Text(s) => s,
            })
            .collect()
    }))
}
