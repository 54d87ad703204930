//! Logical column types and schemas, as declared in pipeline files and
//! tracked by the planner.

use polars::prelude as pl;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Element type of a column. Every cell is nullable regardless of type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[serde(alias = "int", alias = "integer", alias = "i64")]
    Int64,
    #[serde(alias = "float", alias = "double", alias = "f64")]
    Float64,
    #[serde(alias = "string", alias = "str", alias = "text")]
    Utf8,
    #[serde(alias = "boolean")]
    Bool,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int64 | Self::Float64)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Utf8 => "utf8",
            Self::Bool => "bool",
        }
    }

    /// Polars type a column of this type is stored as.
    pub fn to_polars(self) -> pl::DataType {
        match self {
            Self::Int64 => pl::DataType::Int64,
            Self::Float64 => pl::DataType::Float64,
            Self::Utf8 => pl::DataType::String,
            Self::Bool => pl::DataType::Boolean,
        }
    }

    /// Logical type of a polars column. Integers of any width read as
    /// `Int64` and floats as `Float64`; strings, dates and anything else
    /// are read through their string form.
    pub fn of_polars(dtype: &pl::DataType) -> Self {
        if dtype.is_bool() {
            Self::Bool
        } else if dtype.is_integer() {
            Self::Int64
        } else if dtype.is_float() {
            Self::Float64
        } else {
            Self::Utf8
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "int64" | "int" | "integer" | "i64" => Ok(Self::Int64),
            "float64" | "float" | "double" | "f64" => Ok(Self::Float64),
            "utf8" | "string" | "str" | "text" => Ok(Self::Utf8),
            "bool" | "boolean" => Ok(Self::Bool),
            other => Err(format!("unknown column type '{other}'")),
        }
    }
}

/// Named, typed column slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub dtype: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// Ordered list of fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Logical schema of a polars schema.
    pub fn of_polars(schema: &pl::Schema) -> Self {
        Self::new(
            schema
                .iter()
                .map(|(name, dtype)| Field::new(name.as_str(), DataType::of_polars(dtype)))
                .collect(),
        )
    }

    pub fn to_polars(&self) -> pl::Schema {
        self.fields
            .iter()
            .map(|f| pl::Field::new(f.name.as_str().into(), f.dtype.to_polars()))
            .collect()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|field| format!("{}: {}", field.name, field.dtype))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}
