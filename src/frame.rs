//! Polars frames as the steps see them.
//!
//! Every chunk that flows between steps is a polars [`DataFrame`] whose
//! columns have one of four logical types ([`DataType`]): `Int64`,
//! `Float64`, `String` and `Boolean`. Sources pass every frame through
//! [`conform`] so that steps can rely on those exact polars types.
//!
//! Steps that carry state across chunks (seen-sets, group maps, fit
//! statistics) read cells with [`keys`], [`numbers`] and [`labels`].

pub mod key;
pub mod schema;

pub use key::KeyValue;
pub use schema::{DataType, Field, Schema};

use crate::error::{PrepError, Result};
use polars::prelude::{Column, DataFrame, Float64Chunked, NamedFrom as _, StringChunked};

/// Logical schema of `df`.
pub fn schema_of(df: &DataFrame) -> Schema {
    Schema::of_polars(df.schema())
}

/// Zero-row frame with the columns of `schema`.
pub fn empty(schema: &Schema) -> DataFrame {
    DataFrame::empty_with_schema(&schema.to_polars())
}

/// Frame built from `columns`, keeping the row count of `like` even when
/// no column is left.
///
/// # Errors
///
/// Returns `DataProcessing` if the columns differ in length.
pub fn with_columns(like: &DataFrame, columns: Vec<Column>) -> Result<DataFrame> {
    if columns.is_empty() {
        return Ok(like.select(std::iter::empty::<&str>())?);
    }
    Ok(DataFrame::new(columns)?)
}

/// Reshape `df` to `schema`: columns are taken by name, in schema order,
/// and cast to the schema's types. `origin` names the data in errors.
///
/// # Errors
///
/// Returns `Schema` if a column is missing and `DataProcessing` if a value
/// cannot be stored in its declared type, such as text in an `int64`
/// column or `3.7` read as an integer.
pub fn conform(df: &DataFrame, schema: &Schema, origin: &str) -> Result<DataFrame> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| {
            let column = df.column(&field.name).map_err(|_| {
                PrepError::schema(origin, format!("column '{}' not present", field.name))
            })?;
            conform_column(column, field.dtype).map_err(|reason| {
                PrepError::DataProcessing(format!(
                    "{origin}: column '{}' cannot be read as {}: {reason}",
                    field.name, field.dtype
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    with_columns(df, columns)
}

fn conform_column(column: &Column, dtype: DataType) -> std::result::Result<Column, String> {
    let target = dtype.to_polars();
    if column.dtype() == &target {
        return Ok(column.clone());
    }
    if dtype == DataType::Int64 && column.dtype().is_float() {
        let floats = column
            .cast(&polars::prelude::DataType::Float64)
            .map_err(|e| e.to_string())?;
        let fractional = floats
            .f64()
            .map_err(|e| e.to_string())?
            .into_iter()
            .flatten()
            .find(|v| v.fract() != 0.0);
        if let Some(value) = fractional {
            return Err(format!("{value} is not a whole number"));
        }
    }
    column.strict_cast(&target).map_err(|e| e.to_string())
}

fn cast_to(column: &Column, dtype: DataType) -> Result<Column> {
    let target = dtype.to_polars();
    if column.dtype() == &target {
        Ok(column.clone())
    } else {
        Ok(column.cast(&target)?)
    }
}

/// Hashable cell values of `column`, one per row.
///
/// # Errors
///
/// Returns `DataProcessing` if polars cannot read the column.
pub fn keys(column: &Column) -> Result<Vec<KeyValue>> {
    let dtype = DataType::of_polars(column.dtype());
    let column = cast_to(column, dtype)?;
    let keys = match dtype {
        DataType::Int64 => column
            .i64()?
            .into_iter()
            .map(|v| v.map_or(KeyValue::Null, KeyValue::Int64))
            .collect(),
        DataType::Float64 => column
            .f64()?
            .into_iter()
            .map(|v| v.map_or(KeyValue::Null, KeyValue::from_f64))
            .collect(),
        DataType::Utf8 => column
            .str()?
            .into_iter()
            .map(|v| v.map_or(KeyValue::Null, |s| KeyValue::Utf8(s.to_owned())))
            .collect(),
        DataType::Bool => column
            .bool()?
            .into_iter()
            .map(|v| v.map_or(KeyValue::Null, KeyValue::Bool))
            .collect(),
    };
    Ok(keys)
}

/// `column` as floats. Only meaningful for numeric columns.
///
/// # Errors
///
/// Returns `DataProcessing` if the column cannot be cast.
pub fn numbers(column: &Column) -> Result<Float64Chunked> {
    let cast = cast_to(column, DataType::Float64)?;
    Ok(cast.f64()?.clone())
}

/// `column` in its string form: `3`, `2.5`, `true`.
///
/// # Errors
///
/// Returns `DataProcessing` if the column cannot be cast.
pub fn labels(column: &Column) -> Result<StringChunked> {
    let cast = cast_to(column, DataType::Utf8)?;
    Ok(cast.str()?.clone())
}

/// Column of `dtype` holding `values`. Integer keys widen into float columns.
///
/// # Errors
///
/// Returns `DataProcessing` if a value does not fit `dtype`.
pub fn column_from_keys(name: &str, dtype: DataType, values: &[KeyValue]) -> Result<Column> {
    let mismatch = |value: &KeyValue| {
        PrepError::DataProcessing(format!("cannot store '{value}' in {dtype} column '{name}'"))
    };
    let column = match dtype {
        DataType::Int64 => {
            let cells = values
                .iter()
                .map(|value| match value {
                    KeyValue::Null => Ok(None),
                    KeyValue::Int64(v) => Ok(Some(*v)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?;
            Column::new(name.into(), cells)
        }
        DataType::Float64 => {
            let cells = values
                .iter()
                .map(|value| match value {
                    KeyValue::Null => Ok(None),
                    other => other.as_f64().map(Some).ok_or_else(|| mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?;
            Column::new(name.into(), cells)
        }
        DataType::Utf8 => {
            let cells = values
                .iter()
                .map(|value| match value {
                    KeyValue::Null => Ok(None),
                    KeyValue::Utf8(v) => Ok(Some(v.as_str())),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?;
            Column::new(name.into(), cells)
        }
        DataType::Bool => {
            let cells = values
                .iter()
                .map(|value| match value {
                    KeyValue::Null => Ok(None),
                    KeyValue::Bool(v) => Ok(Some(*v)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?;
            Column::new(name.into(), cells)
        }
    };
    Ok(column)
}
