//! Row-level data checks.
//!
//! Checks are compiled once when the plan is built and evaluated column by
//! column over each chunk. Within one column entry they run in the order
//! `not_null`, `unique`, `range`, `regex`, `enum`, and entries run in
//! declaration order; a row that violates several checks is attributed to the
//! first one that fails.
//!
//! Nulls violate `not_null` and `range` and pass every other check.
//! Uniqueness is tracked across the whole run, not per chunk.

use super::{Emit, PassMode, StepKernel};
use crate::error::{PrepError, Result};
use crate::io::FileRef;
use crate::pipeline::spec::{ValidateStep, ValidationMode};
use crate::frame::{self, KeyValue};
use polars::prelude::{BooleanChunked, Column, DataFrame, NamedFrom as _};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;

/// Name of the column added to quarantine rows holding the violated column.
pub const VIOLATION_COLUMN: &str = "_violation_column";
/// Name of the column added to quarantine rows holding the violated check id.
pub const VIOLATION_CHECK: &str = "_violation_check";

#[derive(Debug, Clone)]
enum Rule {
    NotNull,
    Unique,
    Range { min: f64, max: f64 },
    Pattern(Regex),
    OneOf(HashSet<String>),
}

impl Rule {
    fn kind(&self) -> &'static str {
        match self {
            Self::NotNull => "not_null",
            Self::Unique => "unique",
            Self::Range { .. } => "range",
            Self::Pattern(_) => "regex",
            Self::OneOf(_) => "enum",
        }
    }
}

/// One compiled check on one column.
#[derive(Debug, Clone)]
struct CompiledCheck {
    /// `{column}:{kind}`.
    id: String,
    column: String,
    rule: Rule,
}

impl CompiledCheck {
    fn new(column: &str, rule: Rule) -> Self {
        Self {
            id: format!("{column}:{}", rule.kind()),
            column: column.to_owned(),
            rule,
        }
    }

    /// Violation flag for every row of `column`, in row order. Unique checks
    /// record each non-null value in `seen`.
    fn violations(&self, column: &Column, seen: &mut HashSet<KeyValue>) -> Result<Vec<bool>> {
        let flags = match &self.rule {
            Rule::NotNull => column
                .is_null()
                .into_iter()
                .map(|null| null.unwrap_or(false))
                .collect(),
            Rule::Unique => frame::keys(column)?
                .into_iter()
                .map(|key| !key.is_null() && !seen.insert(key))
                .collect(),
            Rule::Range { min, max } => frame::numbers(column)?
                .into_iter()
                .map(|v| v.is_none_or(|v| v.is_nan() || v < *min || v > *max))
                .collect(),
            Rule::Pattern(re) => frame::labels(column)?
                .into_iter()
                .map(|v| v.is_some_and(|text| !re.is_match(text)))
                .collect(),
            Rule::OneOf(allowed) => frame::labels(column)?
                .into_iter()
                .map(|v| v.is_some_and(|text| !allowed.contains(text)))
                .collect(),
        };
        Ok(flags)
    }

    /// Describes the violation at `row`.
    fn describe(&self, column: &Column, row: usize) -> Result<String> {
        let labels = frame::labels(column)?;
        let Some(text) = labels.get(row) else {
            return Ok("value is null".to_owned());
        };
        Ok(match &self.rule {
            Rule::NotNull => "value is null".to_owned(),
            Rule::Unique => format!("duplicate value '{text}'"),
            Rule::Range { min, max } => format!("value {text} outside [{min}, {max}]"),
            Rule::Pattern(re) => format!("value '{text}' does not match /{}/", re.as_str()),
            Rule::OneOf(_) => format!("value '{text}' not in allowed set"),
        })
    }
}

/// Count of violations of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckViolations {
    pub check: String,
    pub count: u64,
}

/// What a validate step observed during one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub mode: ValidationMode,
    pub rows_checked: u64,
    pub quarantined: u64,
    /// Checks with at least one violation, in declaration order.
    pub violations: Vec<CheckViolations>,
}

/// Compiled validate step.
#[derive(Debug, Clone)]
pub struct ValidateKernel {
    label: String,
    mode: ValidationMode,
    checks: Vec<CompiledCheck>,
    quarantine: Option<FileRef>,
}

impl ValidateKernel {
    /// Compile the checks of `step`. `quarantine` is the resolved quarantine
    /// target and is only used in quarantine mode.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an entry without checks, an inverted range, or an
    /// invalid regular expression. `field_prefix` locates the step in the file.
    pub fn compile(
        label: impl Into<String>,
        field_prefix: &str,
        step: &ValidateStep,
        quarantine: Option<FileRef>,
    ) -> Result<Self> {
        let mut checks = Vec::new();
        for (i, entry) in step.checks.iter().enumerate() {
            let field = format!("{field_prefix}.checks[{i}]");
            if !entry.has_any_check() {
                return Err(PrepError::config(
                    field,
                    format!("no checks declared for column '{}'", entry.name),
                ));
            }
            if entry.not_null {
                checks.push(CompiledCheck::new(&entry.name, Rule::NotNull));
            }
            if entry.unique {
                checks.push(CompiledCheck::new(&entry.name, Rule::Unique));
            }
            if let Some([min, max]) = entry.range {
                if min > max || min.is_nan() || max.is_nan() {
                    return Err(PrepError::config(
                        format!("{field}.range"),
                        format!("invalid range [{min}, {max}]"),
                    ));
                }
                checks.push(CompiledCheck::new(&entry.name, Rule::Range { min, max }));
            }
            if let Some(pattern) = &entry.regex {
                let re = Regex::new(pattern).map_err(|e| {
                    PrepError::config(format!("{field}.regex"), format!("invalid pattern: {e}"))
                })?;
                checks.push(CompiledCheck::new(&entry.name, Rule::Pattern(re)));
            }
            if let Some(allowed) = &entry.allowed {
                checks.push(CompiledCheck::new(
                    &entry.name,
                    Rule::OneOf(allowed.iter().cloned().collect()),
                ));
            }
        }
        Ok(Self {
            label: label.into(),
            mode: step.mode,
            checks,
            quarantine: if step.mode == ValidationMode::Quarantine {
                quarantine
            } else {
                None
            },
        })
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    pub fn quarantine_target(&self) -> Option<&FileRef> {
        self.quarantine.as_ref()
    }

    /// Columns referenced by the checks, in check order (may repeat).
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.checks.iter().map(|c| c.column.as_str())
    }

    /// Columns whose checks need a numeric type.
    pub fn numeric_columns(&self) -> impl Iterator<Item = &str> {
        self.checks
            .iter()
            .filter(|c| matches!(c.rule, Rule::Range { .. }))
            .map(|c| c.column.as_str())
    }

    fn column<'a>(&self, chunk: &'a DataFrame, name: &str) -> Result<&'a Column> {
        chunk.column(name).map_err(|_| {
            PrepError::schema(&self.label, format!("column '{name}' not present in input"))
        })
    }

    /// Rows selected by `rejected`, tagged with the column and id of the
    /// check each one failed.
    fn quarantine_rows(
        &self,
        chunk: &DataFrame,
        rejected: &BooleanChunked,
        failures: &[Option<usize>],
    ) -> Result<DataFrame> {
        let mut rows = chunk.filter(rejected)?;
        let failed: Vec<&CompiledCheck> = failures
            .iter()
            .flatten()
            .filter_map(|&i| self.checks.get(i))
            .collect();
        let columns: Vec<&str> = failed.iter().map(|c| c.column.as_str()).collect();
        let ids: Vec<&str> = failed.iter().map(|c| c.id.as_str()).collect();
        rows.with_column(Column::new(VIOLATION_COLUMN.into(), columns))?;
        rows.with_column(Column::new(VIOLATION_CHECK.into(), ids))?;
        Ok(rows)
    }
}

/// Per-pass state of a validate step.
#[derive(Debug)]
pub struct ValidateState {
    mode: PassMode,
    /// Seen keys per check; only filled for unique checks.
    seen: Vec<HashSet<KeyValue>>,
    counts: Vec<u64>,
    rows_checked: u64,
    quarantined: u64,
    check_ids: Vec<String>,
    validation_mode: ValidationMode,
}

impl ValidateState {
    pub fn summary(&self) -> ValidationSummary {
        ValidationSummary {
            mode: self.validation_mode,
            rows_checked: self.rows_checked,
            quarantined: self.quarantined,
            violations: self
                .check_ids
                .iter()
                .zip(&self.counts)
                .filter(|(_, count)| **count > 0)
                .map(|(check, count)| CheckViolations {
                    check: check.clone(),
                    count: *count,
                })
                .collect(),
        }
    }
}

impl StepKernel for ValidateKernel {
    type State = ValidateState;

    fn init(&self, mode: PassMode) -> Self::State {
        ValidateState {
            mode,
            seen: vec![HashSet::new(); self.checks.len()],
            counts: vec![0; self.checks.len()],
            rows_checked: 0,
            quarantined: 0,
            check_ids: self.checks.iter().map(|c| c.id.clone()).collect(),
            validation_mode: self.mode,
        }
    }

    fn push(&self, state: &mut Self::State, chunk: DataFrame) -> Result<Emit> {
        let rows = chunk.height();
        // Index of the first check each row fails.
        let mut failures: Vec<Option<usize>> = vec![None; rows];
        for (i, check) in self.checks.iter().enumerate() {
            let column = self.column(&chunk, &check.column)?;
            let Some(seen) = state.seen.get_mut(i) else {
                continue;
            };
            let flags = check.violations(column, seen)?;
            for (failure, _) in failures.iter_mut().zip(flags).filter(|(_, flagged)| *flagged) {
                failure.get_or_insert(i);
                if let Some(count) = state.counts.get_mut(i) {
                    *count += 1;
                }
            }
        }

        if self.mode == ValidationMode::Strict {
            let first = failures
                .iter()
                .enumerate()
                .find_map(|(row, failure)| failure.map(|i| (row, i)));
            if let Some((row, check)) = first.and_then(|(row, i)| Some((row, self.checks.get(i)?))) {
                let message = check.describe(self.column(&chunk, &check.column)?, row)?;
                let at = state.rows_checked + row as u64 + 1;
                return Err(PrepError::validation(&check.id, at, message));
            }
        }
        state.rows_checked += rows as u64;

        if self.mode != ValidationMode::Quarantine {
            return Ok(Emit::output(chunk));
        }
        let rejected_count = failures.iter().flatten().count();
        state.quarantined += rejected_count as u64;
        let rejected: BooleanChunked = failures.iter().map(Option::is_some).collect();
        let quarantine = match state.mode {
            PassMode::Output => Some(self.quarantine_rows(&chunk, &rejected, &failures)?),
            PassMode::FitOnly => None,
        };
        let output = if rejected_count == 0 {
            chunk
        } else {
            chunk.filter(&!&rejected)?
        };
        Ok(Emit {
            output: Some(output),
            quarantine,
        })
    }

    fn finish(&self, state: &mut Self::State) -> Result<Emit> {
        if state.mode == PassMode::FitOnly {
            return Ok(Emit::default());
        }
        let summary = state.summary();
        match self.mode {
            ValidationMode::Warn => {
                for v in &summary.violations {
                    tracing::warn!("{}: check '{}' failed on {} row(s)", self.label, v.check, v.count);
                }
            }
            ValidationMode::Quarantine if summary.quarantined > 0 => {
                tracing::info!(
                    "{}: quarantined {} of {} row(s)",
                    self.label,
                    summary.quarantined,
                    summary.rows_checked
                );
            }
            ValidationMode::Quarantine | ValidationMode::Strict => {}
        }
        Ok(Emit::default())
    }
}
