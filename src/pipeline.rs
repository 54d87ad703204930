//! Pipeline descriptions, planning and execution.
//!
//! A pipeline is a YAML file naming its inputs, an ordered list of steps and
//! its outputs:
//!
//! ```yaml
//! name: customer_features
//! inputs:
//!   - path: data/customers.csv
//! steps:
//!   - type: select
//!     columns: [id, email, age, country, spend]
//!   - type: validate
//!     mode: quarantine
//!     checks:
//!       - { column: email, not_null: true, unique: true }
//!       - { column: age, range: [0, 120] }
//!   - type: features
//!     state_path: state/customer_features.json
//!     config:
//!       - { column: spend, transform: standard_scale }
//!       - { column: country, transform: one_hot }
//! outputs:
//!   - path: out/customers.parquet
//! runtime:
//!   streaming: true
//!   memory_limit: 512MB
//! ```
//!
//! Running one goes through three stages:
//!
//! 1. [`spec`]: parse the YAML, substituting `${VAR}` from the environment.
//! 2. [`planner`]: resolve formats, check every column reference against the
//!    schema as it evolves step by step, and build the step kernels.
//! 3. [`executor`]: push the input through the kernels, either as one frame
//!    or in bounded chunks, writing outputs and quarantine files.
//!
//! Both strategies produce the same rows; streaming only bounds memory.
//!
//! ```no_run
//! use mlprep::pipeline::{self, RunOptions};
//!
//! let options = RunOptions { streaming: true, memory_limit: Some("1GB".into()) };
//! let report = pipeline::run("pipelines/customers.yaml", &options)?;
//! println!("{}", report.summary());
//! # Ok::<(), mlprep::error::PrepError>(())
//! ```

pub mod executor;
pub mod planner;
pub mod runtime;
pub mod spec;

pub use executor::{OutputRole, RunReport, StepReport, WrittenFile, execute, execute_with};
pub use planner::{ExecutionPlan, PlanSchema, plan, plan_with_schema};
pub use runtime::{ResolvedRuntime, RunOptions, Strategy};
pub use spec::Pipeline;

use crate::error::Result;
use crate::integrity;
use std::path::Path;

/// Load, plan and execute the pipeline at `pipeline_path`.
///
/// Writes a lineage record afterwards when the pipeline sets
/// `runtime.lineage_path`.
///
/// # Errors
///
/// `Config`, `Schema`, `Validation` or `Io`, see [`PrepError`](crate::error::PrepError).
/// No output file is left behind on failure.
pub fn run(pipeline_path: impl AsRef<Path>, options: &RunOptions) -> Result<RunReport> {
    let pipeline = Pipeline::from_file(pipeline_path.as_ref())?;
    let plan = plan(&pipeline, options)?;
    let mut report = execute(&plan)?;
    if let Some(path) = &plan.runtime.lineage_path {
        let record = integrity::create_record(&plan, &report)?;
        integrity::save_record(&record, path)?;
        report.lineage_path = Some(path.clone());
    }
    Ok(report)
}

/// Load and plan the pipeline at `pipeline_path` without reading any rows.
///
/// # Errors
///
/// Same as [`run`], minus failures that need data to surface.
pub fn check(pipeline_path: impl AsRef<Path>) -> Result<ExecutionPlan> {
    let pipeline = Pipeline::from_file(pipeline_path.as_ref())?;
    let plan = plan(&pipeline, &RunOptions::default())?;
    tracing::info!(
        "Pipeline '{}' is valid: {} input(s), {} step(s), {} output(s)",
        plan.name,
        plan.inputs.len(),
        plan.steps.len(),
        plan.outputs.len()
    );
    Ok(plan)
}
