//! Pipeline execution engine.
//!
//! Runs an [`ExecutionPlan`] against a source and a set of sinks and produces
//! a [`RunReport`]. Both strategies share one pass driver: the materialized
//! strategy opens the source as a single chunk, the streaming strategy opens
//! it with the planned chunk size.
//!
//! A features step that still has to fit is handled per strategy:
//!
//! - materialized: the step buffers its single input chunk, fits and emits at
//!   end of input;
//! - streaming: before the output pass, a fit-only pre-pass reopens the source,
//!   runs the steps in front of the features step and fits on what reaches it.
//!   The step then applies the fitted parameters chunk by chunk.
//!
//! Outputs, quarantine files and state files only become visible once the
//! whole run has succeeded. State files are staged before the outputs are
//! finalized and committed after them, so a run whose outputs fail to land
//! never leaves new feature state behind.

use super::planner::ExecutionPlan;
use super::runtime::Strategy;
use crate::error::Result;
use crate::io::{FileInputs, FileRef, FileSinks, SinkFactory, SourceFactory, TableSink};
use crate::state::FeatureState;
use crate::steps::validate::CheckViolations;
use crate::steps::{Emit, FeatureFitter, FeaturesKernel, Kernel, PassMode, PlannedStep, StepState};
use chrono::{DateTime, Utc};
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Per-step statistics of the output pass.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// 1-based position in the pipeline.
    pub position: usize,
    pub kind: &'static str,
    pub rows_in: u64,
    pub rows_out: u64,
    pub quarantined: u64,
    /// Violated checks of a validate step, with counts.
    pub violations: Vec<CheckViolations>,
    pub elapsed: Duration,
}

/// What a written file is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputRole {
    Output,
    Quarantine,
}

/// A file the run wrote.
#[derive(Debug, Clone, Serialize)]
pub struct WrittenFile {
    #[serde(flatten)]
    pub file: FileRef,
    pub role: OutputRole,
    pub rows: u64,
}

/// Report generated after pipeline execution.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub pipeline: String,
    pub strategy: Strategy,
    /// Rows per chunk; `None` when the input was read at once.
    pub chunk_rows: Option<usize>,
    /// Chunks pulled from the source by the output pass.
    pub chunks_read: u64,
    pub rows_read: u64,
    /// Rows written to each output.
    pub rows_written: u64,
    pub steps: Vec<StepReport>,
    pub outputs: Vec<WrittenFile>,
    /// State files saved after a fit.
    pub state_files: Vec<PathBuf>,
    pub lineage_path: Option<PathBuf>,
    pub duration: Duration,
}

impl RunReport {
    pub fn quarantined(&self) -> u64 {
        self.steps.iter().map(|s| s.quarantined).sum()
    }

    /// Create a summary message.
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "Pipeline '{}' completed ({}): {} rows read, {} rows written, {} steps, {:.2}s",
            self.pipeline,
            self.strategy,
            self.rows_read,
            self.rows_written,
            self.steps.len(),
            self.duration.as_secs_f64()
        );
        let quarantined = self.quarantined();
        if quarantined > 0 {
            summary.push_str(&format!(", {quarantined} rows quarantined"));
        }
        for step in self.steps.iter().filter(|s| !s.violations.is_empty()) {
            let checks: Vec<String> = step
                .violations
                .iter()
                .map(|v| format!("{} x{}", v.check, v.count))
                .collect();
            summary.push_str(&format!(
                "\n  step {} ({}): {}",
                step.position,
                step.kind,
                checks.join(", ")
            ));
        }
        summary
    }
}

/// Run `plan` on its input files, writing its output files.
///
/// # Errors
///
/// Any error raised by reading, a step, or writing. Nothing is left at the
/// output paths on failure.
pub fn execute(plan: &ExecutionPlan) -> Result<RunReport> {
    let source = FileInputs::new(plan.inputs.clone(), plan.input_schema.clone());
    execute_with(plan, &source, &FileSinks)
}

/// Run `plan` on an arbitrary source and sink factory.
///
/// # Errors
///
/// Same as [`execute`].
pub fn execute_with(
    plan: &ExecutionPlan,
    source: &dyn SourceFactory,
    sinks: &dyn SinkFactory,
) -> Result<RunReport> {
    let start = Instant::now();
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let runtime = &plan.runtime;
    tracing::info!(
        "Running pipeline '{}' ({}, run {run_id}){}",
        plan.name,
        runtime.strategy,
        runtime
            .chunk_rows
            .map(|rows| format!(", {rows} rows per chunk"))
            .unwrap_or_default()
    );

    let mut steps = plan.steps.clone();
    let mut fitted: Vec<(usize, FeatureState)> = Vec::new();
    if runtime.strategy == Strategy::Streaming {
        for i in 0..steps.len() {
            let Some(kernel) = steps.get(i).and_then(PlannedStep::pending_fit) else {
                continue;
            };
            let upstream = steps.get(..i).unwrap_or_default();
            let state = fit_prepass(source, runtime.chunk_rows, upstream, kernel)?;
            let applying = kernel.with_fitted(&state)?;
            if let Some(step) = steps.get_mut(i) {
                step.kernel = Kernel::Features(applying);
            }
            fitted.push((i, state));
        }
    }

    let mut writer = OutputWriter::open(plan, sinks)?;
    let mut pass = Pass::new(&steps, PassMode::Output);
    let mut chunks = source.open(runtime.chunk_rows)?;
    let (mut chunks_read, mut rows_read) = (0_u64, 0_u64);
    while let Some(chunk) = chunks.next_chunk()? {
        chunks_read += 1;
        rows_read += chunk.height() as u64;
        tracing::debug!("Chunk {chunks_read}: {} rows", chunk.height());
        pass.feed(0, chunk, &mut writer)?;
    }
    pass.finish(&mut writer)?;

    for (i, state) in pass.states.iter_mut().enumerate() {
        if let Some(state) = state.take_fitted() {
            fitted.push((i, state));
        }
    }
    let staged_states = fitted
        .iter()
        .filter_map(|(i, state)| {
            let path = steps.get(*i).and_then(PlannedStep::persist_target)?;
            Some(state.stage(path))
        })
        .collect::<Result<Vec<_>>>()?;

    let step_reports = pass.reports();
    let outputs = writer.finish()?;
    let mut state_files = Vec::with_capacity(staged_states.len());
    for staged in staged_states {
        let path = staged.target().to_path_buf();
        staged.commit()?;
        tracing::info!("Saved feature state to {}", path.display());
        state_files.push(path);
    }
    let report = RunReport {
        run_id,
        started_at,
        pipeline: plan.name.clone(),
        strategy: runtime.strategy,
        chunk_rows: runtime.chunk_rows,
        chunks_read,
        rows_read,
        rows_written: outputs
            .iter()
            .find(|o| o.role == OutputRole::Output)
            .map_or(0, |o| o.rows),
        steps: step_reports,
        outputs,
        state_files,
        lineage_path: None,
        duration: start.elapsed(),
    };
    tracing::info!("{}", report.summary());
    Ok(report)
}

/// Fit `kernel` on everything `upstream` lets through.
fn fit_prepass(
    source: &dyn SourceFactory,
    chunk_rows: Option<usize>,
    upstream: &[PlannedStep],
    kernel: &FeaturesKernel,
) -> Result<FeatureState> {
    let started = Instant::now();
    let mut fitter = FitListener(kernel.fitter());
    let mut pass = Pass::new(upstream, PassMode::FitOnly);
    let mut chunks = source.open(chunk_rows)?;
    while let Some(chunk) = chunks.next_chunk()? {
        pass.feed(0, chunk, &mut fitter)?;
    }
    pass.finish(&mut fitter)?;
    let state = fitter.0.finish();
    tracing::info!(
        "Fit pre-pass: {} transform(s) on {} row(s) in {:.2}s",
        state.entries.len(),
        state.rows_fitted,
        started.elapsed().as_secs_f64()
    );
    Ok(state)
}

/// Receives what falls out of the end of a pass.
trait PassListener {
    /// Rows that passed every step.
    fn output(&mut self, df: DataFrame) -> Result<()>;

    /// Rows a step at `index` diverted to quarantine.
    fn quarantine(&mut self, index: usize, df: DataFrame) -> Result<()>;
}

struct FitListener(FeatureFitter);

impl PassListener for FitListener {
    fn output(&mut self, df: DataFrame) -> Result<()> {
        self.0.observe(&df)
    }

    fn quarantine(&mut self, _index: usize, _df: DataFrame) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StepStats {
    rows_in: u64,
    rows_out: u64,
    quarantined: u64,
    elapsed: Duration,
}

/// One pass of chunks through a run of steps.
struct Pass<'a> {
    steps: &'a [PlannedStep],
    states: Vec<StepState>,
    stats: Vec<StepStats>,
}

impl<'a> Pass<'a> {
    fn new(steps: &'a [PlannedStep], mode: PassMode) -> Self {
        Self {
            steps,
            states: steps.iter().map(|s| s.init(mode)).collect(),
            stats: steps.iter().map(|_| StepStats::default()).collect(),
        }
    }

    /// Push `chunk` into the step at `index` and everything downstream of it.
    fn feed(&mut self, index: usize, chunk: DataFrame, listener: &mut dyn PassListener) -> Result<()> {
        let (Some(step), Some(state)) = (self.steps.get(index), self.states.get_mut(index)) else {
            return listener.output(chunk);
        };
        let rows = chunk.height() as u64;
        let started = Instant::now();
        let emit = step.push(state, chunk)?;
        if let Some(stats) = self.stats.get_mut(index) {
            stats.rows_in += rows;
            stats.elapsed += started.elapsed();
        }
        self.forward(index, emit, listener)
    }

    /// Signal end of input to every step, upstream first.
    fn finish(&mut self, listener: &mut dyn PassListener) -> Result<()> {
        for index in 0..self.steps.len() {
            let (Some(step), Some(state)) = (self.steps.get(index), self.states.get_mut(index))
            else {
                continue;
            };
            let started = Instant::now();
            let emit = step.finish(state)?;
            if let Some(stats) = self.stats.get_mut(index) {
                stats.elapsed += started.elapsed();
            }
            self.forward(index, emit, listener)?;
        }
        Ok(())
    }

    fn forward(&mut self, index: usize, emit: Emit, listener: &mut dyn PassListener) -> Result<()> {
        if let Some(quarantine) = emit.quarantine {
            if let Some(stats) = self.stats.get_mut(index) {
                stats.quarantined += quarantine.height() as u64;
            }
            listener.quarantine(index, quarantine)?;
        }
        if let Some(output) = emit.output {
            if let Some(stats) = self.stats.get_mut(index) {
                stats.rows_out += output.height() as u64;
            }
            self.feed(index + 1, output, listener)?;
        }
        Ok(())
    }

    fn reports(&self) -> Vec<StepReport> {
        self.steps
            .iter()
            .zip(&self.stats)
            .zip(&self.states)
            .map(|((step, stats), state)| StepReport {
                position: step.position,
                kind: step.kind(),
                rows_in: stats.rows_in,
                rows_out: stats.rows_out,
                quarantined: stats.quarantined,
                violations: state
                    .validation_summary()
                    .map(|s| s.violations)
                    .unwrap_or_default(),
                elapsed: stats.elapsed,
            })
            .collect()
    }
}

/// An open sink plus what has gone into it.
struct OpenSink {
    target: FileRef,
    role: OutputRole,
    sink: Box<dyn TableSink>,
    rows: u64,
    /// Set once the first frame, which fixes the sink's schema, is written.
    started: bool,
}

impl OpenSink {
    fn write(&mut self, df: &DataFrame) -> Result<()> {
        if df.height() == 0 && self.started {
            return Ok(());
        }
        self.sink.write(df)?;
        self.rows += df.height() as u64;
        self.started = true;
        Ok(())
    }
}

/// Routes pass results to the output and quarantine sinks.
struct OutputWriter {
    outputs: Vec<OpenSink>,
    /// Quarantine sinks keyed by step index.
    quarantine: Vec<(usize, OpenSink)>,
}

impl OutputWriter {
    fn open(plan: &ExecutionPlan, sinks: &dyn SinkFactory) -> Result<Self> {
        let open = |target: &FileRef, role| -> Result<OpenSink> {
            Ok(OpenSink {
                target: target.clone(),
                role,
                sink: sinks.create(target)?,
                rows: 0,
                started: false,
            })
        };
        let outputs = plan
            .outputs
            .iter()
            .map(|target| open(target, OutputRole::Output))
            .collect::<Result<_>>()?;
        let quarantine = plan
            .steps
            .iter()
            .enumerate()
            .filter_map(|(i, step)| step.quarantine_target().map(|t| (i, t)))
            .map(|(i, target)| -> Result<(usize, OpenSink)> {
                Ok((i, open(target, OutputRole::Quarantine)?))
            })
            .collect::<Result<_>>()?;
        Ok(Self { outputs, quarantine })
    }

    fn finish(self) -> Result<Vec<WrittenFile>> {
        let mut written = Vec::with_capacity(self.outputs.len() + self.quarantine.len());
        for sink in self
            .outputs
            .into_iter()
            .chain(self.quarantine.into_iter().map(|(_, sink)| sink))
        {
            let OpenSink {
                target,
                role,
                sink,
                rows,
                ..
            } = sink;
            sink.finish()?;
            tracing::info!("Wrote {rows} row(s) to {target}");
            written.push(WrittenFile {
                file: target,
                role,
                rows,
            });
        }
        Ok(written)
    }
}

impl PassListener for OutputWriter {
    fn output(&mut self, df: DataFrame) -> Result<()> {
        for sink in &mut self.outputs {
            sink.write(&df)?;
        }
        Ok(())
    }

    fn quarantine(&mut self, index: usize, df: DataFrame) -> Result<()> {
        if let Some((_, sink)) = self.quarantine.iter_mut().find(|(i, _)| *i == index) {
            sink.write(&df)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, PrepError};
    use crate::io::{MemoryInput, MemorySinks};
    use crate::pipeline::planner::plan_with_schema;
    use crate::pipeline::runtime::RunOptions;
    use crate::pipeline::spec::Pipeline;
    use crate::steps::test_support::{f64s, i64s, texts};
    use polars::prelude::df;

    fn users() -> DataFrame {
        df!(
            "id" => (1..=6).collect::<Vec<i64>>(),
            "email" => [
                "a@x.io",
                "duplicate@example.com",
                "b@x.io",
                "duplicate@example.com",
                "c@x.io",
                "d@x.io",
            ],
            "age" => [30.0, 41.0, -5.0, 22.0, 150.0, 64.0],
            "segment" => ["A", "B", "A", "B", "A", "B"]
        )
        .unwrap()
    }

    fn run_into(yaml: &str, options: &RunOptions, sinks: &dyn SinkFactory) -> Result<RunReport> {
        let pipeline = Pipeline::from_yaml_str(yaml).unwrap();
        let input = MemoryInput::new(users());
        let plan = plan_with_schema(&pipeline, options, input.schema().clone()).unwrap();
        execute_with(&plan, &input, sinks)
    }

    fn run(yaml: &str, options: &RunOptions) -> (Result<RunReport>, MemorySinks) {
        let sinks = MemorySinks::new();
        (run_into(yaml, options, &sinks), sinks)
    }

    /// Sinks that accept every write and fail to finalize.
    struct UnwritableSinks;

    struct UnwritableSink(PathBuf);

    impl TableSink for UnwritableSink {
        fn write(&mut self, _df: &DataFrame) -> Result<()> {
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<()> {
            Err(PrepError::io(&self.0, "disk full"))
        }
    }

    impl SinkFactory for UnwritableSinks {
        fn create(&self, target: &FileRef) -> Result<Box<dyn TableSink>> {
            Ok(Box::new(UnwritableSink(target.path.clone())))
        }
    }

    const QUARANTINE: &str = r"
inputs: [{ path: users.csv }]
steps:
  - type: validate
    mode: quarantine
    checks:
      - { name: email, unique: true }
      - { name: age, range: [0, 120] }
  - { type: select, columns: [id, age] }
outputs: [{ path: clean.csv }]
runtime: { chunk_rows: 2 }
";

    #[test]
    fn test_quarantine_run_reports_and_writes_both_outputs() {
        for streaming in [false, true] {
            let options = RunOptions {
                streaming,
                memory_limit: None,
            };
            let (report, sinks) = run(QUARANTINE, &options);
            let report = report.unwrap();

            assert_eq!(report.rows_read, 6);
            assert_eq!(report.rows_written, 3);
            assert_eq!(report.quarantined(), 3);
            assert_eq!(report.chunks_read, if streaming { 3 } else { 1 });
            let validate = &report.steps[0];
            assert_eq!((validate.rows_in, validate.rows_out), (6, 3));
            assert_eq!(validate.violations.len(), 2);

            let clean = sinks.get("clean.csv").unwrap();
            assert_eq!(clean.get_column_names_str(), ["id", "age"]);
            let quarantined = sinks.get("clean_quarantine.csv").unwrap();
            assert_eq!(i64s(&quarantined, "id"), [Some(3), Some(4), Some(5)]);
            assert_eq!(
                texts(&quarantined, "email")[1].as_deref(),
                Some("duplicate@example.com")
            );
            assert_eq!(
                texts(&quarantined, "_violation_check"),
                [
                    Some("age:range".to_owned()),
                    Some("email:unique".to_owned()),
                    Some("age:range".to_owned()),
                ]
            );
        }
    }

    #[test]
    fn test_strict_failure_finishes_no_sink() {
        let yaml = QUARANTINE.replace("mode: quarantine", "mode: strict");
        let (report, sinks) = run(&yaml, &RunOptions::default());
        let err = report.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(sinks.paths().is_empty());
    }

    #[test]
    fn test_streaming_fit_matches_materialized() {
        let yaml = r"
inputs: [{ path: users.csv }]
steps:
  - type: validate
    mode: quarantine
    checks: [{ name: age, range: [0, 120] }]
  - type: features
    config:
      - { column: age, transform: standard_scale }
      - { column: segment, transform: one_hot_encode }
  - { type: select, columns: [id, age, segment_B] }
outputs: [{ path: features.csv }]
runtime: { chunk_rows: 1 }
";
        let (materialized, sinks_a) = run(yaml, &RunOptions::default());
        let streaming_options = RunOptions {
            streaming: true,
            memory_limit: None,
        };
        let (streaming, sinks_b) = run(yaml, &streaming_options);
        materialized.unwrap();
        let streaming = streaming.unwrap();
        assert_eq!(streaming.chunks_read, 6);
        let a = sinks_a.get("features.csv").unwrap();
        let b = sinks_b.get("features.csv").unwrap();
        assert!(a.equals_missing(&b));
        assert_eq!(b.height(), 4);
    }

    #[test]
    fn test_group_by_totals() {
        let yaml = r"
inputs: [{ path: users.csv }]
steps:
  - type: group_by
    by: segment
    aggs: [{ column: age, func: sum, alias: total_age }, { column: id, func: count, alias: n }]
outputs: [{ path: totals.parquet }]
runtime: { streaming: true, chunk_rows: 4 }
";
        let (report, sinks) = run(yaml, &RunOptions::default());
        let report = report.unwrap();
        assert_eq!(report.strategy, Strategy::Streaming);
        let totals = sinks.get("totals.parquet").unwrap();
        assert_eq!(texts(&totals, "segment"), [Some("A".to_owned()), Some("B".to_owned())]);
        assert_eq!(f64s(&totals, "total_age"), [Some(175.0), Some(127.0)]);
        assert_eq!(i64s(&totals, "n"), [Some(3), Some(3)]);
    }

    #[test]
    fn test_state_file_lands_only_with_outputs() {
        for streaming in [false, true] {
            let dir = tempfile::TempDir::new().unwrap();
            let state_path = dir.path().join("scaler.json");
            let yaml = format!(
                r"
inputs: [{{ path: users.csv }}]
steps:
  - type: features
    state_path: '{}'
    config: [{{ column: age, transform: standard_scale }}]
outputs: [{{ path: features.csv }}]
runtime: {{ chunk_rows: 2 }}
",
                state_path.display()
            );
            let options = RunOptions {
                streaming,
                memory_limit: None,
            };

            let err = run_into(&yaml, &options, &UnwritableSinks).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Io);
            assert!(!state_path.exists());
            assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

            let (report, _) = run(&yaml, &options);
            assert_eq!(report.unwrap().state_files, [state_path.clone()]);
            assert!(state_path.exists());
        }
    }

    #[test]
    fn test_summary_mentions_quarantine() {
        let (report, _) = run(QUARANTINE, &RunOptions::default());
        let summary = report.unwrap().summary();
        assert!(summary.contains("6 rows read"));
        assert!(summary.contains("3 rows quarantined"));
        assert!(summary.contains("email:unique x1"));
    }
}
