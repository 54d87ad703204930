//! End-to-end pipeline runs over the CSV fixtures in `testdata/`.
//!
//! Every test writes its pipeline file and outputs into a fresh temporary
//! directory; fixtures are only ever read.

use mlprep::error::{ErrorKind, PrepError};
use mlprep::io::source::read_schema;
use mlprep::io::{ChunkSource as _, FileInputs, FileRef, Format, SourceFactory as _};
use mlprep::pipeline::{self, OutputRole, RunOptions};
use mlprep::state::FeatureState;
use polars::prelude::{DataFrame, DataType};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
}

fn write_pipeline(dir: &TempDir, yaml: &str) -> PathBuf {
    let path = dir.path().join("pipeline.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

fn read_csv(path: &Path) -> DataFrame {
    let input = FileRef::new(path, Format::Csv);
    let schema = read_schema(&input).unwrap();
    let mut source = FileInputs::new(vec![input], schema).open(None).unwrap();
    source.next_chunk().unwrap().unwrap()
}

fn ints(df: &DataFrame, name: &str) -> Vec<Option<i64>> {
    df.column(name).unwrap().i64().unwrap().into_iter().collect()
}

fn floats(df: &DataFrame, name: &str) -> Vec<Option<f64>> {
    let column = df.column(name).unwrap().cast(&DataType::Float64).unwrap();
    column.f64().unwrap().into_iter().collect()
}

fn strs(df: &DataFrame, name: &str) -> Vec<Option<String>> {
    df.column(name)
        .unwrap()
        .str()
        .unwrap()
        .into_iter()
        .map(|v| v.map(str::to_owned))
        .collect()
}

fn assert_close(actual: Option<f64>, expected: f64) {
    let actual = actual.unwrap();
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

fn customer_checks_pipeline(dir: &TempDir, mode: &str, streaming: bool) -> PathBuf {
    write_pipeline(
        dir,
        &format!(
            "name: customers\n\
             inputs:\n  - path: '{input}'\n\
             steps:\n\
             \x20 - type: validate\n\
             \x20   mode: {mode}\n\
             \x20   checks:\n\
             \x20     - {{ column: email, unique: true }}\n\
             \x20     - {{ column: age, range: [0, 120] }}\n\
             outputs:\n  - path: '{output}'\n\
             runtime:\n  streaming: {streaming}\n  chunk_rows: 2\n",
            input = fixture("customers.csv").display(),
            output = dir.path().join("clean.csv").display(),
        ),
    )
}

#[test]
fn test_quarantine_splits_duplicates_and_out_of_range_rows() {
    let dir = TempDir::new().unwrap();
    let pipeline = customer_checks_pipeline(&dir, "quarantine", false);

    let report = pipeline::run(&pipeline, &RunOptions::default()).unwrap();
    assert_eq!(report.rows_read, 6);
    assert_eq!(report.rows_written, 3);
    assert_eq!(report.quarantined(), 3);

    let clean = read_csv(&dir.path().join("clean.csv"));
    assert_eq!(ints(&clean, "id"), vec![Some(1), Some(2), Some(6)]);
    assert_eq!(
        strs(&clean, "email").get(1).cloned().flatten().as_deref(),
        Some("duplicate@example.com")
    );

    let quarantine_path = dir.path().join("clean_quarantine.csv");
    let quarantine = read_csv(&quarantine_path);
    assert_eq!(ints(&quarantine, "id"), vec![Some(3), Some(4), Some(5)]);
    assert_eq!(
        strs(&quarantine, "_violation_column"),
        vec![
            Some("age".to_owned()),
            Some("email".to_owned()),
            Some("age".to_owned())
        ]
    );
    assert_eq!(
        strs(&quarantine, "_violation_check"),
        vec![
            Some("age:range".to_owned()),
            Some("email:unique".to_owned()),
            Some("age:range".to_owned())
        ]
    );

    let roles: Vec<OutputRole> = report.outputs.iter().map(|o| o.role).collect();
    assert_eq!(roles, vec![OutputRole::Output, OutputRole::Quarantine]);
}

#[test]
fn test_quarantine_is_identical_when_streaming() {
    let materialized_dir = TempDir::new().unwrap();
    let streaming_dir = TempDir::new().unwrap();
    let materialized = customer_checks_pipeline(&materialized_dir, "quarantine", false);
    let streaming = customer_checks_pipeline(&streaming_dir, "quarantine", true);

    pipeline::run(&materialized, &RunOptions::default()).unwrap();
    let report = pipeline::run(&streaming, &RunOptions::default()).unwrap();
    assert_eq!(report.chunk_rows, Some(2));
    assert_eq!(report.chunks_read, 3);

    for name in ["clean.csv", "clean_quarantine.csv"] {
        let expected = read_csv(&materialized_dir.path().join(name));
        let actual = read_csv(&streaming_dir.path().join(name));
        assert!(
            actual.equals_missing(&expected),
            "{name}: {actual} differs from {expected}"
        );
    }
}

#[test]
fn test_strict_mode_fails_without_writing_outputs() {
    let dir = TempDir::new().unwrap();
    let pipeline = customer_checks_pipeline(&dir, "strict", false);

    let err = pipeline::run(&pipeline, &RunOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    match err {
        PrepError::Validation { check, row, .. } => {
            assert_eq!(check, "age:range");
            assert_eq!(row, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!dir.path().join("clean.csv").exists());
    assert!(!dir.path().join("clean_quarantine.csv").exists());
}

#[test]
fn test_strict_mode_fails_when_streaming_too() {
    let dir = TempDir::new().unwrap();
    let pipeline = customer_checks_pipeline(&dir, "strict", false);
    let options = RunOptions {
        streaming: true,
        memory_limit: None,
    };

    let err = pipeline::run(&pipeline, &options).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(!dir.path().join("clean.csv").exists());
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "pipeline.yaml")
        .collect();
    assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
}

fn features_pipeline(dir: &TempDir, input: &Path, output: &str, state: &Path) -> PathBuf {
    write_pipeline(
        dir,
        &format!(
            "inputs:\n  - path: '{input}'\n\
             steps:\n\
             \x20 - type: features\n\
             \x20   state_path: '{state}'\n\
             \x20   config:\n\
             \x20     - {{ column: value, transform: standard_scale }}\n\
             \x20     - {{ column: category, transform: one_hot_encode }}\n\
             outputs:\n  - path: '{output}'\n",
            input = input.display(),
            state = state.display(),
            output = dir.path().join(output).display(),
        ),
    )
}

#[test]
fn test_feature_state_fits_once_and_reapplies() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("state").join("features.json");

    let fit = features_pipeline(&dir, &fixture("measurements.csv"), "fit.csv", &state_path);
    let report = pipeline::run(&fit, &RunOptions::default()).unwrap();
    assert_eq!(report.state_files, vec![state_path.clone()]);

    let fitted = read_csv(&dir.path().join("fit.csv"));
    assert_eq!(
        fitted.get_column_names_str(),
        vec!["id", "value", "category_A", "category_B"]
    );
    let scaled = floats(&fitted, "value");
    assert_close(scaled.first().copied().flatten(), -1.0);
    assert_close(scaled.get(1).copied().flatten(), 0.0);
    assert_close(scaled.get(2).copied().flatten(), 1.0);
    assert_eq!(ints(&fitted, "category_A"), vec![Some(1), Some(0), Some(1)]);
    assert_eq!(ints(&fitted, "category_B"), vec![Some(0), Some(1), Some(0)]);

    let saved = std::fs::read_to_string(&state_path).unwrap();
    let state = FeatureState::load(&state_path).unwrap();
    assert_eq!(state.rows_fitted, 3);

    // Second run on new data loads the state instead of refitting.
    let apply = features_pipeline(
        &dir,
        &fixture("measurements_new.csv"),
        "apply.csv",
        &state_path,
    );
    let report = pipeline::run(&apply, &RunOptions::default()).unwrap();
    assert!(report.state_files.is_empty());
    assert_eq!(std::fs::read_to_string(&state_path).unwrap(), saved);

    let applied = read_csv(&dir.path().join("apply.csv"));
    let scaled = floats(&applied, "value");
    assert_close(scaled.first().copied().flatten(), 1.0);
    assert_close(scaled.get(1).copied().flatten(), 2.0);
    // C was never seen while fitting.
    assert_eq!(ints(&applied, "category_A"), vec![Some(0), Some(0)]);
    assert_eq!(ints(&applied, "category_B"), vec![Some(0), Some(1)]);
}

#[test]
fn test_corrupt_state_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("features.json");
    std::fs::write(&state_path, "{ not json").unwrap();
    let pipeline = features_pipeline(&dir, &fixture("measurements.csv"), "out.csv", &state_path);

    let err = pipeline::run(&pipeline, &RunOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert!(!dir.path().join("out.csv").exists());
}

#[test]
fn test_group_by_sums_per_key() {
    let dir = TempDir::new().unwrap();
    let pipeline = write_pipeline(
        &dir,
        &format!(
            "inputs:\n  - path: '{input}'\n\
             steps:\n\
             \x20 - type: group_by\n\
             \x20   by: group_key\n\
             \x20   aggs:\n\
             \x20     - {{ column: b, func: sum, alias: sum_b }}\n\
             \x20     - {{ column: b, func: count, alias: n }}\n\
             outputs:\n  - path: '{output}'\n",
            input = fixture("sales.csv").display(),
            output = dir.path().join("sums.csv").display(),
        ),
    );

    pipeline::run(&pipeline, &RunOptions::default()).unwrap();
    let sums = read_csv(&dir.path().join("sums.csv"));
    assert_eq!(
        strs(&sums, "group_key"),
        vec![Some("k1".to_owned()), Some("k2".to_owned())]
    );
    assert_eq!(ints(&sums, "sum_b"), vec![Some(120), Some(26)]);
    assert_eq!(ints(&sums, "n"), vec![Some(4), Some(3)]);
}

#[test]
fn test_select_of_missing_column_fails_before_any_io() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.csv");
    let pipeline = write_pipeline(
        &dir,
        &format!(
            "inputs:\n  - path: '{input}'\n\
             schema:\n  id: int64\n  email: utf8\n\
             steps:\n  - {{ type: select, columns: [id, salary] }}\n\
             outputs:\n  - path: '{output}'\n",
            input = dir.path().join("does_not_exist.csv").display(),
            output = output.display(),
        ),
    );

    let err = pipeline::check(&pipeline).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Schema);
    assert!(err.to_string().contains("salary"), "{err}");

    let err = pipeline::run(&pipeline, &RunOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Schema);
    assert!(!output.exists());
}

#[test]
fn test_unknown_step_type_is_config_error() {
    let dir = TempDir::new().unwrap();
    let pipeline = write_pipeline(
        &dir,
        &format!(
            "inputs:\n  - path: '{input}'\n\
             steps:\n  - {{ type: pivot, columns: [id] }}\n\
             outputs:\n  - path: out.csv\n",
            input = fixture("customers.csv").display(),
        ),
    );

    let err = pipeline::check(&pipeline).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_lineage_records_input_digest() {
    let dir = TempDir::new().unwrap();
    let lineage = dir.path().join("lineage.json");
    let pipeline = write_pipeline(
        &dir,
        &format!(
            "inputs:\n  - path: '{input}'\n\
             outputs:\n  - path: '{output}'\n\
             runtime:\n  lineage_path: '{lineage}'\n",
            input = fixture("sales.csv").display(),
            output = dir.path().join("copy.parquet").display(),
            lineage = lineage.display(),
        ),
    );

    let report = pipeline::run(&pipeline, &RunOptions::default()).unwrap();
    let record: mlprep::integrity::LineageRecord =
        serde_json::from_str(&std::fs::read_to_string(&lineage).unwrap()).unwrap();
    assert_eq!(record.run_id, report.run_id);
    let input = record.inputs.first().unwrap();
    assert_eq!(
        input.sha256,
        mlprep::integrity::compute_file_hash(&fixture("sales.csv")).unwrap()
    );
    let output = record.outputs.first().unwrap();
    assert_eq!(output.rows, 7);
    assert_eq!(output.file.format, Some(Format::Parquet));
}
